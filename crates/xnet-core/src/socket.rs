//! TCP socket setup for the listener and accepted clients.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

use crate::error::XnetError;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_RETRIES: u32 = 3;

/// Create a non-blocking listening socket bound to `addr` with `SO_REUSEADDR`.
///
/// The socket is bound but not yet listening.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<Socket, XnetError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| XnetError::Socket {
            op: "socket",
            source,
        })?;

    socket
        .set_reuse_address(true)
        .map_err(|source| XnetError::SocketOption {
            option: "SO_REUSEADDR",
            source,
        })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| XnetError::SocketOption {
            option: "O_NONBLOCK",
            source,
        })?;
    socket
        .bind(&addr.into())
        .map_err(|source| XnetError::Bind { addr, source })?;

    Ok(socket)
}

/// Start listening with the given backlog.
pub(crate) fn listen(socket: &Socket, backlog: u32) -> Result<(), XnetError> {
    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(XnetError::Listen)
}

/// Address the socket is bound to.
pub(crate) fn local_addr(socket: &Socket) -> Result<SocketAddr, XnetError> {
    let addr = socket.local_addr().map_err(|source| XnetError::Socket {
        op: "getsockname",
        source,
    })?;
    addr.as_socket()
        .ok_or_else(|| XnetError::AddressResolution(format!("{addr:?}")))
}

/// Apply per-client options: `TCP_NODELAY` and TCP keepalive.
pub(crate) fn configure_stream(stream: &TcpStream) -> Result<(), XnetError> {
    stream
        .set_nodelay(true)
        .map_err(|source| XnetError::SocketOption {
            option: "TCP_NODELAY",
            source,
        })?;

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);
    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .map_err(|source| XnetError::SocketOption {
            option: "SO_KEEPALIVE",
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_then_listen_accepts() {
        let socket = bind_listener(loopback()).unwrap();
        listen(&socket, 16).unwrap();
        let addr = local_addr(&socket).unwrap();
        assert_ne!(addr.port(), 0);

        let _client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let (accepted, peer) = socket.accept().unwrap();
        assert!(peer.as_socket().is_some());
        drop(accepted);
    }

    #[test]
    fn test_reuse_address_is_set() {
        let socket = bind_listener(loopback()).unwrap();
        assert!(socket.reuse_address().unwrap());
    }

    #[test]
    fn test_bind_conflict_reports_address() {
        let first = bind_listener(loopback()).unwrap();
        listen(&first, 4).unwrap();
        let taken = local_addr(&first).unwrap();

        match bind_listener(taken) {
            Err(XnetError::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected bind failure, got {other:?}"),
        }
    }

    #[test]
    fn test_client_options_applied() {
        let socket = bind_listener(loopback()).unwrap();
        listen(&socket, 4).unwrap();
        let client = TcpStream::connect(local_addr(&socket).unwrap()).unwrap();
        configure_stream(&client).unwrap();

        assert!(client.nodelay().unwrap(), "TCP_NODELAY should be enabled");
        assert!(SockRef::from(&client).keepalive().unwrap());
    }
}
