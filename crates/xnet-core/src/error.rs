//! Error taxonomy and diagnostic reporting.
//!
//! Every fallible operation in the core returns [`XnetError`]. Each variant maps
//! onto one [`ErrorKind`] and a stable numeric status code:
//!
//! | Range          | Category   |
//! |----------------|------------|
//! | `1001..=2500`  | `GENERAL`  |
//! | `2501..=3500`  | `SERVER`   |
//! | `3501..=4500`  | `PROTOCOL` |
//! | `4501..`       | `STATE`    |
//!
//! Status `0` means success and is represented by `Ok(())`.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use nix::errno::Errno;

use crate::framing::FrameError;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Out-of-range or malformed input. Usually recovered by substituting a default.
    InvalidArgument,
    /// Allocation failure, full connection table or full callback list.
    ResourceExhausted,
    /// A socket or descriptor syscall failed.
    SocketFailure,
    /// The peer sent something the server refuses to trust.
    ProtocolViolation,
    /// An operation was attempted on an object in the wrong state.
    StateViolation,
}

/// Errors produced by the XNet core.
#[derive(Debug, thiserror::Error)]
pub enum XnetError {
    /// The configured address is not a valid IPv4 address.
    #[error("invalid IPv4 address {ip:?}")]
    InvalidIp {
        /// The rejected value.
        ip: String,
    },

    /// The configured port is outside the allowed range.
    #[error("port {port} outside {min}..={max}", min = crate::MIN_PORT, max = crate::MAX_PORT)]
    InvalidPort {
        /// The rejected value.
        port: u32,
    },

    /// The configured backlog exceeds the maximum.
    #[error("backlog {backlog} exceeds {max}", max = crate::MAX_BACKLOG)]
    InvalidBacklog {
        /// The rejected value.
        backlog: u32,
    },

    /// The configured idle timeout exceeds the maximum.
    #[error("timeout of {seconds}s exceeds {max}s", max = crate::MAX_TIMEOUT_SECS)]
    InvalidTimeout {
        /// The rejected value.
        seconds: u64,
    },

    /// A numeric argument is out of range.
    #[error("value {value} out of range (limit {limit})")]
    OutOfRange {
        /// The rejected value.
        value: usize,
        /// The exclusive upper bound.
        limit: usize,
    },

    /// A kernel object (epoll, timerfd, signalfd, signal mask) could not be created.
    #[error("failed to create {what}")]
    Create {
        /// The object being created.
        what: &'static str,
        /// Underlying errno.
        #[source]
        source: Errno,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread")]
    Spawn(#[source] std::io::Error),

    /// The listening address could not be resolved.
    #[error("failed to resolve address {0}")]
    AddressResolution(String),

    /// A generic socket operation failed.
    #[error("socket operation {op} failed")]
    Socket {
        /// The operation that failed.
        op: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Setting a socket option failed.
    #[error("failed to set socket option {option}")]
    SocketOption {
        /// The option being set.
        option: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Binding the listening socket failed.
    #[error("failed to bind {addr}")]
    Bind {
        /// The address being bound.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Listening on the bound socket failed.
    #[error("failed to listen")]
    Listen(#[source] std::io::Error),

    /// Accepting a pending client failed.
    #[error("failed to accept client")]
    Accept(#[source] std::io::Error),

    /// Every connection slot is occupied.
    #[error("client limit of {max} reached")]
    ClientLimitReached {
        /// The configured maximum.
        max: usize,
    },

    /// Registering, re-arming or removing a descriptor in the readiness set failed.
    #[error("readiness registration failed for fd {fd}")]
    Poll {
        /// The descriptor involved.
        fd: RawFd,
        /// Underlying errno.
        #[source]
        source: Errno,
    },

    /// Arming or reading a session timer failed.
    #[error("session timer {op} failed")]
    Timer {
        /// The timer operation.
        op: &'static str,
        /// Underlying errno.
        #[source]
        source: Errno,
    },

    /// A lifecycle callback list has no room left.
    #[error("{event} callback list is full")]
    CallbacksFull {
        /// The lifecycle event name.
        event: &'static str,
    },

    /// No handler is bound to the received opcode.
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u16),

    /// A framed read or write failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A feature handler reported a failure.
    #[error("handler for opcode {opcode} failed: {reason}")]
    Handler {
        /// The opcode being served.
        opcode: u16,
        /// Handler-supplied description.
        reason: String,
    },

    /// The opcode already has a handler.
    #[error("opcode {0} is already bound")]
    AlreadyBound(u16),

    /// The opcode has no handler to remove.
    #[error("opcode {0} is not bound")]
    NotBound(u16),

    /// The connection has a request queued or executing.
    #[error("connection in slot {0} is busy")]
    ConnectionBusy(usize),

    /// The connection slot is not in use.
    #[error("connection in slot {0} is not active")]
    InactiveConnection(usize),

    /// `start` was called while the server is already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// The work queue no longer accepts tasks.
    #[error("work queue is shut down")]
    QueueShutdown,
}

impl XnetError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidIp { .. }
            | Self::InvalidPort { .. }
            | Self::InvalidBacklog { .. }
            | Self::InvalidTimeout { .. }
            | Self::OutOfRange { .. } => ErrorKind::InvalidArgument,
            Self::Create { .. }
            | Self::Spawn(_)
            | Self::ClientLimitReached { .. }
            | Self::CallbacksFull { .. } => ErrorKind::ResourceExhausted,
            Self::AddressResolution(_)
            | Self::Socket { .. }
            | Self::SocketOption { .. }
            | Self::Bind { .. }
            | Self::Listen(_)
            | Self::Accept(_)
            | Self::Poll { .. }
            | Self::Timer { .. } => ErrorKind::SocketFailure,
            Self::Frame(FrameError::Io(_)) => ErrorKind::SocketFailure,
            Self::UnsupportedOpcode(_) | Self::Frame(_) | Self::Handler { .. } => {
                ErrorKind::ProtocolViolation
            }
            Self::AlreadyBound(_)
            | Self::NotBound(_)
            | Self::ConnectionBusy(_)
            | Self::InactiveConnection(_)
            | Self::AlreadyRunning
            | Self::QueueShutdown => ErrorKind::StateViolation,
        }
    }

    /// Stable positive status code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::OutOfRange { .. } => 1003,
            Self::Spawn(_) => 1005,
            Self::AddressResolution(_) => 2501,
            Self::Socket { .. } => 2502,
            Self::SocketOption { .. } => 2503,
            Self::Bind { .. } => 2504,
            Self::Listen(_) => 2505,
            Self::Accept(_) => 2506,
            Self::ClientLimitReached { .. } => 2507,
            Self::InvalidPort { .. } => 2508,
            Self::Create { .. } => 2509,
            Self::InvalidIp { .. } => 2510,
            Self::InvalidBacklog { .. } => 2511,
            Self::InvalidTimeout { .. } => 2512,
            Self::Poll { .. } => 2513,
            Self::Timer { .. } => 2514,
            Self::CallbacksFull { .. } => 2515,
            Self::UnsupportedOpcode(_) => 3501,
            Self::Frame(_) => 3502,
            Self::Handler { .. } => 3503,
            Self::AlreadyBound(_) => 4501,
            Self::NotBound(_) => 4502,
            Self::ConnectionBusy(_) => 4503,
            Self::InactiveConnection(_) => 4504,
            Self::AlreadyRunning => 4505,
            Self::QueueShutdown => 4506,
        }
    }

    /// Category tag derived from the status code.
    pub fn category(&self) -> &'static str {
        category(self.code())
    }
}

/// Category tag for a numeric status code.
pub fn category(code: u16) -> &'static str {
    match code {
        0..=2500 => "GENERAL",
        2501..=3500 => "SERVER",
        3501..=4500 => "PROTOCOL",
        _ => "STATE",
    }
}

/// Write an error to the diagnostic stream with its category, code and context.
///
/// Recoverable input problems and protocol violations are logged at `warn`;
/// everything else at `error`.
pub fn report(err: &XnetError, context: &str) {
    let code = err.code();
    let category = err.category();
    match err.kind() {
        ErrorKind::InvalidArgument | ErrorKind::ProtocolViolation => {
            tracing::warn!(category, code, context, "{err}");
        }
        _ => {
            tracing::error!(category, code, context, "{err}");
        }
    }
}
