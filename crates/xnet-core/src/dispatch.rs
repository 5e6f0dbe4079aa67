//! Opcode dispatch: map request opcodes to feature handlers.
//!
//! The [`FeatureTable`] maps opcodes below [`MAX_FEATURES`] to
//! [`FeatureHandler`] implementations with insert-if-absent semantics, and
//! keeps the bounded connect/disconnect [`LifecycleCallback`] lists addons use
//! to observe connections.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::TcpStream;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{XnetError, report};
use crate::framing;
use crate::server::ServerHandle;

/// Number of addressable opcodes.
pub const MAX_FEATURES: usize = 4096;

/// Maximum callbacks per lifecycle event.
pub const MAX_CALLBACKS: usize = 16;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Context provided to every feature handler.
///
/// The socket is in blocking mode with the configured I/O timeout while the
/// handler runs.
pub struct HandlerContext<'a> {
    server: &'a ServerHandle,
    connection: &'a Connection,
    stream: &'a TcpStream,
    opcode: u16,
}

impl<'a> HandlerContext<'a> {
    /// Build a context for one request.
    pub fn new(
        server: &'a ServerHandle,
        connection: &'a Connection,
        stream: &'a TcpStream,
        opcode: u16,
    ) -> Self {
        Self {
            server,
            connection,
            stream,
            opcode,
        }
    }

    /// Opcode of the request being served.
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// Server the request arrived on.
    pub fn server(&self) -> &ServerHandle {
        self.server
    }

    /// Connection the request arrived on.
    pub fn connection(&self) -> &Connection {
        self.connection
    }

    /// Client socket, for handlers that frame their own I/O.
    pub fn stream(&self) -> &TcpStream {
        self.stream
    }

    /// Read a network-order `u16`.
    pub fn read_u16(&mut self) -> Result<u16, XnetError> {
        Ok(framing::read_u16(&mut self.stream)?)
    }

    /// Read a network-order `u32`.
    pub fn read_u32(&mut self) -> Result<u32, XnetError> {
        Ok(framing::read_u32(&mut self.stream)?)
    }

    /// Read a 4-byte length-prefixed field of at most `capacity` bytes.
    pub fn read_field(&mut self, capacity: usize) -> Result<Vec<u8>, XnetError> {
        Ok(framing::read_field(&mut self.stream, capacity)?)
    }

    /// Read a 2-byte length-prefixed field of at most `capacity` bytes.
    pub fn read_short_field(&mut self, capacity: usize) -> Result<Vec<u8>, XnetError> {
        Ok(framing::read_short_field(&mut self.stream, capacity)?)
    }

    /// Respond with this request's opcode, `status` and an optional body.
    pub fn respond(&mut self, status: u16, body: Option<&[u8]>) -> Result<(), XnetError> {
        Ok(framing::write_response(
            &mut self.stream,
            self.opcode,
            status,
            body,
        )?)
    }

    /// Write raw bytes.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), XnetError> {
        use std::io::Write;
        self.stream
            .write_all(bytes)
            .map_err(|e| XnetError::Frame(e.into()))
    }
}

/// A feature bound to one opcode.
pub trait FeatureHandler: Send + Sync {
    /// Serve one request. The opcode has already been consumed.
    fn perform(&self, ctx: &mut HandlerContext<'_>) -> Result<(), XnetError>;
}

/// Blanket implementation for closures.
impl<F> FeatureHandler for F
where
    F: Fn(&mut HandlerContext<'_>) -> Result<(), XnetError> + Send + Sync,
{
    fn perform(&self, ctx: &mut HandlerContext<'_>) -> Result<(), XnetError> {
        self(ctx)
    }
}

/// Run `handler`, reporting a failure instead of propagating it.
///
/// Returns `true` on success.
pub(crate) fn run_handler(handler: &dyn FeatureHandler, ctx: &mut HandlerContext<'_>) -> bool {
    match handler.perform(ctx) {
        Ok(()) => true,
        Err(e) => {
            report(&e, &format!("handler for opcode {}", ctx.opcode()));
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle callbacks
// ---------------------------------------------------------------------------

/// Connection lifecycle events observable by addons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// A client was accepted and registered.
    Connect,
    /// A client is about to be torn down.
    Disconnect,
}

impl LifecycleEvent {
    fn name(self) -> &'static str {
        match self {
            LifecycleEvent::Connect => "connect",
            LifecycleEvent::Disconnect => "disconnect",
        }
    }
}

/// Observer of connection lifecycle events.
pub trait LifecycleCallback: Send + Sync {
    /// Called on the event loop thread.
    fn notify(&self, server: &ServerHandle, connection: &Connection);
}

/// Blanket implementation for closures.
impl<F> LifecycleCallback for F
where
    F: Fn(&ServerHandle, &Connection) + Send + Sync,
{
    fn notify(&self, server: &ServerHandle, connection: &Connection) {
        self(server, connection);
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Routes opcodes to registered handlers.
pub struct FeatureTable {
    handlers: HashMap<u16, Arc<dyn FeatureHandler>>,
    callbacks: HashMap<LifecycleEvent, Vec<Arc<dyn LifecycleCallback>>>,
}

fn checked_opcode(opcode: usize) -> Result<u16, XnetError> {
    if opcode >= MAX_FEATURES {
        return Err(XnetError::OutOfRange {
            value: opcode,
            limit: MAX_FEATURES,
        });
    }
    // MAX_FEATURES fits in u16.
    Ok(opcode as u16)
}

impl FeatureTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }

    /// Bind `handler` to `opcode`. An existing binding is never replaced.
    pub fn insert<H: FeatureHandler + 'static>(
        &mut self,
        opcode: usize,
        handler: H,
    ) -> Result<(), XnetError> {
        let opcode = checked_opcode(opcode)?;
        match self.handlers.entry(opcode) {
            Entry::Occupied(_) => Err(XnetError::AlreadyBound(opcode)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(handler));
                tracing::debug!(opcode, "Feature registered");
                Ok(())
            }
        }
    }

    /// Unbind `opcode`.
    pub fn remove(&mut self, opcode: usize) -> Result<(), XnetError> {
        let opcode = checked_opcode(opcode)?;
        match self.handlers.remove(&opcode) {
            Some(_) => {
                tracing::debug!(opcode, "Feature removed");
                Ok(())
            }
            None => Err(XnetError::NotBound(opcode)),
        }
    }

    /// Handler bound to `opcode`, if any.
    pub fn lookup(&self, opcode: u16) -> Option<Arc<dyn FeatureHandler>> {
        self.handlers.get(&opcode).cloned()
    }

    /// Whether `opcode` has a handler.
    pub fn contains(&self, opcode: u16) -> bool {
        self.handlers.contains_key(&opcode)
    }

    /// Resolve and run the handler for the context's opcode.
    ///
    /// An unbound opcode is reported as [`XnetError::UnsupportedOpcode`]; a
    /// failing handler is reported and its error returned. Neither is fatal.
    pub fn dispatch(&self, ctx: &mut HandlerContext<'_>) -> Result<(), XnetError> {
        let Some(handler) = self.handlers.get(&ctx.opcode()) else {
            let err = XnetError::UnsupportedOpcode(ctx.opcode());
            report(&err, "dispatch");
            return Err(err);
        };
        let result = handler.perform(ctx);
        if let Err(e) = &result {
            report(e, &format!("handler for opcode {}", ctx.opcode()));
        }
        result
    }

    /// Bound opcodes in ascending order (useful for startup logging).
    pub fn registered_opcodes(&self) -> Vec<u16> {
        let mut opcodes: Vec<u16> = self.handlers.keys().copied().collect();
        opcodes.sort_unstable();
        opcodes
    }

    /// Append a lifecycle callback. Fails once [`MAX_CALLBACKS`] are registered
    /// for the event.
    pub fn register_callback<C: LifecycleCallback + 'static>(
        &mut self,
        event: LifecycleEvent,
        callback: C,
    ) -> Result<(), XnetError> {
        let list = self.callbacks.entry(event).or_default();
        if list.len() >= MAX_CALLBACKS {
            return Err(XnetError::CallbacksFull {
                event: event.name(),
            });
        }
        list.push(Arc::new(callback));
        Ok(())
    }

    /// Callbacks for `event` in registration order.
    pub fn callbacks(&self, event: LifecycleEvent) -> Vec<Arc<dyn LifecycleCallback>> {
        self.callbacks.get(&event).cloned().unwrap_or_default()
    }
}

impl Default for FeatureTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionTable;
    use crate::server::{Server, ServerConfig};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn noop(_: &mut HandlerContext<'_>) -> Result<(), XnetError> {
        Ok(())
    }

    /// Helper: a server handle, a live connection and the client end of its socket.
    struct Fixture {
        server: Server,
        table: ConnectionTable,
        client: std::net::TcpStream,
    }

    fn fixture() -> Fixture {
        let server = Server::create(ServerConfig::default().ephemeral_port()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let table = ConnectionTable::new(1);
        table.allocate(accepted, Duration::from_secs(60)).unwrap();
        Fixture {
            server,
            table,
            client,
        }
    }

    #[test]
    fn test_insert_if_absent() {
        let first = Arc::new(AtomicU32::new(0));
        let mut table = FeatureTable::new();
        let f = Arc::clone(&first);
        table
            .insert(7, move |_: &mut HandlerContext<'_>| {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let result = table.insert(7, noop);
        assert!(matches!(result, Err(XnetError::AlreadyBound(7))));
        assert_eq!(table.registered_opcodes(), vec![7]);

        // The first handler stays bound.
        let fx = fixture();
        let conn = fx.table.get(0).unwrap();
        let stream = conn.stream().unwrap();
        let handle = fx.server.handle();
        let mut ctx = HandlerContext::new(&handle, &conn, &stream, 7);
        table.dispatch(&mut ctx).unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_opcode_bounds() {
        let mut table = FeatureTable::new();
        assert!(table.insert(MAX_FEATURES - 1, noop).is_ok());
        assert!(matches!(
            table.insert(MAX_FEATURES, noop),
            Err(XnetError::OutOfRange { value: 4096, .. })
        ));
        assert!(matches!(
            table.remove(MAX_FEATURES),
            Err(XnetError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_remove_unbound() {
        let mut table = FeatureTable::new();
        assert!(matches!(table.remove(12), Err(XnetError::NotBound(12))));
        table.insert(12, noop).unwrap();
        table.remove(12).unwrap();
        assert!(!table.contains(12));
        assert!(table.insert(12, noop).is_ok(), "slot is free again");
    }

    #[test]
    fn test_dispatch_unsupported_opcode() {
        let table = FeatureTable::new();
        let fx = fixture();
        let conn = fx.table.get(0).unwrap();
        let stream = conn.stream().unwrap();
        let handle = fx.server.handle();
        let mut ctx = HandlerContext::new(&handle, &conn, &stream, 999);
        assert!(matches!(
            table.dispatch(&mut ctx),
            Err(XnetError::UnsupportedOpcode(999))
        ));
    }

    #[test]
    fn test_handler_failure_is_returned() {
        let mut table = FeatureTable::new();
        table
            .insert(3, |ctx: &mut HandlerContext<'_>| {
                Err(XnetError::Handler {
                    opcode: ctx.opcode(),
                    reason: "rejected".into(),
                })
            })
            .unwrap();
        let fx = fixture();
        let conn = fx.table.get(0).unwrap();
        let stream = conn.stream().unwrap();
        let handle = fx.server.handle();
        let mut ctx = HandlerContext::new(&handle, &conn, &stream, 3);
        assert!(matches!(
            table.dispatch(&mut ctx),
            Err(XnetError::Handler { opcode: 3, .. })
        ));
        let handler = table.lookup(3).unwrap();
        assert!(!run_handler(handler.as_ref(), &mut ctx));
    }

    #[test]
    fn test_context_framing_helpers() {
        let mut fx = fixture();
        let conn = fx.table.get(0).unwrap();
        let stream = conn.stream().unwrap();
        stream.set_nonblocking(false).unwrap();

        let mut request = 42u16.to_be_bytes().to_vec();
        request.extend_from_slice(&3u32.to_be_bytes());
        request.extend_from_slice(b"abc");
        fx.client.write_all(&request).unwrap();

        let handle = fx.server.handle();
        let mut ctx = HandlerContext::new(&handle, &conn, &stream, 5);
        assert_eq!(ctx.read_u16().unwrap(), 42);
        assert_eq!(ctx.read_field(8).unwrap(), b"abc");
        ctx.respond(0, Some(b"ok")).unwrap();

        let mut response = [0u8; 10];
        fx.client.read_exact(&mut response).unwrap();
        assert_eq!(response, [0, 5, 0, 0, 0, 0, 0, 2, b'o', b'k']);
    }

    #[test]
    fn test_callbacks_bounded_and_ordered() {
        let mut table = FeatureTable::new();
        for _ in 0..MAX_CALLBACKS {
            table
                .register_callback(LifecycleEvent::Connect, |_: &ServerHandle, _: &Connection| {})
                .unwrap();
        }
        assert!(matches!(
            table.register_callback(LifecycleEvent::Connect, |_: &ServerHandle, _: &Connection| {}),
            Err(XnetError::CallbacksFull { event: "connect" })
        ));
        assert_eq!(table.callbacks(LifecycleEvent::Connect).len(), MAX_CALLBACKS);
        assert!(table.callbacks(LifecycleEvent::Disconnect).is_empty());
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut table = FeatureTable::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            table
                .register_callback(
                    LifecycleEvent::Disconnect,
                    move |_: &ServerHandle, _: &Connection| order.lock().push(i),
                )
                .unwrap();
        }

        let fx = fixture();
        let conn = fx.table.get(0).unwrap();
        let handle = fx.server.handle();
        for callback in table.callbacks(LifecycleEvent::Disconnect) {
            callback.notify(&handle, &conn);
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
