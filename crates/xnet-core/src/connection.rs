//! Fixed-capacity connection table with slot reuse.
//!
//! Slots are allocated once at construction and reused by index. Each slot's
//! mutable state sits behind its own mutex, so a "check busy, then close" on
//! the event loop and a "mark idle" on a worker can never interleave.

use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::XnetError;
use crate::session::Session;

/// Identifier of a session. Never reused, so it also tells apart successive
/// occupants of the same slot.
pub type SessionId = u64;

/// Atomic generator for monotonically increasing [`SessionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`SessionId`].
    pub fn next_id(&self) -> SessionId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) active: bool,
    pub(crate) busy: bool,
    pub(crate) stream: Option<Arc<TcpStream>>,
    pub(crate) session: Option<Arc<Session>>,
    pub(crate) peer: Option<SocketAddr>,
    /// First byte of an opcode whose second byte has not arrived yet.
    pub(crate) pending_opcode: Option<u8>,
}

impl SlotState {
    /// Whether the slot is active and still held by `session_id`.
    pub(crate) fn is_session(&self, session_id: SessionId) -> bool {
        self.active && self.session.as_ref().is_some_and(|s| s.id() == session_id)
    }
}

/// One client connection, addressed by its slot index.
pub struct Connection {
    slot: usize,
    state: Mutex<SlotState>,
}

impl Connection {
    fn vacant(slot: usize) -> Self {
        Self {
            slot,
            state: Mutex::new(SlotState::default()),
        }
    }

    /// Index of this connection in the table.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Whether the slot currently holds a client.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Whether a request for this connection is queued or executing.
    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Current session id, if active.
    pub fn session_id(&self) -> Option<SessionId> {
        self.state.lock().session.as_ref().map(|s| s.id())
    }

    /// Current session, if active.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().session.clone()
    }

    /// Remote address of the client, if active.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.lock().peer
    }

    /// Client socket, if active.
    pub fn stream(&self) -> Option<Arc<TcpStream>> {
        self.state.lock().stream.clone()
    }

    /// Raw descriptor of the client socket, if active.
    pub fn socket_fd(&self) -> Option<RawFd> {
        self.state.lock().stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }

    /// Mark the connection busy on behalf of `session_id`.
    ///
    /// Fails if the slot changed hands or a request is already in flight.
    pub(crate) fn try_mark_busy(&self, session_id: SessionId) -> bool {
        let mut state = self.state.lock();
        if !state.is_session(session_id) || state.busy {
            return false;
        }
        state.busy = true;
        true
    }

    /// Take the partial opcode byte left by an earlier readiness event.
    pub(crate) fn take_pending_opcode(&self, session_id: SessionId) -> Option<u8> {
        let mut state = self.state.lock();
        if state.is_session(session_id) {
            state.pending_opcode.take()
        } else {
            None
        }
    }

    /// Keep a partial opcode byte until the rest of the opcode arrives.
    pub(crate) fn set_pending_opcode(&self, session_id: SessionId, byte: Option<u8>) {
        let mut state = self.state.lock();
        if state.is_session(session_id) {
            state.pending_opcode = byte;
        }
    }

    /// Clear the busy flag if the slot is still held by `session_id`.
    pub(crate) fn mark_idle(&self, session_id: SessionId) {
        let mut state = self.state.lock();
        if state.is_session(session_id) {
            state.busy = false;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Connection")
            .field("slot", &self.slot)
            .field("active", &state.active)
            .field("busy", &state.busy)
            .field("peer", &state.peer)
            .finish()
    }
}

/// Point-in-time view of an active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Table slot.
    pub slot: usize,
    /// Session id.
    pub session_id: SessionId,
    /// Remote address.
    pub peer: Option<SocketAddr>,
    /// Request queued or executing.
    pub busy: bool,
    /// Next idle-timeout expiry, if the session expires at all.
    pub deadline: Option<Instant>,
}

/// Fixed-capacity table of connection slots.
pub struct ConnectionTable {
    slots: Vec<Arc<Connection>>,
    active: AtomicUsize,
    ids: IdGenerator,
    alloc: Mutex<()>,
}

impl ConnectionTable {
    /// Create a table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|slot| Arc::new(Connection::vacant(slot))).collect(),
            active: AtomicUsize::new(0),
            ids: IdGenerator::new(),
            alloc: Mutex::new(()),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of active connections.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Whether every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.active_count() >= self.capacity()
    }

    /// Slot by index, active or not.
    pub fn get(&self, slot: usize) -> Option<Arc<Connection>> {
        self.slots.get(slot).cloned()
    }

    /// Place `stream` in the first free slot and start its session.
    ///
    /// The socket is switched to non-blocking mode.
    pub fn allocate(
        &self,
        stream: TcpStream,
        timeout: Duration,
    ) -> Result<Arc<Connection>, XnetError> {
        let _alloc = self.alloc.lock();
        if self.is_full() {
            return Err(XnetError::ClientLimitReached {
                max: self.capacity(),
            });
        }

        let Some(conn) = self.slots.iter().find(|c| !c.is_active()) else {
            return Err(XnetError::ClientLimitReached {
                max: self.capacity(),
            });
        };

        stream
            .set_nonblocking(true)
            .map_err(|source| XnetError::SocketOption {
                option: "O_NONBLOCK",
                source,
            })?;
        let peer = stream.peer_addr().ok();
        let session = Session::new(self.ids.next_id(), timeout)?;

        {
            let mut state = conn.state.lock();
            *state = SlotState {
                active: true,
                busy: false,
                stream: Some(Arc::new(stream)),
                session: Some(Arc::new(session)),
                peer,
                pending_opcode: None,
            };
        }
        self.active.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(slot = conn.slot, ?peer, "Allocated connection slot");
        Ok(Arc::clone(conn))
    }

    /// Find the active connection owning client socket `fd`.
    pub fn find_by_socket(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.slots
            .iter()
            .find(|c| {
                let state = c.state.lock();
                state.active && state.stream.as_ref().is_some_and(|s| s.as_raw_fd() == fd)
            })
            .cloned()
    }

    /// Find the active connection owning session timer `fd`.
    pub fn find_by_session_timer(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.slots
            .iter()
            .find(|c| {
                let state = c.state.lock();
                state.active && state.session.as_ref().is_some_and(|s| s.timer_fd() == fd)
            })
            .cloned()
    }

    /// Release a connection and free its slot.
    ///
    /// `before_teardown` runs while the socket and session are still open, so
    /// it can notify observers and remove the descriptors from the readiness
    /// set. Returns `Ok(false)` if the connection was already released and
    /// [`XnetError::ConnectionBusy`] if a request is queued or executing.
    pub fn release<F>(&self, conn: &Connection, before_teardown: F) -> Result<bool, XnetError>
    where
        F: FnOnce(&Connection),
    {
        {
            let mut state = conn.state.lock();
            if !state.active {
                return Ok(false);
            }
            if state.busy {
                return Err(XnetError::ConnectionBusy(conn.slot));
            }
            // Holding the busy flag keeps workers away while the lock is released.
            state.busy = true;
        }

        before_teardown(conn);

        let (stream, peer) = {
            let mut state = conn.state.lock();
            let released = std::mem::take(&mut *state);
            (released.stream, released.peer)
        };
        if let Some(stream) = stream {
            // Other clones of the stream may outlive the slot; shutdown makes
            // the close visible to the peer immediately.
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.active.fetch_sub(1, Ordering::AcqRel);

        tracing::debug!(slot = conn.slot, ?peer, "Released connection slot");
        Ok(true)
    }

    /// Snapshot of every active connection.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.slots
            .iter()
            .filter_map(|c| {
                let state = c.state.lock();
                let session = state.session.as_ref()?;
                state.active.then(|| ConnectionInfo {
                    slot: c.slot,
                    session_id: session.id(),
                    peer: state.peer,
                    busy: state.busy,
                    deadline: session.deadline(),
                })
            })
            .collect()
    }

    /// Dump the table at debug level.
    pub fn log_connections(&self) {
        let snapshot = self.snapshot();
        tracing::debug!(
            active = snapshot.len(),
            capacity = self.capacity(),
            "Connection table"
        );
        for info in &snapshot {
            let remaining = info
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()));
            tracing::debug!(
                slot = info.slot,
                session = info.session_id,
                peer = ?info.peer,
                busy = info.busy,
                expires_in = ?remaining,
                "Connection"
            );
        }
    }
}

/// Switches a socket to blocking mode with I/O timeouts for its lifetime and
/// back to non-blocking on drop.
pub(crate) struct BlockingGuard<'a> {
    stream: &'a TcpStream,
}

impl<'a> BlockingGuard<'a> {
    pub(crate) fn new(stream: &'a TcpStream, timeout: Duration) -> std::io::Result<Self> {
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        stream.set_nonblocking(false)?;
        let guard = Self { stream };
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(guard)
    }
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.stream.set_nonblocking(true) {
            tracing::warn!(fd = self.stream.as_raw_fd(), "Failed to restore non-blocking mode: {e}");
        }
    }
}
