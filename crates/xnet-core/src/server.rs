//! Server lifecycle and the event loop.
//!
//! A single loop thread owns readiness polling over four kinds of descriptor:
//! the listening socket, the signalfd, client sockets and session timers. It
//! accepts clients, reads each request's opcode and hands the request to the
//! worker pool. Client sockets are registered one-shot, so a socket stays out
//! of the readiness set until the worker serving it re-arms it. That keeps
//! requests on one connection strictly serialized.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use parking_lot::{Mutex, RwLock};
use socket2::Socket;

use crate::connection::{Connection, ConnectionInfo, ConnectionTable, SessionId};
use crate::dispatch::{FeatureHandler, FeatureTable, LifecycleCallback, LifecycleEvent};
use crate::error::{XnetError, report};
use crate::framing::{self, OpcodeRead};
use crate::pool::{Task, WorkerPool};
use crate::queue::WorkQueue;
use crate::signals::SignalWatch;
use crate::socket;
use crate::{
    DEFAULT_BACKLOG, DEFAULT_IO_TIMEOUT, DEFAULT_IP, DEFAULT_MAX_CONNECTIONS, DEFAULT_POLL_INTERVAL,
    DEFAULT_PORT, DEFAULT_TIMEOUT_SECS, EPOLL_MAX_EVENTS, MAX_BACKLOG, MAX_TASKS, MAX_TIMEOUT_SECS,
    MIN_PORT, THREAD_COUNT,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    ip: Ipv4Addr,
    port: u16,
    backlog: u32,
    timeout: Duration,
    max_connections: usize,
    worker_threads: usize,
    max_tasks: usize,
    io_timeout: Duration,
    poll_interval: Duration,
    handle_signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: DEFAULT_IP,
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            worker_threads: THREAD_COUNT,
            max_tasks: MAX_TASKS,
            io_timeout: DEFAULT_IO_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            handle_signals: true,
        }
    }
}

impl ServerConfig {
    /// Build a configuration, substituting defaults for out-of-range values.
    ///
    /// * `ip` - IPv4 address; missing or unparseable falls back to `127.0.0.1`
    /// * `port` - must be in `1031..=65535`, else `40777`
    /// * `backlog` - at most `128`, else `128`
    /// * `timeout_seconds` - at most `7200`, else `3600`; `0` disables expiry
    ///
    /// Every substitution is reported as a warning.
    pub fn new(ip: Option<&str>, port: u32, backlog: u32, timeout_seconds: u64) -> Self {
        let mut config = Self::default();

        match ip.map(|raw| (raw, raw.trim().parse::<Ipv4Addr>())) {
            Some((_, Ok(addr))) => config.ip = addr,
            Some((raw, Err(_))) => report(&XnetError::InvalidIp { ip: raw.to_string() }, "create"),
            None => report(&XnetError::InvalidIp { ip: String::new() }, "create"),
        }

        match u16::try_from(port) {
            Ok(port) if port >= MIN_PORT => config.port = port,
            _ => report(&XnetError::InvalidPort { port }, "create"),
        }

        if backlog <= MAX_BACKLOG {
            config.backlog = backlog;
        } else {
            report(&XnetError::InvalidBacklog { backlog }, "create");
        }

        if timeout_seconds <= MAX_TIMEOUT_SECS {
            config.timeout = Duration::from_secs(timeout_seconds);
        } else {
            report(
                &XnetError::InvalidTimeout {
                    seconds: timeout_seconds,
                },
                "create",
            );
        }

        config
    }

    /// Number of connection slots (at least one).
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Number of worker threads (at least one).
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    /// Capacity of the task queue (at least one).
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks.max(1);
        self
    }

    /// Read/write timeout on a client socket while a handler runs.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout.max(Duration::from_millis(1));
        self
    }

    /// Upper bound on one readiness wait; bounds how quickly `shutdown` is observed.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Stop on `SIGINT`/`SIGQUIT` delivered through a signalfd.
    pub fn with_handle_signals(mut self, handle_signals: bool) -> Self {
        self.handle_signals = handle_signals;
        self
    }

    /// Idle timeout without range checks. Intended for tests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Let the OS pick the port. Intended for tests.
    pub fn ephemeral_port(mut self) -> Self {
        self.port = 0;
        self
    }

    /// Bind address.
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Bind port (`0` when ephemeral).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Listen backlog.
    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    /// Session idle timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of connection slots.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of worker threads.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Task queue capacity.
    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    /// Handler I/O timeout.
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Readiness wait bound.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether termination signals stop the loop.
    pub fn handle_signals(&self) -> bool {
        self.handle_signals
    }

    fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    config: ServerConfig,
    poller: Epoll,
    listener: Mutex<Option<Socket>>,
    local_addr: SocketAddr,
    accepting: AtomicBool,
    connections: ConnectionTable,
    features: RwLock<FeatureTable>,
    queue: Arc<WorkQueue<Task>>,
    running: AtomicBool,
    started: AtomicBool,
    /// Set by `shutdown`, never cleared: a stop requested before `start`
    /// still ends the loop.
    stop_requested: AtomicBool,
}

impl Shared {
    fn watch<F: AsFd>(&self, fd: F, flags: EpollFlags) -> Result<(), XnetError> {
        let raw = fd.as_fd().as_raw_fd();
        self.poller
            .add(fd, EpollEvent::new(flags, raw as u64))
            .map_err(|source| XnetError::Poll { fd: raw, source })
    }

    fn rearm<F: AsFd>(&self, fd: F) -> Result<(), XnetError> {
        let raw = fd.as_fd().as_raw_fd();
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT, raw as u64);
        self.poller
            .modify(fd, &mut event)
            .map_err(|source| XnetError::Poll { fd: raw, source })
    }

    fn unwatch<F: AsFd>(&self, fd: F) -> Result<(), XnetError> {
        let raw = fd.as_fd().as_raw_fd();
        self.poller
            .delete(fd)
            .map_err(|source| XnetError::Poll { fd: raw, source })
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable, thread-safe reference to a server.
///
/// Used by feature handlers, lifecycle callbacks and other threads to inspect
/// the server, register addons or request shutdown.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Number of active connections.
    pub fn active_connections(&self) -> usize {
        self.shared.connections.active_count()
    }

    /// Snapshot of the active connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.connections.snapshot()
    }

    /// Dump the connection table at debug level.
    pub fn log_connections(&self) {
        self.shared.connections.log_connections();
    }

    /// Whether the event loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Effective configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Ask the event loop to stop after the current iteration. Idempotent.
    ///
    /// May be called before [`Server::start`], in which case `start` returns
    /// as soon as its setup is done.
    pub fn shutdown(&self) {
        if !self.shared.stop_requested.swap(true, Ordering::AcqRel) {
            tracing::info!("Server shutdown requested");
        }
        self.shared.running.store(false, Ordering::Release);
    }

    fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::Acquire)
    }

    /// Bind `handler` to `opcode` (below [`crate::MAX_FEATURES`]).
    pub fn register_feature<H: FeatureHandler + 'static>(
        &self,
        opcode: usize,
        handler: H,
    ) -> Result<(), XnetError> {
        self.shared.features.write().insert(opcode, handler)
    }

    /// Unbind `opcode`.
    pub fn unregister_feature(&self, opcode: usize) -> Result<(), XnetError> {
        self.shared.features.write().remove(opcode)
    }

    /// Observe connects or disconnects.
    pub fn register_lifecycle_callback<C: LifecycleCallback + 'static>(
        &self,
        event: LifecycleEvent,
        callback: C,
    ) -> Result<(), XnetError> {
        self.shared.features.write().register_callback(event, callback)
    }

    /// Opcodes with a bound handler, ascending.
    pub fn registered_opcodes(&self) -> Vec<u16> {
        self.shared.features.read().registered_opcodes()
    }

    pub(crate) fn io_timeout(&self) -> Duration {
        self.shared.config.io_timeout
    }

    /// Complete a request on a worker thread: discard unread bytes, refresh the
    /// session and return the socket to the readiness set.
    pub(crate) fn finish_request(
        &self,
        conn: &Connection,
        session_id: SessionId,
        stream: &TcpStream,
        completed: bool,
    ) {
        match framing::drain(&mut &*stream) {
            Ok(0) => {}
            Ok(n) => tracing::debug!(slot = conn.slot(), bytes = n, "Drained unread request bytes"),
            Err(e) => tracing::debug!(slot = conn.slot(), "Drain failed: {e}"),
        }

        let mut state = conn.lock();
        if !state.is_session(session_id) {
            return;
        }
        if let Some(session) = &state.session
            && let Err(e) = session.rearm()
        {
            report(&e, "finish request");
        }
        if let Err(e) = self.shared.rearm(stream) {
            report(&e, "finish request");
        }
        state.busy = false;
        tracing::trace!(slot = conn.slot(), completed, "Request finished");
    }

    fn notify(&self, event: LifecycleEvent, conn: &Connection) {
        let callbacks = self.shared.features.read().callbacks(event);
        for callback in callbacks {
            callback.notify(self, conn);
        }
    }

    // -- event loop ---------------------------------------------------------

    fn run_loop(&self, mut signals: Option<&mut SignalWatch>) -> Result<(), XnetError> {
        let mut events = [EpollEvent::empty(); EPOLL_MAX_EVENTS];
        let listener_fd = self.listener_fd();
        let signal_fd = signals.as_ref().map(|s| s.raw_fd());
        let timeout = u16::try_from(self.shared.config.poll_interval.as_millis()).unwrap_or(u16::MAX);

        while !self.stop_requested() {
            let ready = match self.shared.poller.wait(&mut events, timeout) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(XnetError::Poll {
                        fd: self.shared.poller.0.as_raw_fd(),
                        source,
                    });
                }
            };

            for event in &events[..ready] {
                let fd = event.data() as RawFd;
                if Some(fd) == listener_fd {
                    self.accept_pending();
                } else if Some(fd) == signal_fd {
                    if let Some(watch) = signals.as_deref_mut()
                        && watch.termination_requested()
                    {
                        self.shutdown();
                    }
                } else if let Some(conn) = self.shared.connections.find_by_socket(fd) {
                    self.service_client(&conn);
                } else if let Some(conn) = self.shared.connections.find_by_session_timer(fd) {
                    self.expire_session(&conn);
                } else {
                    tracing::trace!(fd, "Ignoring event for a released descriptor");
                }
            }
        }
        Ok(())
    }

    fn listener_fd(&self) -> Option<RawFd> {
        self.shared.listener.lock().as_ref().map(|l| l.as_raw_fd())
    }

    fn accept_pending(&self) {
        if self.shared.connections.is_full() {
            self.pause_accepting();
            return;
        }

        let accepted = match self.shared.listener.lock().as_ref() {
            Some(listener) => listener.accept(),
            None => return,
        };
        let stream: TcpStream = match accepted {
            Ok((socket, _)) => socket.into(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                report(&XnetError::Accept(e), "accept");
                return;
            }
        };

        if let Err(e) = socket::configure_stream(&stream) {
            report(&e, "accept");
        }
        match self
            .shared
            .connections
            .allocate(stream, self.shared.config.timeout)
        {
            Ok(conn) => self.register_connection(&conn),
            Err(e) => report(&e, "accept"),
        }

        if self.shared.connections.is_full() {
            self.pause_accepting();
        }
    }

    fn register_connection(&self, conn: &Arc<Connection>) {
        let registered = {
            let state = conn.lock();
            match (&state.stream, &state.session) {
                (Some(stream), Some(session)) => self
                    .shared
                    .watch(&**stream, EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT)
                    .and_then(|()| self.shared.watch(&**session, EpollFlags::EPOLLIN)),
                _ => Err(XnetError::InactiveConnection(conn.slot())),
            }
        };
        if let Err(e) = registered {
            report(&e, "register connection");
            self.close_connection(conn);
            return;
        }

        tracing::info!(
            slot = conn.slot(),
            peer = ?conn.peer_addr(),
            session = ?conn.session_id(),
            "Client connected"
        );
        self.notify(LifecycleEvent::Connect, conn);
    }

    fn service_client(&self, conn: &Arc<Connection>) {
        let (Some(stream), Some(session_id)) = (conn.stream(), conn.session_id()) else {
            return;
        };

        let mut pending = conn.take_pending_opcode(session_id);
        match framing::resume_opcode(&mut &*stream, &mut pending) {
            Ok(OpcodeRead::Complete(opcode)) => {
                self.dispatch_request(conn, session_id, &stream, opcode);
            }
            Ok(OpcodeRead::Incomplete) => {
                if pending.is_some() {
                    tracing::trace!(slot = conn.slot(), "Waiting for the rest of the opcode");
                }
                conn.set_pending_opcode(session_id, pending);
                self.rearm_client(conn, &stream);
            }
            Ok(OpcodeRead::Closed) => {
                tracing::debug!(slot = conn.slot(), "Peer closed the connection");
                self.close_connection(conn);
            }
            Err(e) => {
                report(&e.into(), "read opcode");
                self.close_connection(conn);
            }
        }
    }

    fn dispatch_request(
        &self,
        conn: &Arc<Connection>,
        session_id: SessionId,
        stream: &TcpStream,
        opcode: u16,
    ) {
        let handler = self.shared.features.read().lookup(opcode);
        let Some(handler) = handler else {
            report(&XnetError::UnsupportedOpcode(opcode), "dispatch");
            if let Err(e) = framing::drain(&mut &*stream) {
                tracing::debug!(slot = conn.slot(), "Drain failed: {e}");
            }
            self.rearm_client(conn, stream);
            return;
        };

        if !conn.try_mark_busy(session_id) {
            tracing::warn!(slot = conn.slot(), opcode, "Connection already has a request in flight");
            return;
        }

        tracing::trace!(slot = conn.slot(), opcode, "Queueing request");
        let task = Task::new(self.clone(), Arc::clone(conn), handler, opcode, session_id);
        if let Err(task) = self.shared.queue.push(task) {
            tracing::debug!(
                opcode = task.opcode(),
                "{}; dropping request",
                XnetError::QueueShutdown
            );
        }
    }

    fn rearm_client(&self, conn: &Connection, stream: &TcpStream) {
        if let Err(e) = self.shared.rearm(stream) {
            report(&e, "rearm client");
            self.close_connection(conn);
        }
    }

    fn expire_session(&self, conn: &Arc<Connection>) {
        let Some(session) = conn.session() else {
            return;
        };

        let busy = conn.is_busy();
        let expired = match session.acknowledge() {
            Ok(expired) => expired,
            Err(e) => {
                report(&e, "session timer");
                return;
            }
        };
        if busy {
            tracing::debug!(slot = conn.slot(), "Session expired while busy; deferring");
            return;
        }
        if !expired {
            return;
        }

        tracing::info!(
            slot = conn.slot(),
            session = session.id(),
            "Session idle timeout"
        );
        if let Some(stream) = conn.stream()
            && let Err(e) = framing::drain(&mut &*stream)
        {
            tracing::debug!(slot = conn.slot(), "Drain failed: {e}");
        }
        self.close_connection(conn);
    }

    fn close_connection(&self, conn: &Connection) {
        let released = self.shared.connections.release(conn, |c| {
            self.notify(LifecycleEvent::Disconnect, c);
            self.deregister(c);
        });
        match released {
            Ok(true) => {
                tracing::info!(slot = conn.slot(), "Client disconnected");
                self.resume_accepting();
            }
            Ok(false) => {}
            Err(e) => report(&e, "close connection"),
        }
    }

    fn deregister(&self, conn: &Connection) {
        let state = conn.lock();
        if let Some(stream) = &state.stream
            && let Err(e) = self.shared.unwatch(&**stream)
        {
            tracing::debug!("{e}");
        }
        if let Some(session) = &state.session
            && let Err(e) = self.shared.unwatch(&**session)
        {
            tracing::debug!("{e}");
        }
    }

    fn pause_accepting(&self) {
        if !self.shared.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.shared.listener.lock().as_ref()
            && let Err(e) = self.shared.unwatch(listener)
        {
            report(&e, "pause accepting");
        }
        tracing::debug!(
            max = self.shared.connections.capacity(),
            "Connection table full; pausing accept"
        );
    }

    fn resume_accepting(&self) {
        if self.stop_requested()
            || self.shared.connections.is_full()
            || self.shared.accepting.load(Ordering::Acquire)
        {
            return;
        }
        if let Some(listener) = self.shared.listener.lock().as_ref() {
            match self.shared.watch(listener, EpollFlags::EPOLLIN) {
                Ok(()) => {
                    self.shared.accepting.store(true, Ordering::Release);
                    tracing::debug!("Slot freed; resuming accept");
                }
                Err(e) => report(&e, "resume accepting"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The XNet server: owns the listener, the readiness set, the connection and
/// feature tables, the work queue and the worker pool.
///
/// ```no_run
/// use xnet_core::{HandlerContext, Server, ServerConfig};
///
/// let server = Server::create(ServerConfig::new(Some("127.0.0.1"), 40777, 128, 3600))?;
/// server.register_feature(1, |ctx: &mut HandlerContext<'_>| ctx.respond(0, None))?;
/// server.start()?;
/// server.destroy();
/// # Ok::<(), xnet_core::XnetError>(())
/// ```
pub struct Server {
    handle: ServerHandle,
    pool: Mutex<Option<WorkerPool<Task>>>,
    torn_down: bool,
}

impl Server {
    /// Create the readiness set, bind the listener and allocate every table.
    ///
    /// Nothing is accepted until [`Server::start`].
    pub fn create(config: ServerConfig) -> Result<Self, XnetError> {
        let poller = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|source| {
            XnetError::Create {
                what: "epoll instance",
                source,
            }
        })?;
        let listener = socket::bind_listener(config.bind_addr())?;
        let local_addr = socket::local_addr(&listener)?;

        tracing::info!(
            %local_addr,
            backlog = config.backlog,
            max_connections = config.max_connections,
            workers = config.worker_threads,
            timeout_secs = config.timeout.as_secs(),
            "Server created"
        );

        let shared = Shared {
            connections: ConnectionTable::new(config.max_connections),
            features: RwLock::new(FeatureTable::new()),
            queue: Arc::new(WorkQueue::new(config.max_tasks)),
            poller,
            listener: Mutex::new(Some(listener)),
            local_addr,
            accepting: AtomicBool::new(false),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            config,
        };

        Ok(Self {
            handle: ServerHandle {
                shared: Arc::new(shared),
            },
            pool: Mutex::new(None),
            torn_down: false,
        })
    }

    /// Listen, start the workers and run the event loop on the calling thread
    /// until shutdown is requested or a termination signal arrives.
    pub fn start(&self) -> Result<(), XnetError> {
        let shared = &self.handle.shared;
        if shared.started.swap(true, Ordering::AcqRel) {
            return Err(XnetError::AlreadyRunning);
        }

        {
            let listener = shared.listener.lock();
            let Some(listener) = listener.as_ref() else {
                return Err(XnetError::AlreadyRunning);
            };
            socket::listen(listener, shared.config.backlog)?;
            shared.watch(listener, EpollFlags::EPOLLIN)?;
            shared.accepting.store(true, Ordering::Release);
        }

        let mut signals = if shared.config.handle_signals {
            let watch = SignalWatch::new()?;
            shared.watch(&watch, EpollFlags::EPOLLIN)?;
            Some(watch)
        } else {
            None
        };

        let pool = WorkerPool::spawn(shared.config.worker_threads, Arc::clone(&shared.queue))?;
        *self.pool.lock() = Some(pool);

        shared.running.store(true, Ordering::Release);
        tracing::info!(
            addr = %shared.local_addr,
            features = ?self.handle.registered_opcodes(),
            "Server listening"
        );

        if self.handle.stop_requested() {
            tracing::info!("Shutdown was requested before start; not polling");
        }
        let result = self.handle.run_loop(signals.as_mut());
        shared.running.store(false, Ordering::Release);

        if let Some(watch) = &signals
            && let Err(e) = shared.unwatch(watch)
        {
            tracing::debug!("{e}");
        }
        tracing::info!("Event loop stopped");
        result
    }

    /// Ask the event loop to stop. Idempotent.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Cloneable handle for other threads.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Number of active connections.
    pub fn active_connections(&self) -> usize {
        self.handle.active_connections()
    }

    /// See [`ServerHandle::register_feature`].
    pub fn register_feature<H: FeatureHandler + 'static>(
        &self,
        opcode: usize,
        handler: H,
    ) -> Result<(), XnetError> {
        self.handle.register_feature(opcode, handler)
    }

    /// See [`ServerHandle::unregister_feature`].
    pub fn unregister_feature(&self, opcode: usize) -> Result<(), XnetError> {
        self.handle.unregister_feature(opcode)
    }

    /// See [`ServerHandle::register_lifecycle_callback`].
    pub fn register_lifecycle_callback<C: LifecycleCallback + 'static>(
        &self,
        event: LifecycleEvent,
        callback: C,
    ) -> Result<(), XnetError> {
        self.handle.register_lifecycle_callback(event, callback)
    }

    /// Stop the workers, release every connection and close the listener.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.handle.shutdown();

        // Joining the workers drops queued tasks, which clears their busy flags.
        if let Some(mut pool) = self.pool.lock().take() {
            pool.shutdown();
        }
        self.handle.shared.queue.shutdown();

        let connections = &self.handle.shared.connections;
        for slot in 0..connections.capacity() {
            if let Some(conn) = connections.get(slot)
                && conn.is_active()
            {
                self.handle.close_connection(&conn);
            }
        }

        let listener = self.handle.shared.listener.lock().take();
        if let Some(listener) = &listener
            && self.handle.shared.accepting.swap(false, Ordering::AcqRel)
            && let Err(e) = self.handle.shared.unwatch(listener)
        {
            tracing::debug!("{e}");
        }
        drop(listener);
        tracing::info!("Server destroyed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.teardown();
    }
}
