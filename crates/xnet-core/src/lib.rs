//! XNet server core: an epoll event loop, a fixed connection table with idle
//! timeouts, opcode dispatch to feature handlers and a bounded worker pool.
//!
//! Linux only: readiness, session timers and signals use epoll, timerfd and
//! signalfd.

use std::net::Ipv4Addr;
use std::time::Duration;

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod pool;
pub mod queue;
pub mod server;
pub mod session;

mod signals;
mod socket;

pub use connection::{Connection, ConnectionInfo, ConnectionTable, IdGenerator, SessionId};
pub use dispatch::{
    FeatureHandler, FeatureTable, HandlerContext, LifecycleCallback, LifecycleEvent,
    MAX_CALLBACKS, MAX_FEATURES,
};
pub use error::{ErrorKind, XnetError, report};
pub use framing::{FrameError, MAX_PACKET_BUF_SZ, OpcodeRead};
pub use pool::{Job, Task, WorkerPool};
pub use queue::WorkQueue;
pub use server::{Server, ServerConfig, ServerHandle};
pub use session::Session;

/// Default bind address.
pub const DEFAULT_IP: Ipv4Addr = Ipv4Addr::LOCALHOST;
/// Default bind port.
pub const DEFAULT_PORT: u16 = 40777;
/// Lowest accepted port.
pub const MIN_PORT: u16 = 1031;
/// Highest accepted port.
pub const MAX_PORT: u16 = u16::MAX;
/// Default and maximum listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;
/// Maximum listen backlog.
pub const MAX_BACKLOG: u32 = 128;
/// Default session idle timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;
/// Maximum session idle timeout in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 7200;
/// Default number of connection slots.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
/// Default worker thread count.
pub const THREAD_COUNT: usize = 5;
/// Default task queue capacity.
pub const MAX_TASKS: usize = 256;
/// Readiness events handled per wait.
pub const EPOLL_MAX_EVENTS: usize = 10;
/// Default bound on one readiness wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default read/write timeout while a handler runs.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);
