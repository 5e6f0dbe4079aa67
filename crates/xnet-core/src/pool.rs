//! Worker pool executing feature handlers off the event loop thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::connection::{BlockingGuard, Connection, SessionId};
use crate::dispatch::{FeatureHandler, HandlerContext, run_handler};
use crate::error::{XnetError, report};
use crate::queue::WorkQueue;
use crate::server::ServerHandle;

/// A unit of work a pool thread can run.
pub trait Job: Send + 'static {
    /// Run to completion on a worker thread.
    fn run(self);
}

/// Fixed set of long-lived threads consuming a [`WorkQueue`].
pub struct WorkerPool<T: Job> {
    queue: Arc<WorkQueue<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Job> WorkerPool<T> {
    /// Start `count` threads named `xnet-worker-N` popping from `queue`.
    pub fn spawn(count: usize, queue: Arc<WorkQueue<T>>) -> Result<Self, XnetError> {
        let mut pool = Self {
            queue,
            workers: Vec::with_capacity(count),
        };

        for n in 0..count {
            let queue = Arc::clone(&pool.queue);
            let handle = thread::Builder::new()
                .name(format!("xnet-worker-{n}"))
                .spawn(move || worker_loop(&queue))
                .map_err(XnetError::Spawn)?;
            pool.workers.push(handle);
        }

        tracing::debug!(workers = count, "Worker pool started");
        Ok(pool)
    }

    /// Number of running threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Shut the queue down and join every worker. Idempotent.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.queue.shutdown();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("xnet-worker").to_string();
            if handle.join().is_err() {
                tracing::error!(worker = %name, "Worker thread panicked");
            }
        }
        tracing::debug!("Worker pool stopped");
    }
}

impl<T: Job> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T: Job>(queue: &WorkQueue<T>) {
    while let Some(job) = queue.pop() {
        if panic::catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            tracing::error!("Job panicked; worker continues");
        }
    }
    tracing::trace!("Worker exiting");
}

/// One dispatched request: a resolved handler bound to a connection.
///
/// The event loop marks the connection busy before queueing the task. The
/// task clears the flag when it finishes, or when it is dropped without
/// running (queue shut down, worker panic).
pub struct Task {
    server: ServerHandle,
    connection: Arc<Connection>,
    handler: Arc<dyn FeatureHandler>,
    opcode: u16,
    session_id: SessionId,
    finished: bool,
}

impl Task {
    pub(crate) fn new(
        server: ServerHandle,
        connection: Arc<Connection>,
        handler: Arc<dyn FeatureHandler>,
        opcode: u16,
        session_id: SessionId,
    ) -> Self {
        Self {
            server,
            connection,
            handler,
            opcode,
            session_id,
            finished: false,
        }
    }

    /// Opcode being served.
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// Session the task was dispatched for.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Job for Task {
    fn run(mut self) {
        let stream = {
            let state = self.connection.lock();
            if !state.is_session(self.session_id) {
                None
            } else {
                state.stream.clone()
            }
        };
        let Some(stream) = stream else {
            tracing::debug!(
                slot = self.connection.slot(),
                session = self.session_id,
                "Dropping task for a closed session"
            );
            self.finished = true;
            return;
        };

        tracing::trace!(slot = self.connection.slot(), opcode = self.opcode, "Running handler");
        let completed = match BlockingGuard::new(&stream, self.server.io_timeout()) {
            Ok(_guard) => {
                let mut ctx =
                    HandlerContext::new(&self.server, &self.connection, &stream, self.opcode);
                run_handler(self.handler.as_ref(), &mut ctx)
            }
            Err(source) => {
                report(
                    &XnetError::SocketOption {
                        option: "blocking mode",
                        source,
                    },
                    "worker",
                );
                false
            }
        };

        self.server
            .finish_request(&self.connection, self.session_id, &stream, completed);
        self.finished = true;
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !self.finished {
            self.connection.mark_idle(self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Record {
        value: u32,
        tx: crossbeam_channel::Sender<(u32, String)>,
    }

    impl Job for Record {
        fn run(self) {
            let name = thread::current().name().unwrap_or_default().to_string();
            self.tx.send((self.value, name)).unwrap();
        }
    }

    struct Explode;

    impl Job for Explode {
        fn run(self) {
            panic!("handler bug");
        }
    }

    #[test]
    fn test_workers_are_named_and_run_jobs() {
        let queue = Arc::new(WorkQueue::new(8));
        let mut pool = WorkerPool::spawn(3, Arc::clone(&queue)).unwrap();
        assert_eq!(pool.size(), 3);

        let (tx, rx) = crossbeam_channel::unbounded();
        for value in 0..6 {
            assert!(queue.push(Record { value, tx: tx.clone() }).is_ok());
        }

        let mut seen: Vec<u32> = (0..6)
            .map(|_| {
                let (value, name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
                assert!(name.starts_with("xnet-worker-"), "unexpected thread {name}");
                value
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);

        pool.shutdown();
        assert_eq!(pool.size(), 0);
        assert!(queue.is_shutdown());
    }

    #[test]
    fn test_shutdown_joins_idle_workers() {
        let queue: Arc<WorkQueue<Explode>> = Arc::new(WorkQueue::new(4));
        let mut pool = WorkerPool::spawn(4, queue).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        enum Mixed {
            Panic(Explode),
            Ok(Record),
        }
        impl Job for Mixed {
            fn run(self) {
                match self {
                    Mixed::Panic(job) => job.run(),
                    Mixed::Ok(job) => job.run(),
                }
            }
        }

        let queue = Arc::new(WorkQueue::new(4));
        let _pool = WorkerPool::spawn(1, Arc::clone(&queue)).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        assert!(queue.push(Mixed::Panic(Explode)).is_ok());
        assert!(queue.push(Mixed::Ok(Record { value: 9, tx })).is_ok());
        let (value, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(value, 9);
    }

    #[test]
    fn test_drop_joins_workers() {
        let queue: Arc<WorkQueue<Explode>> = Arc::new(WorkQueue::new(1));
        {
            let _pool = WorkerPool::spawn(2, Arc::clone(&queue)).unwrap();
        }
        assert!(queue.is_shutdown());
    }
}
