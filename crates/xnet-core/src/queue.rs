//! Bounded blocking work queue shared by the event loop and the worker pool.

use parking_lot::{Condvar, Mutex};

struct Ring<T> {
    buffer: Vec<Option<T>>,
    head: usize,
    size: usize,
    shutdown: bool,
}

/// Fixed-capacity circular FIFO with blocking `push` and `pop`.
///
/// `push` waits while the queue is full and `pop` waits while it is empty.
/// After [`WorkQueue::shutdown`] both return immediately, and items still
/// queued are dropped.
pub struct WorkQueue<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                buffer: (0..capacity).map(|_| None).collect(),
                head: 0,
                size: 0,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.ring.lock().buffer.len()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.ring.lock().size
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`WorkQueue::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.ring.lock().shutdown
    }

    /// Enqueue `item`, blocking while the queue is full.
    ///
    /// Hands the item back if the queue has been shut down.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut ring = self.ring.lock();
        while ring.size == ring.buffer.len() && !ring.shutdown {
            self.not_full.wait(&mut ring);
        }
        if ring.shutdown {
            return Err(item);
        }

        let tail = (ring.head + ring.size) % ring.buffer.len();
        ring.buffer[tail] = Some(item);
        ring.size += 1;
        drop(ring);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue has been shut down.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        while ring.size == 0 && !ring.shutdown {
            self.not_empty.wait(&mut ring);
        }
        if ring.shutdown {
            return None;
        }

        let head = ring.head;
        let item = ring.buffer[head].take();
        ring.head = (head + 1) % ring.buffer.len();
        ring.size -= 1;
        drop(ring);

        self.not_full.notify_one();
        item
    }

    /// Stop accepting and handing out items and wake every waiter.
    ///
    /// Queued items are dropped outside the lock.
    pub fn shutdown(&self) {
        let dropped: Vec<T> = {
            let mut ring = self.ring.lock();
            ring.shutdown = true;
            ring.size = 0;
            ring.head = 0;
            ring.buffer.iter_mut().filter_map(Option::take).collect()
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();

        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Dropping queued tasks at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order_with_wraparound() {
        let queue = WorkQueue::new(3);
        for round in 0..4 {
            queue.push(round * 10).unwrap();
            queue.push(round * 10 + 1).unwrap();
            assert_eq!(queue.pop(), Some(round * 10));
            assert_eq!(queue.pop(), Some(round * 10 + 1));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_blocks_when_full() {
        let queue = Arc::new(WorkQueue::new(2));
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let pushed = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                queue.push(3).unwrap();
                pushed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!pushed.load(Ordering::SeqCst), "producer must wait for room");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(1));
        producer.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(WorkQueue::new(4));
        let (tx, rx) = crossbeam_channel::unbounded();
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || tx.send(queue.pop()).unwrap())
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        queue.push("task").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Some("task"));
        consumer.join().unwrap();
    }

    #[test]
    fn test_shutdown_releases_blocked_threads() {
        let full = Arc::new(WorkQueue::new(1));
        full.push(0).unwrap();
        let empty = Arc::new(WorkQueue::<i32>::new(1));

        let pusher = {
            let full = Arc::clone(&full);
            thread::spawn(move || full.push(1))
        };
        let popper = {
            let empty = Arc::clone(&empty);
            thread::spawn(move || empty.pop())
        };
        thread::sleep(Duration::from_millis(50));

        full.shutdown();
        empty.shutdown();
        assert_eq!(pusher.join().unwrap(), Err(1));
        assert_eq!(popper.join().unwrap(), None);
        assert!(full.is_shutdown());
    }

    #[test]
    fn test_shutdown_drops_queued_items() {
        let marker = Arc::new(());
        let queue = WorkQueue::new(4);
        queue.push(Arc::clone(&marker)).unwrap();
        queue.push(Arc::clone(&marker)).unwrap();
        assert_eq!(Arc::strong_count(&marker), 3);

        queue.shutdown();
        assert_eq!(Arc::strong_count(&marker), 1);
        assert!(queue.pop().is_none());
        assert!(queue.push(Arc::clone(&marker)).is_err());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = WorkQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(()).unwrap();
        assert_eq!(queue.len(), 1);
    }
}
