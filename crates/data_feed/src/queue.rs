//! src/queue.rs
//!
//! Bounded, blocking FIFO queue shared between a batch producer and the
//! consumer iterating the `DataLoader`.
//!
//! # Lifecycle
//!
//! ```text
//!   open ──close()──> closed (drain, then get() == Ok(None))
//!     │                 │
//!     └────kill()───────┴──> killed (every put/get fails immediately)
//! ```
//!
//! - `close` is the graceful end-of-stream marker. Remaining items are still
//!   delivered in order, after which `get` reports end-of-stream.
//! - `kill` is the faulted abort. Only the first call takes effect; it may carry
//!   a fault description, and it wakes *every* blocked `put` and `get`.
//!
//! Items that were still buffered at kill time are never handed out.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Failure outcomes of queue operations.
///
/// End-of-stream is not an error: `get` reports it as `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was killed, optionally with the fault that caused it.
    #[error("queue was killed{}", .fault.as_deref().map(|f| format!(": {}", f)).unwrap_or_default())]
    Killed { fault: Option<String> },

    /// `put` on a queue that has already been closed.
    #[error("queue is closed")]
    Closed,

    /// `get` waited for the full bound without receiving an item.
    #[error("timed out after {0:?} waiting for an item")]
    TimedOut(Duration),
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    killed: bool,
    fault: Option<String>,
}

/// Fixed-capacity multi-producer queue with kill/close semantics.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity: capacity.get(),
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.get()),
                closed: false,
                killed: false,
                fault: None,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocks until there is room, then appends `item`.
    ///
    /// Fails without inserting if the queue is killed or closed, including
    /// when that happens while this call is blocked.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed && !state.killed {
            self.not_full.wait(&mut state);
        }

        if state.killed {
            return Err(QueueError::Killed {
                fault: state.fault.clone(),
            });
        }
        if state.closed {
            return Err(QueueError::Closed);
        }

        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest item, blocking while the queue is empty.
    ///
    /// Returns `Ok(None)` once the queue is closed and drained. With a
    /// `timeout`, gives up with [`QueueError::TimedOut`] when it elapses; the
    /// queue itself is left untouched, escalating is up to the caller.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Option<T>, QueueError> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut state = self.state.lock();

        loop {
            if state.killed {
                return Err(QueueError::Killed {
                    fault: state.fault.clone(),
                });
            }
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Ok(Some(item));
            }
            if state.closed {
                return Ok(None);
            }

            match deadline {
                Some((deadline, timeout)) => {
                    if Instant::now() >= deadline {
                        return Err(QueueError::TimedOut(timeout));
                    }
                    // Spurious and real wakeups both fall through to the re-check above.
                    self.not_empty.wait_until(&mut state, deadline);
                }
                None => self.not_empty.wait(&mut state),
            }
        }
    }

    /// Marks end-of-stream. No effect on a queue that is already closed or killed.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed || state.killed {
            return;
        }
        state.closed = true;
        tracing::debug!(buffered = state.items.len(), "blocking queue closed");
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Kills the queue and wakes every waiter.
    ///
    /// Returns `true` if this call performed the kill, `false` if the queue was
    /// already dead (the first fault is kept).
    pub fn kill(&self, fault: Option<String>) -> bool {
        let mut state = self.state.lock();
        if state.killed {
            return false;
        }
        state.killed = true;
        state.fault = fault;
        tracing::debug!(
            buffered = state.items.len(),
            fault = state.fault.as_deref().unwrap_or("none"),
            "blocking queue killed"
        );
        self.not_empty.notify_all();
        self.not_full.notify_all();
        true
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_killed(&self) -> bool {
        self.state.lock().killed
    }

    /// The fault attached by the first `kill`, if any.
    pub fn fault(&self) -> Option<String> {
        self.state.lock().fault.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn queue<T>(capacity: usize) -> BoundedQueue<T> {
        BoundedQueue::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn test_fifo_then_end_of_stream() {
        let q = queue(4);
        for i in 0..3 {
            q.put(i).unwrap();
        }
        q.close();

        assert_eq!(q.get(None), Ok(Some(0)));
        assert_eq!(q.get(None), Ok(Some(1)));
        assert_eq!(q.get(None), Ok(Some(2)));
        assert_eq!(q.get(None), Ok(None));
        // End-of-stream is sticky
        assert_eq!(q.get(None), Ok(None));
    }

    #[test]
    fn test_put_after_close_is_rejected() {
        let q = queue(2);
        q.close();
        assert_eq!(q.put(1), Err(QueueError::Closed));
        assert!(q.is_empty());
    }

    #[test]
    fn test_get_times_out_on_empty_queue() {
        let q: BoundedQueue<u32> = queue(1);
        let start = Instant::now();
        let result = q.get(Some(Duration::from_millis(50)));

        assert_eq!(result, Err(QueueError::TimedOut(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(50));
        // A timeout alone does not kill the queue
        assert!(!q.is_killed());
    }

    #[test]
    fn test_put_blocks_when_full_until_get() {
        let q = Arc::new(queue(1));
        q.put(1).unwrap();

        let inserted = Arc::new(AtomicBool::new(false));
        let producer = {
            let q = q.clone();
            let inserted = inserted.clone();
            thread::spawn(move || {
                q.put(2).unwrap();
                inserted.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!inserted.load(Ordering::SeqCst), "put must block on a full queue");
        assert_eq!(q.len(), 1);

        assert_eq!(q.get(None), Ok(Some(1)));
        producer.join().unwrap();
        assert!(inserted.load(Ordering::SeqCst));
        assert_eq!(q.get(None), Ok(Some(2)));
    }

    #[test]
    fn test_kill_wakes_blocked_getters_and_putters() {
        let empty: Arc<BoundedQueue<u32>> = Arc::new(queue(1));
        let full: Arc<BoundedQueue<u32>> = Arc::new(queue(1));
        full.put(0).unwrap();

        let getters: Vec<_> = (0..3)
            .map(|_| {
                let q = empty.clone();
                thread::spawn(move || q.get(None))
            })
            .collect();
        let putters: Vec<_> = (0..3)
            .map(|i| {
                let q = full.clone();
                thread::spawn(move || q.put(i))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert!(empty.kill(Some("boom".into())));
        assert!(full.kill(None));

        for g in getters {
            assert_eq!(
                g.join().unwrap(),
                Err(QueueError::Killed {
                    fault: Some("boom".into())
                })
            );
        }
        for p in putters {
            assert_eq!(p.join().unwrap(), Err(QueueError::Killed { fault: None }));
        }
    }

    #[test]
    fn test_kill_is_idempotent_and_keeps_first_fault() {
        let q: BoundedQueue<u32> = queue(2);
        q.put(7).unwrap();

        assert!(q.kill(Some("first".into())));
        assert!(!q.kill(Some("second".into())));
        assert!(!q.kill(None));

        assert_eq!(q.fault().as_deref(), Some("first"));
        assert!(q.is_killed());
        // Occupancy frozen, buffered item never handed out
        assert_eq!(q.len(), 1);
        assert_eq!(
            q.get(None),
            Err(QueueError::Killed {
                fault: Some("first".into())
            })
        );
    }

    #[test]
    fn test_kill_after_close_overrides_drain() {
        let q = queue(2);
        q.put(1).unwrap();
        q.close();
        assert!(q.kill(None));
        assert!(matches!(q.get(None), Err(QueueError::Killed { .. })));
        // Close after kill is a no-op
        q.close();
        assert!(q.is_killed());
    }

    #[test]
    fn test_occupancy_never_exceeds_capacity() {
        const CAPACITY: usize = 3;
        const PER_PRODUCER: usize = 500;
        let q = Arc::new(queue(CAPACITY));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.put(p * PER_PRODUCER + i).unwrap();
                        max_seen.fetch_max(q.len(), Ordering::SeqCst);
                    }
                })
            })
            .collect();

        let mut received = 0;
        while received < 4 * PER_PRODUCER {
            max_seen.fetch_max(q.len(), Ordering::SeqCst);
            if q.get(Some(Duration::from_secs(5))).unwrap().is_some() {
                received += 1;
            }
        }
        for p in producers {
            p.join().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= CAPACITY);
        assert!(q.is_empty());
    }

    #[test]
    fn test_per_producer_order_is_preserved() {
        let q = Arc::new(queue(2));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    q.put(i).unwrap();
                }
                q.close();
            })
        };

        let mut seen = Vec::new();
        while let Some(i) = q.get(None).unwrap() {
            seen.push(i);
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
