//! src/dataloader/workers/thread.rs
//!
//! Producer running on a dedicated thread in the consumer's process.
//!
//! The thread shares the run's `BoundedQueue` directly: batches are `put`
//! as they are produced, exhaustion closes the queue, and a generator error
//! kills it with the error attached.

use anyhow::Result;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{drive, spawn_error, GeneratorFactory, WORKER_JOIN_GRACE_MS};
use crate::queue::BoundedQueue;

pub(crate) struct ThreadWorker {
    handle: Option<JoinHandle<()>>,
    run_id: usize,
}

impl ThreadWorker {
    pub(crate) fn spawn<B>(
        generator: GeneratorFactory<B>,
        queue: Arc<BoundedQueue<B>>,
        run_id: usize,
    ) -> Result<Self>
    where
        B: Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("data-feed-producer-{}", run_id))
            .spawn(move || {
                tracing::debug!(run = run_id, "producer thread started");
                let mut sink = queue;
                drive(&generator, &mut sink);
                tracing::debug!(run = run_id, "producer thread exiting");
            })
            .map_err(|e| spawn_error(format!("failed to spawn producer thread {}", run_id), e))?;

        Ok(Self {
            handle: Some(handle),
            run_id,
        })
    }

    pub(crate) fn run_id(&self) -> usize {
        self.run_id
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        // The queue is dead by now, so the thread leaves at its next put. A
        // generator stuck inside user code cannot be interrupted; detach it.
        let deadline = Instant::now() + Duration::from_millis(WORKER_JOIN_GRACE_MS);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if handle.is_finished() {
            let _ = handle.join();
        } else {
            tracing::warn!(
                run = self.run_id,
                "producer thread still busy in the batch generator, detaching it"
            );
        }
    }
}
