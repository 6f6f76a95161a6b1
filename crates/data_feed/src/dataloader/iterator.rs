//! src/dataloader/iterator.rs
//!
//! Consumer side of a run: `DataLoaderIter` pulls batches out of the run's
//! queue and maps every queue outcome onto the loader's state machine.
//!
//! | queue outcome      | yielded                  | loader state afterwards |
//! |--------------------|--------------------------|-------------------------|
//! | item               | `Some(Ok(batch))`        | `Iterating`             |
//! | end-of-stream      | `None`                   | `Completed`             |
//! | killed             | `Some(Err(QueueKilled))` | `Faulted`               |
//! | timed out          | `Some(Err(QueueKilled))` | `Faulted` (queue killed)|
//!
//! After `None` or an error the iterator is fused. Dropping it mid-run
//! abandons the run and returns the loader to `Configured`.

use anyhow::Result;
use std::iter::FusedIterator;
use std::time::Duration;

use super::loader::{DataLoader, LoaderState};
use crate::error::LoaderError;
use crate::queue::QueueError;

/// Iterator over the batches of one run.
///
/// Created by calling `dataloader.iter()`.
pub struct DataLoaderIter<'a, B> {
    loader: &'a mut DataLoader<B>,
    timeout: Option<Duration>,
    yielded: usize,
    done: bool,
}

impl<'a, B> DataLoaderIter<'a, B> {
    pub(crate) fn new(loader: &'a mut DataLoader<B>) -> Self {
        let timeout = loader.config.effective_timeout();
        Self {
            loader,
            timeout,
            yielded: 0,
            done: false,
        }
    }

    /// Number of batches yielded so far in this run.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Batches waiting in the queue of this run.
    pub fn buffered(&self) -> usize {
        self.loader.buffered()
    }

    fn fault(&mut self, reason: Option<String>) -> Option<Result<B>> {
        tracing::warn!(
            run = self.loader.run.as_ref().map(|run| run.run_id()),
            after_batches = self.yielded,
            reason = reason.as_deref().unwrap_or("none"),
            "data loader run faulted"
        );
        self.done = true;
        self.loader.finish_run(LoaderState::Faulted);
        Some(Err(LoaderError::QueueKilled { reason }.into()))
    }
}

impl<B> Iterator for DataLoaderIter<'_, B> {
    type Item = Result<B>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let Some(run) = self.loader.run.as_ref() else {
            self.done = true;
            return None;
        };

        match run.queue.get(self.timeout) {
            Ok(Some(batch)) => {
                run.batch_taken();
                self.yielded += 1;
                Some(Ok(batch))
            }
            // `get` reports a closed, drained queue as `Ok(None)`; `Closed`
            // is only ever returned by `put`.
            Ok(None) | Err(QueueError::Closed) => {
                tracing::debug!(
                    run = run.run_id(),
                    batches = self.yielded,
                    "data loader run completed"
                );
                self.done = true;
                self.loader.finish_run(LoaderState::Completed);
                None
            }
            Err(QueueError::TimedOut(waited)) => {
                // Escalate so the producer stops writing into a queue nobody reads.
                let reason = format!(
                    "consumer timed out after {:?} waiting for a batch from the {} producer",
                    waited,
                    run.mode()
                );
                run.queue.kill(Some(reason));
                // A producer fault that raced the timeout wins.
                let reason = run.queue.fault();
                self.fault(reason)
            }
            Err(QueueError::Killed { fault }) => self.fault(fault),
        }
    }
}

impl<B> FusedIterator for DataLoaderIter<'_, B> {}

impl<B> Drop for DataLoaderIter<'_, B> {
    fn drop(&mut self) {
        if self.loader.state == LoaderState::Iterating {
            tracing::debug!(batches = self.yielded, "data loader run abandoned");
            self.loader.finish_run(LoaderState::Configured);
        }
    }
}
