//! Producer workers for the DataLoader.
//!
//! This module provides the producer side of the pipeline:
//! - `thread`: producer running on a thread that shares the queue directly
//! - `process`: producer running in a forked process, relayed over a pipe
//!
//! Both run the same [`drive`] loop and differ only in the [`BatchSink`] it
//! feeds: the queue itself, or a frame writer on the child's end of the pipe.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::config::DEFAULT_PROCESS_TIMEOUT;
use crate::error::LoaderError;
use crate::queue::BoundedQueue;

#[cfg(unix)]
pub(crate) mod process;
pub(crate) mod thread;

/// Iterator handed out by a batch generator for one run.
pub type BatchIter<B> = Box<dyn Iterator<Item = Result<B>> + Send>;

/// Creates a fresh batch iterator for every iteration run.
pub type GeneratorFactory<B> = Arc<dyn Fn() -> BatchIter<B> + Send + Sync>;

/// How long teardown waits for a producer to exit on its own before
/// detaching (thread) or killing (process) it.
pub(crate) const WORKER_JOIN_GRACE_MS: u64 = 200;

/// How often a relay thread checks whether its queue is still alive while
/// waiting on a quiet worker process.
pub(crate) const WORKER_POLL_INTERVAL_MS: u64 = 50;

/// Where the producer runs relative to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Producer thread in the consumer's process, sharing the queue instance
    SingleThread,
    /// Forked producer process, batches relayed over a pipe
    MultiProcess,
}

impl ExecutionMode {
    /// Consumer wait bound used when the config does not set one.
    pub fn default_timeout(self) -> Option<Duration> {
        match self {
            ExecutionMode::SingleThread => None,
            ExecutionMode::MultiProcess => Some(DEFAULT_PROCESS_TIMEOUT),
        }
    }

    /// Starts exactly one producer feeding `queue` from a fresh generator iterator.
    pub(crate) fn spawn<B>(
        self,
        generator: &GeneratorFactory<B>,
        queue: Arc<BoundedQueue<B>>,
        run_id: usize,
    ) -> Result<Producer>
    where
        B: Serialize + DeserializeOwned + Send + 'static,
    {
        match self {
            ExecutionMode::SingleThread => Ok(Producer::Thread(thread::ThreadWorker::spawn(
                generator.clone(),
                queue,
                run_id,
            )?)),
            #[cfg(unix)]
            ExecutionMode::MultiProcess => Ok(Producer::Process(process::ProcessWorker::spawn(
                generator.clone(),
                queue,
                run_id,
            )?)),
            #[cfg(not(unix))]
            ExecutionMode::MultiProcess => Err(LoaderError::Spawn(
                "multi-process mode requires a unix platform".into(),
            )
            .into()),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::SingleThread => write!(f, "thread"),
            ExecutionMode::MultiProcess => write!(f, "process"),
        }
    }
}

/// A running producer. Dropping it tears the worker down.
pub(crate) enum Producer {
    Thread(thread::ThreadWorker),
    #[cfg(unix)]
    Process(process::ProcessWorker),
}

impl Producer {
    pub(crate) fn mode(&self) -> ExecutionMode {
        match self {
            Producer::Thread(_) => ExecutionMode::SingleThread,
            #[cfg(unix)]
            Producer::Process(_) => ExecutionMode::MultiProcess,
        }
    }

    pub(crate) fn run_id(&self) -> usize {
        match self {
            Producer::Thread(worker) => worker.run_id(),
            #[cfg(unix)]
            Producer::Process(worker) => worker.run_id(),
        }
    }

    /// Called once per batch the consumer takes out of the queue.
    ///
    /// A thread producer is throttled by the queue itself; a worker process
    /// gets its credit back.
    pub(crate) fn batch_taken(&self) {
        match self {
            Producer::Thread(_) => {}
            #[cfg(unix)]
            Producer::Process(worker) => worker.grant_credit(),
        }
    }
}

/// Destination of the batches a producer pulls from the generator.
pub(crate) trait BatchSink<B> {
    /// Hands over one batch. An error means nobody is listening any more and
    /// the producer should stop quietly.
    fn push(&mut self, batch: B) -> Result<()>;

    /// The generator is exhausted.
    fn finish(&mut self);

    /// The generator raised or panicked; no further batches follow.
    fn fail(&mut self, fault: String);
}

impl<B> BatchSink<B> for Arc<BoundedQueue<B>> {
    fn push(&mut self, batch: B) -> Result<()> {
        self.put(batch).map_err(Into::into)
    }

    fn finish(&mut self) {
        self.close();
    }

    fn fail(&mut self, fault: String) {
        self.kill(Some(fault));
    }
}

/// Pulls every batch out of a fresh generator iterator into `sink`.
///
/// Stops at the first generator error (nothing after it is pushed), at
/// exhaustion, or as soon as the sink stops accepting batches. Panics in user
/// code are reported as faults.
pub(crate) fn drive<B, S>(generator: &GeneratorFactory<B>, sink: &mut S)
where
    S: BatchSink<B>,
{
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Option<String> {
        for item in generator() {
            match item {
                Ok(batch) => {
                    if sink.push(batch).is_err() {
                        return None;
                    }
                }
                Err(e) => return Some(format!("{:#}", e)),
            }
        }
        sink.finish();
        None
    }));

    match outcome {
        Ok(None) => {}
        Ok(Some(fault)) => sink.fail(fault),
        Err(payload) => sink.fail(format!("batch generator panicked: {}", panic_message(&payload))),
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) fn spawn_error(what: String, err: std::io::Error) -> anyhow::Error {
    LoaderError::Spawn(format!("{}: {}", what, err)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[derive(Default)]
    struct RecordingSink {
        batches: Vec<u32>,
        finished: bool,
        fault: Option<String>,
        accept: Option<usize>,
    }

    impl BatchSink<u32> for RecordingSink {
        fn push(&mut self, batch: u32) -> Result<()> {
            if self.accept.is_some_and(|n| self.batches.len() >= n) {
                return Err(anyhow!("sink closed"));
            }
            self.batches.push(batch);
            Ok(())
        }

        fn finish(&mut self) {
            self.finished = true;
        }

        fn fail(&mut self, fault: String) {
            self.fault = Some(fault);
        }
    }

    fn generator<F, I>(f: F) -> GeneratorFactory<u32>
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: Iterator<Item = Result<u32>> + Send + 'static,
    {
        Arc::new(move || Box::new(f()) as BatchIter<u32>)
    }

    #[test]
    fn test_drive_exhaustion_finishes_sink() {
        let mut sink = RecordingSink::default();
        drive(&generator(|| (0..5).map(Ok)), &mut sink);
        assert_eq!(sink.batches, vec![0, 1, 2, 3, 4]);
        assert!(sink.finished);
        assert!(sink.fault.is_none());
    }

    #[test]
    fn test_drive_stops_at_first_error() {
        let mut sink = RecordingSink::default();
        let gen = generator(|| {
            (0..5).map(|i| if i == 2 { Err(anyhow!("bad sample {}", i)) } else { Ok(i) })
        });
        drive(&gen, &mut sink);
        assert_eq!(sink.batches, vec![0, 1]);
        assert!(!sink.finished);
        assert_eq!(sink.fault.as_deref(), Some("bad sample 2"));
    }

    #[test]
    fn test_drive_reports_panics_as_faults() {
        let mut sink = RecordingSink::default();
        let gen = generator(|| {
            (0..3).map(|i| {
                if i == 1 {
                    panic!("generator exploded");
                }
                Ok(i)
            })
        });
        drive(&gen, &mut sink);
        assert_eq!(sink.batches, vec![0]);
        let fault = sink.fault.unwrap();
        assert!(fault.contains("generator exploded"), "{}", fault);
    }

    #[test]
    fn test_drive_stops_quietly_when_sink_rejects() {
        let mut sink = RecordingSink {
            accept: Some(2),
            ..Default::default()
        };
        drive(&generator(|| (0..10).map(Ok)), &mut sink);
        assert_eq!(sink.batches, vec![0, 1]);
        assert!(!sink.finished);
        assert!(sink.fault.is_none());
    }
}
