//! src/dataloader/loader.rs
//!
//! The `DataLoader` handle and its run lifecycle.
//!
//! # State machine
//!
//! ```text
//!   Unconfigured ──set_batch_generator──> Configured ──iter()──> Iterating
//!                                             ▲                    │
//!                                             │        ┌───────────┴───────────┐
//!                                  abandon / reset     ▼                       ▼
//!                                             └── Completed               Faulted
//!                                                  (iter() again)     (set_batch_generator
//!                                                                          to recover)
//! ```
//!
//! Each run owns one `BoundedQueue` and exactly one producer. The run is torn
//! down (queue killed, worker joined or reaped) whenever iteration ends,
//! faults, is abandoned, or the loader is dropped.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::config::DataLoaderConfig;
use super::iterator::DataLoaderIter;
use super::workers::{BatchIter, ExecutionMode, GeneratorFactory, Producer};
use crate::batch::Batch;
use crate::error::LoaderError;
use crate::place::Place;
use crate::queue::BoundedQueue;

/// Lifecycle of a [`DataLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    /// No batch generator attached yet
    Unconfigured,
    /// Generator attached, no iteration in progress
    Configured,
    /// A `DataLoaderIter` is alive
    Iterating,
    /// The last run ended cleanly at end-of-stream
    Completed,
    /// The last run ended with a killed queue
    Faulted,
}

/// One iteration run: a queue and the single producer feeding it.
pub(crate) struct Run<B> {
    pub(crate) queue: Arc<BoundedQueue<B>>,
    producer: Producer,
}

impl<B> Run<B> {
    pub(crate) fn mode(&self) -> ExecutionMode {
        self.producer.mode()
    }

    pub(crate) fn run_id(&self) -> usize {
        self.producer.run_id()
    }

    pub(crate) fn batch_taken(&self) {
        self.producer.batch_taken();
    }
}

impl<B> Drop for Run<B> {
    fn drop(&mut self) {
        // Unblocks a producer parked in put; the producer field joins afterwards.
        self.queue.kill(None);
    }
}

/// Consumer-facing handle that feeds batches from a user generator through a
/// bounded queue.
///
/// # Example
/// ```ignore
/// let mut loader = DataLoader::from_generator(Some(4), true, false)?;
/// loader.set_batch_generator(|| (0..8).map(|_| make_batch()), &[Place::Cpu])?;
/// for batch in loader.iter()? {
///     let batch = batch?;
///     // train on batch
/// }
/// ```
///
/// # Teardown
/// Dropping the loader, its iterator, or calling `reset` tears the run down.
/// A worker process is always gone once that returns. A producer thread
/// cannot be interrupted: if the batch generator is stuck in user code past
/// a short grace period, the thread is detached and lives on until the
/// generator returns and its next `put` fails on the dead queue.
///
/// # Type parameters:
/// - `B`: batch type (defaults to [`Batch`]). It must be serializable so the
///   same loader works in multi-process mode.
pub struct DataLoader<B = Batch> {
    pub(crate) config: DataLoaderConfig,
    generator: Option<GeneratorFactory<B>>,
    places: Vec<Place>,
    pub(crate) state: LoaderState,
    pub(crate) run: Option<Run<B>>,
    runs_started: usize,
}

impl<B> DataLoader<B>
where
    B: Serialize + DeserializeOwned + Send + 'static,
{
    /// Creates a loader from explicit settings.
    ///
    /// # Errors
    /// A configuration error if `capacity` is `None` or zero. Nothing is
    /// spawned in that case.
    pub fn from_generator(
        capacity: Option<usize>,
        iterable: bool,
        use_multiprocess: bool,
    ) -> Result<Self> {
        let mut builder = DataLoaderConfig::builder()
            .iterable(iterable)
            .use_multiprocess(use_multiprocess);
        if let Some(capacity) = capacity {
            builder = builder.capacity(capacity);
        }
        Ok(Self::new(builder.build()?))
    }

    /// Creates a loader from a validated configuration.
    pub fn new(config: DataLoaderConfig) -> Self {
        Self {
            config,
            generator: None,
            places: Vec::new(),
            state: LoaderState::Unconfigured,
            run: None,
            runs_started: 0,
        }
    }

    /// Attaches the batch source and the target places.
    ///
    /// `generator` is called once per iteration run and must return a fresh
    /// iterator; an `Err` item is a producer fault. Re-attaching tears down
    /// any run in progress and recovers a faulted loader. Non-iterable
    /// loaders start their producer right away.
    pub fn set_batch_generator<F, I>(&mut self, generator: F, places: &[Place]) -> Result<()>
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = Result<B>>,
        I::IntoIter: Send + 'static,
    {
        self.run = None;
        self.generator = Some(Arc::new(move || Box::new(generator().into_iter()) as BatchIter<B>));
        self.places = places.to_vec();
        self.state = LoaderState::Configured;

        if !self.config.iterable {
            self.start()?;
        }
        Ok(())
    }

    /// Starts the producer for the next run if none is running yet.
    ///
    /// Called implicitly by `iter()`; useful for non-iterable loaders that
    /// should begin prefetching before the first batch is requested.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            LoaderState::Configured | LoaderState::Completed => {}
            LoaderState::Unconfigured => {
                return Err(LoaderError::InvalidState(
                    "start before a batch generator is set".into(),
                )
                .into())
            }
            LoaderState::Faulted => {
                return Err(LoaderError::InvalidState(
                    "start after a fault; call set_batch_generator again".into(),
                )
                .into())
            }
            LoaderState::Iterating => return Ok(()),
        }

        if self.run.is_some() {
            return Ok(());
        }

        let generator = self.generator.as_ref().ok_or_else(|| {
            LoaderError::InvalidState("start before a batch generator is set".into())
        })?;

        let queue = Arc::new(BoundedQueue::new(self.config.capacity));
        let mode = self.config.mode();
        self.runs_started += 1;
        let producer = mode.spawn(generator, queue.clone(), self.runs_started)?;

        tracing::debug!(
            run = self.runs_started,
            mode = %mode,
            capacity = self.config.capacity.get(),
            "started batch producer"
        );

        self.run = Some(Run { queue, producer });
        Ok(())
    }

    /// Creates an iterator over the batches of one run.
    ///
    /// # Errors
    /// `InvalidState` if no generator is attached or the previous run
    /// faulted; a spawn error if the producer cannot be started.
    pub fn iter(&mut self) -> Result<DataLoaderIter<'_, B>> {
        match self.state {
            LoaderState::Unconfigured => {
                return Err(LoaderError::InvalidState(
                    "iterate before a batch generator is set".into(),
                )
                .into())
            }
            LoaderState::Faulted => {
                return Err(LoaderError::InvalidState(
                    "iterate after a fault; call set_batch_generator again".into(),
                )
                .into())
            }
            _ => {}
        }

        self.start()?;
        self.state = LoaderState::Iterating;
        Ok(DataLoaderIter::new(self))
    }

    /// Stops the current run, if any, and returns to `Configured`.
    pub fn reset(&mut self) {
        self.run = None;
        if self.state != LoaderState::Unconfigured {
            self.state = LoaderState::Configured;
        }
    }
}

impl<B> DataLoader<B> {
    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Places passed to `set_batch_generator`, untouched.
    pub fn places(&self) -> &[Place] {
        &self.places
    }

    /// Number of batches currently buffered for the active run.
    pub fn buffered(&self) -> usize {
        self.run.as_ref().map_or(0, |run| run.queue.len())
    }

    /// PID of the worker process of the active run (multi-process mode only).
    pub fn worker_pid(&self) -> Option<u32> {
        match self.run.as_ref().map(|run| &run.producer) {
            #[cfg(unix)]
            Some(Producer::Process(worker)) => Some(worker.pid()),
            _ => None,
        }
    }

    /// Ends the active run and moves to `state`.
    pub(crate) fn finish_run(&mut self, state: LoaderState) {
        self.run = None;
        self.state = state;
    }
}
