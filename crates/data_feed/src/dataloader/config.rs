//! src/dataloader/config.rs
//!
//! Configuration for DataLoader behaviour
//!
//! Example:
//! ```ignore
//! let config = DataLoaderConfig::builder()
//!     .capacity(8)
//!     .iterable(true)
//!     .use_multiprocess(true)
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//! ```
//!
//! # Choosing a capacity
//! - Too low: the producer stalls on every batch the consumer has not taken yet.
//! - Too high: more finished batches held in memory at once.

use anyhow::Result;
use std::num::NonZeroUsize;
use std::time::Duration;

use super::workers::ExecutionMode;
use crate::error::LoaderError;

/// How long a consumer waits for a batch from a worker process before giving
/// up, when no explicit timeout was configured.
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Validated DataLoader configuration.
#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    /// Maximum number of batches buffered between producer and consumer
    pub capacity: NonZeroUsize,
    /// Iterable loaders start their producer on `iter()`. Non-iterable ones
    /// start it as soon as a generator is attached.
    pub iterable: bool,
    /// Run the producer in a forked worker process instead of a thread
    pub use_multiprocess: bool,
    /// Consumer wait bound per batch. `None` means the mode default.
    pub timeout: Option<Duration>,
}

impl DataLoaderConfig {
    pub fn builder() -> DataLoaderConfigBuilder {
        DataLoaderConfigBuilder::default()
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.use_multiprocess {
            ExecutionMode::MultiProcess
        } else {
            ExecutionMode::SingleThread
        }
    }

    /// Wait bound applied to each `get`, after falling back to the mode default.
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.or_else(|| self.mode().default_timeout())
    }
}

/// Builder for DataLoaderConfig with method chaining
#[derive(Debug, Clone)]
pub struct DataLoaderConfigBuilder {
    capacity: Option<usize>,
    iterable: bool,
    use_multiprocess: bool,
    timeout: Option<Duration>,
}

impl Default for DataLoaderConfigBuilder {
    fn default() -> Self {
        Self {
            capacity: None,
            iterable: true,
            use_multiprocess: false,
            timeout: None,
        }
    }
}

impl DataLoaderConfigBuilder {
    /// Set the queue capacity (required, must be > 0)
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn iterable(mut self, iterable: bool) -> Self {
        self.iterable = iterable;
        self
    }

    pub fn use_multiprocess(mut self, use_multiprocess: bool) -> Self {
        self.use_multiprocess = use_multiprocess;
        self
    }

    /// Set how long the consumer waits for each batch.
    ///
    /// - Too low: healthy but slow generators get killed.
    /// - Too high: delays detection of a stuck producer.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate and build the final configuration.
    pub fn build(self) -> Result<DataLoaderConfig> {
        let capacity = match self.capacity {
            None => {
                return Err(LoaderError::Configuration(
                    "Please give value to capacity: capacity must be supplied".into(),
                )
                .into())
            }
            Some(c) => NonZeroUsize::new(c).ok_or_else(|| {
                LoaderError::Configuration("capacity must be greater than 0".into())
            })?,
        };

        if self.timeout == Some(Duration::ZERO) {
            return Err(
                LoaderError::Configuration("timeout must be greater than 0".into()).into(),
            );
        }

        Ok(DataLoaderConfig {
            capacity,
            iterable: self.iterable,
            use_multiprocess: self.use_multiprocess,
            timeout: self.timeout,
        })
    }
}
