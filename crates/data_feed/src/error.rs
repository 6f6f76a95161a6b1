//! src/error.rs
//!
//! Error taxonomy surfaced by the `DataLoader`.
//!
//! Public operations return `anyhow::Result`, but every failure that a caller
//! may want to branch on is raised as a [`LoaderError`] so it can be recovered
//! with `err.downcast_ref::<LoaderError>()`.
//!
//! - `Configuration`: rejected synchronously, before any worker exists.
//! - `QueueKilled`: the single fault a consumer observes when the producer
//!   raised, crashed, or stalled past the consumer's wait bound.
//! - `InvalidState`: the loader was driven out of order (e.g. iterating a
//!   loader with no batch generator attached).
//! - `Spawn`: the producer thread/process could not be started.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Invalid DataLoader configuration: {0}")]
    Configuration(String),

    #[error("Blocking queue is killed{}", fmt_reason(.reason))]
    QueueKilled { reason: Option<String> },

    #[error("DataLoader cannot {0}")]
    InvalidState(String),

    #[error("Failed to start batch producer: {0}")]
    Spawn(String),
}

impl LoaderError {
    /// Returns true if this is the killed-queue fault.
    pub fn is_killed(&self) -> bool {
        matches!(self, LoaderError::QueueKilled { .. })
    }
}

fn fmt_reason(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {}", reason),
        None => String::new(),
    }
}
