//! src/dataloader/mod.rs
//!
//! This module implements the `DataLoader`.
//!
//! The `DataLoader` decouples a user-supplied batch generator from the
//! training loop that consumes its batches. A bounded queue sits between
//! them, giving backpressure to the producer and a single, well-defined fault
//! to the consumer when the producer raises, crashes, or stalls.
//!
//! # Architecture Overview
//!
//! ```text
//!              ┌──────────────────┐
//!              │ batch generator  │ (user code, may raise or stall)
//!              └────────┬─────────┘
//!                       │ Result<B> per step
//!                       ↓
//!              ┌──────────────────┐
//!              │ Producer worker  │ thread, or forked process + relay
//!              └────────┬─────────┘
//!                       │ put / close / kill(fault)
//!                       ↓
//!              ┌──────────────────┐
//!              │  BoundedQueue    │ (capacity = backpressure bound)
//!              └────────┬─────────┘
//!                       │ get(timeout)
//!                       ↓
//!              ┌──────────────────┐
//!              │  DataLoaderIter  │ → training loop
//!              └──────────────────┘
//! ```
//!
//! # Module Structure
//!
//! ```text
//! src/dataloader/
//! ├── mod.rs             # Public API exports + module-level architecture docs
//! ├── config.rs          # DataLoaderConfig, builder, and validation
//! ├── loader.rs          # DataLoader struct, constructors, run lifecycle
//! ├── iterator.rs        # DataLoaderIter and the consumer-side protocol
//! └── workers/
//!     ├── mod.rs         # ExecutionMode, Producer, shared drive loop
//!     ├── thread.rs      # Producer thread
//!     └── process.rs     # Forked producer process + frame relay
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! let mut loader = DataLoader::from_generator(Some(5), true, true)?;
//! loader.set_batch_generator(
//!     || (0..4).map(|_| Batch::from_ragged(vec![vec![vec![0.5; 784]; 8], vec![vec![1.0]; 8]])),
//!     &[Place::Cpu],
//! )?;
//!
//! for batch in loader.iter()? {
//!     let batch = batch?; // "Blocking queue is killed..." if the producer failed
//! }
//! ```
//!
//! ## Notes:
//! - Thread mode waits for batches without a bound unless `timeout` is set.
//! - Process mode waits at most `DEFAULT_PROCESS_TIMEOUT` per batch by default.
//! - Memory held per loader is at most `capacity` batches (plus the pipe
//!   buffer in process mode).

// Module declarations
mod config;
mod iterator;
mod loader;
mod workers;

// Public re-exports
pub use config::{DataLoaderConfig, DataLoaderConfigBuilder, DEFAULT_PROCESS_TIMEOUT};
pub use iterator::DataLoaderIter;
pub use loader::{DataLoader, LoaderState};
pub use workers::{BatchIter, ExecutionMode, GeneratorFactory};
