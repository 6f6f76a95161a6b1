pub mod batch;
pub mod dataloader;
pub mod error;
pub mod place;
pub mod queue;

pub use batch::{Array, Batch};
pub use dataloader::{DataLoader, DataLoaderConfig, LoaderState};
pub use error::LoaderError;
pub use place::Place;
pub use queue::{BoundedQueue, QueueError};
