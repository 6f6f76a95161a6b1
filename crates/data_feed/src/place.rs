use serde::{Deserialize, Serialize};
use std::fmt;

/// Target device a loader's batches are meant for.
///
/// The loader only stores and reports it. Moving batches onto the device is
/// the consumer's job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Place {
    #[default]
    Cpu,
    Cuda(usize),
    Xpu(usize),
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Cpu => write!(f, "cpu"),
            Place::Cuda(id) => write!(f, "cuda:{}", id),
            Place::Xpu(id) => write!(f, "xpu:{}", id),
        }
    }
}
