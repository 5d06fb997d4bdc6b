//! Memory probe trait and raw readings

use serde::{Deserialize, Serialize};

/// Raw heap figures in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub limit_bytes: u64,
}

/// Source of process heap usage.
///
/// Returns `None` when the platform does not expose the figures.
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> Option<MemoryReading>;
}
