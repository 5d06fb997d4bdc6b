//! Scorer trait

use crate::{QualityResult, Result};

/// Turns status update text into a quality result.
///
/// Implementations must be deterministic and must not fail because of the
/// input text. Calls are CPU-bound and made from the blocking thread pool.
pub trait Scorer: Send + Sync {
    fn score(&self, text: &str) -> Result<QualityResult>;
}
