//! Status update quality scoring for StatusLens
//!
//! This crate provides the deterministic, multi-factor scoring engine that the
//! background service invokes on cache misses.

mod engine;
mod model;


pub use engine::{FactorScores, ScoringEngine};

// Re-export core types for convenience
pub use sl_core::{Error, QualityLevel, QualityResult, Result};
