//! Background analysis orchestration for StatusLens
//!
//! This crate wires the scoring engine, the persistent result cache and the
//! workspace mirror into a long-running service: a deduplicating analysis
//! queue, the monitoring state machine, the memory monitor and the message
//! router that answers requests arriving on the message channel.

mod config;
mod memory;
mod messages;
mod monitor;
mod probe;
mod queue;
mod service;

#[cfg(test)]
mod tests;

pub use config::{MemoryMonitorConfig, QueueConfig, ServiceConfig};
pub use memory::{CleanupReport, MemoryMonitor, MemoryStats};
pub use messages::{BackgroundMessage, BackgroundResponse, DecodedMessage};
pub use monitor::MonitorController;
pub use probe::ProcMemoryProbe;
pub use queue::{AnalysisRequestQueue, QueueStats};
pub use service::{BackgroundService, ServiceComponents};

// Re-export core types for convenience
pub use sl_core::{AnalysisRequest, Error, MemorySample, QualityResult, Result};
