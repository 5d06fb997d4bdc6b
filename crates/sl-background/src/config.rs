//! Service configuration

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sl_core::{Error, Result};

const DEFAULT_MAX_CONCURRENT: usize = 4;
const DEFAULT_ANALYSIS_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MEMORY_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_MEMORY_THRESHOLD_PERCENT: f64 = 80.0;
const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Analysis queue settings
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Maximum simultaneous scoring invocations
    pub max_concurrent: usize,
    /// `None` disables the per-analysis timeout
    pub analysis_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            analysis_timeout: Some(Duration::from_secs(DEFAULT_ANALYSIS_TIMEOUT_SECS)),
        }
    }
}

/// Memory monitor settings
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMonitorConfig {
    pub interval: Duration,
    pub threshold_percent: f64,
    pub history_capacity: usize,
    /// Overrides the limit reported by the probe
    pub heap_limit_mb: Option<u64>,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_MEMORY_INTERVAL_SECS),
            threshold_percent: DEFAULT_MEMORY_THRESHOLD_PERCENT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            heap_limit_mb: None,
        }
    }
}

/// Configuration for the whole background service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Durable store location; `None` keeps everything in memory
    pub data_file: Option<PathBuf>,
    pub queue: QueueConfig,
    pub memory: MemoryMonitorConfig,
    /// Start observing the workspace mirror at launch
    pub start_monitoring: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_file: None,
            queue: QueueConfig::default(),
            memory: MemoryMonitorConfig::default(),
            start_monitoring: true,
        }
    }
}

impl ServiceConfig {
    /// Create configuration from environment variables, loading `.env` first
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from any variable source, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        config.data_file = lookup("STATUSLENS_DATA_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        if let Some(max) = parse_var::<usize>(&lookup, "STATUSLENS_MAX_CONCURRENT")? {
            if max == 0 {
                return Err(Error::Configuration(
                    "STATUSLENS_MAX_CONCURRENT must be at least 1".to_string(),
                ));
            }
            config.queue.max_concurrent = max;
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "STATUSLENS_ANALYSIS_TIMEOUT_SECS")? {
            config.queue.analysis_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(threshold) = parse_var::<f64>(&lookup, "STATUSLENS_MEMORY_THRESHOLD")? {
            config.memory.threshold_percent = validate_threshold(threshold)?;
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "STATUSLENS_MEMORY_INTERVAL_SECS")? {
            config.memory.interval = validate_interval(secs)?;
        }

        config.memory.heap_limit_mb = parse_var::<u64>(&lookup, "STATUSLENS_HEAP_LIMIT_MB")?;

        if let Some(flag) = parse_var::<bool>(&lookup, "STATUSLENS_START_MONITORING")? {
            config.start_monitoring = flag;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that may have been set after loading
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent == 0 {
            return Err(Error::Configuration(
                "At least one concurrent analysis is required".to_string(),
            ));
        }
        validate_threshold(self.memory.threshold_percent)?;
        validate_interval(self.memory.interval.as_secs())?;
        Ok(())
    }
}

pub(crate) fn validate_threshold(threshold: f64) -> Result<f64> {
    if threshold.is_finite() && threshold > 0.0 && threshold <= 100.0 {
        Ok(threshold)
    } else {
        Err(Error::Configuration(format!(
            "Memory threshold must be within (0, 100], got {}",
            threshold
        )))
    }
}

pub(crate) fn validate_interval(secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(Error::Configuration(
            "Memory sampling interval must be at least one second".to_string(),
        ));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Configuration(format!("{} is invalid ({}): {}", name, raw, e))),
        _ => Ok(None),
    }
}
