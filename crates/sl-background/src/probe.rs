//! Process memory probe backed by procfs

use std::path::PathBuf;

use sl_core::{MemoryProbe, MemoryReading};
use tracing::debug;

const BYTES_PER_KB: u64 = 1024;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Reads resident memory from `/proc/self/status`.
///
/// `VmRSS` is reported as used and `VmHWM` (peak resident size) as total. The
/// limit is the configured heap limit, or `MemTotal` from `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct ProcMemoryProbe {
    status_path: PathBuf,
    meminfo_path: PathBuf,
    limit_bytes: Option<u64>,
}

impl Default for ProcMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcMemoryProbe {
    pub fn new() -> Self {
        Self {
            status_path: PathBuf::from("/proc/self/status"),
            meminfo_path: PathBuf::from("/proc/meminfo"),
            limit_bytes: None,
        }
    }

    pub fn with_heap_limit_mb(mut self, limit_mb: Option<u64>) -> Self {
        self.limit_bytes = limit_mb.map(|mb| mb.saturating_mul(BYTES_PER_MB));
        self
    }

    /// Read from alternative files instead of procfs
    pub fn with_paths(mut self, status: impl Into<PathBuf>, meminfo: impl Into<PathBuf>) -> Self {
        self.status_path = status.into();
        self.meminfo_path = meminfo.into();
        self
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn read(&self) -> Option<MemoryReading> {
        let status = match std::fs::read_to_string(&self.status_path) {
            Ok(status) => status,
            Err(e) => {
                debug!(path = %self.status_path.display(), error = %e, "memory status unavailable");
                return None;
            }
        };

        let used_bytes = kb_field(&status, "VmRSS")?;
        let total_bytes = kb_field(&status, "VmHWM").unwrap_or(used_bytes);
        let limit_bytes = self
            .limit_bytes
            .or_else(|| {
                std::fs::read_to_string(&self.meminfo_path)
                    .ok()
                    .and_then(|meminfo| kb_field(&meminfo, "MemTotal"))
            })
            .unwrap_or(0);

        Some(MemoryReading {
            used_bytes,
            total_bytes,
            limit_bytes,
        })
    }
}

/// Parse a `Name:   1234 kB` line into bytes
fn kb_field(contents: &str, name: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let (key, rest) = line.split_once(':')?;
        if key.trim() != name {
            return None;
        }
        let value = rest.split_whitespace().next()?.parse::<u64>().ok()?;
        Some(value.saturating_mul(BYTES_PER_KB))
    })
}
