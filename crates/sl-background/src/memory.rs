//! Heap usage sampling and pressure-driven cleanup

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use sl_core::{CleanupTarget, MemoryProbe, MemorySample, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{self, MemoryMonitorConfig};

type HighMemoryCallback = Arc<dyn Fn(&MemorySample) + Send + Sync>;

/// Snapshot of the monitor's bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub latest: Option<MemorySample>,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub cleanups: u64,
    pub history_len: usize,
    pub threshold_percent: f64,
    pub interval_seconds: u64,
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Set when another pass was already running and this one did nothing
    pub skipped: bool,
    pub cleaned: Vec<String>,
    pub failed: Vec<String>,
}

struct MonitorState {
    history: VecDeque<MemorySample>,
    history_capacity: usize,
    threshold_percent: f64,
    interval: Duration,
    last_cleanup: Option<DateTime<Utc>>,
    cleanups: u64,
}

/// Samples heap usage on a timer and runs cleanup above a threshold.
///
/// Cleanup targets are injected at construction and run in order. A failing
/// or panicking target is logged and the remaining targets still run.
pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    targets: Vec<Arc<dyn CleanupTarget>>,
    state: Mutex<MonitorState>,
    on_high_memory: Mutex<Option<HighMemoryCallback>>,
    cleaning: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        targets: Vec<Arc<dyn CleanupTarget>>,
        config: &MemoryMonitorConfig,
    ) -> Self {
        Self {
            probe,
            targets,
            state: Mutex::new(MonitorState {
                history: VecDeque::with_capacity(config.history_capacity),
                history_capacity: config.history_capacity.max(1),
                threshold_percent: config.threshold_percent,
                interval: config.interval,
                last_cleanup: None,
                cleanups: 0,
            }),
            on_high_memory: Mutex::new(None),
            cleaning: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the callback run with every sample above the threshold
    pub fn on_high_memory(&self, callback: impl Fn(&MemorySample) + Send + Sync + 'static) {
        *self.on_high_memory.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Start periodic sampling, replacing any running timer
    pub fn start(self: &Arc<Self>) {
        let interval = self.state().interval;
        let monitor = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; the first sample is one period out
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                // Restarting the timer aborts this task but not a pass already underway
                tokio::spawn(async move {
                    monitor.check_memory().await;
                });
            }
        });

        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "memory monitor started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
            info!("memory monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn threshold(&self) -> f64 {
        self.state().threshold_percent
    }

    pub fn set_threshold(&self, threshold_percent: f64) -> Result<()> {
        let threshold_percent = config::validate_threshold(threshold_percent)?;
        self.state().threshold_percent = threshold_percent;
        info!(threshold_percent, "memory threshold updated");
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        self.state().interval
    }

    /// Change the sampling period. A running timer restarts; history is kept.
    pub fn set_interval(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let interval = config::validate_interval(interval.as_secs())?;
        self.state().interval = interval;
        if self.is_running() {
            self.start();
        }
        Ok(())
    }

    /// Read the probe without recording anything
    pub fn current_sample(&self) -> Option<MemorySample> {
        self.probe
            .read()
            .map(|reading| MemorySample::from_reading(reading, Utc::now()))
    }

    /// Take a sample, record it and clean up when over the threshold
    pub async fn check_memory(&self) -> Option<MemorySample> {
        let Some(sample) = self.current_sample() else {
            debug!("memory figures unavailable, skipping sample");
            return None;
        };

        let threshold = {
            let mut state = self.state();
            if state.history.len() >= state.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(sample.clone());
            state.threshold_percent
        };

        debug!(
            used_mb = sample.used,
            limit_mb = sample.limit,
            percentage = sample.percentage,
            "memory sample"
        );

        if sample.percentage > threshold {
            warn!(
                percentage = sample.percentage,
                threshold, "memory usage above threshold"
            );
            let callback = self
                .on_high_memory
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback(&sample);
            }
            self.cleanup().await;
        }

        Some(sample)
    }

    /// Run every cleanup target once.
    ///
    /// Only one pass runs at a time; a call made during a pass returns a
    /// skipped report.
    pub async fn cleanup(&self) -> CleanupReport {
        if self
            .cleaning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("cleanup already in progress");
            return CleanupReport {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = CleaningGuard(&self.cleaning);

        info!(targets = self.targets.len(), "running memory cleanup");
        let mut report = CleanupReport::default();

        for target in &self.targets {
            let name = target.name().to_string();
            match AssertUnwindSafe(target.cleanup()).catch_unwind().await {
                Ok(Ok(())) => {
                    debug!(target = %name, "cleanup step finished");
                    report.cleaned.push(name);
                }
                Ok(Err(e)) => {
                    warn!(target = %name, error = %e, "cleanup step failed");
                    report.failed.push(name);
                }
                Err(_) => {
                    warn!(target = %name, "cleanup step panicked");
                    report.failed.push(name);
                }
            }
        }

        {
            let mut state = self.state();
            state.last_cleanup = Some(Utc::now());
            state.cleanups += 1;
        }

        info!(
            cleaned = report.cleaned.len(),
            failed = report.failed.len(),
            "memory cleanup finished"
        );
        report
    }

    pub fn last_cleanup(&self) -> Option<DateTime<Utc>> {
        self.state().last_cleanup
    }

    /// Recorded samples, oldest first
    pub fn history(&self) -> Vec<MemorySample> {
        self.state().history.iter().cloned().collect()
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state();
        MemoryStats {
            latest: state.history.back().cloned(),
            last_cleanup: state.last_cleanup,
            cleanups: state.cleanups,
            history_len: state.history.len(),
            threshold_percent: state.threshold_percent,
            interval_seconds: state.interval.as_secs(),
        }
    }
}

/// Clears the in-progress flag when a pass ends, including when it is dropped
struct CleaningGuard<'a>(&'a AtomicBool);

impl Drop for CleaningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}
