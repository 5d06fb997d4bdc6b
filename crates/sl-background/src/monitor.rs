//! Monitoring state machine

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sl_core::ChangeNotifier;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Active/inactive switch over the change notifier.
///
/// Transitions are serialized in arrival order. Redundant calls are logged and
/// return without touching the notifier, and notifier failures never escape.
pub struct MonitorController {
    notifier: Arc<dyn ChangeNotifier>,
    active: AtomicBool,
    transitions: Mutex<()>,
}

impl MonitorController {
    pub fn new(notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self {
            notifier,
            active: AtomicBool::new(false),
            transitions: Mutex::new(()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub async fn start(&self) {
        let _transition = self.transitions.lock().await;
        self.start_locked().await;
    }

    pub async fn stop(&self) {
        let _transition = self.transitions.lock().await;
        self.stop_locked().await;
    }

    /// Stop then start as one transition
    pub async fn restart(&self) {
        let _transition = self.transitions.lock().await;
        self.stop_locked().await;
        self.start_locked().await;
    }

    async fn start_locked(&self) {
        if self.is_active() {
            debug!("monitoring already active");
            return;
        }

        match self.notifier.watch().await {
            Ok(()) => {
                self.active.store(true, Ordering::Release);
                info!("monitoring started");
            }
            Err(e) => warn!(error = %e, "failed to start monitoring, staying inactive"),
        }
    }

    async fn stop_locked(&self) {
        if !self.is_active() {
            debug!("monitoring already inactive");
            return;
        }

        self.active.store(false, Ordering::Release);
        match self.notifier.stop_all().await {
            Ok(()) => info!("monitoring stopped"),
            Err(e) => warn!(error = %e, "change notifier failed to stop cleanly"),
        }
    }
}
