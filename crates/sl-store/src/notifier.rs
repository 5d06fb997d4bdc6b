//! Change notifier over the workspace mirror

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sl_core::{ChangeNotifier, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mirror::{ChangeEvent, WorkspaceMirror};

type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Observes [`WorkspaceMirror`] writes.
///
/// Each `watch()` call adds one subscription task; `stop_all()` cancels them.
pub struct MirrorChangeNotifier {
    mirror: Arc<WorkspaceMirror>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
    changes_seen: Arc<AtomicU64>,
    on_change: Option<ChangeCallback>,
}

impl MirrorChangeNotifier {
    pub fn new(mirror: Arc<WorkspaceMirror>) -> Self {
        Self {
            mirror,
            subscriptions: Mutex::new(Vec::new()),
            changes_seen: Arc::new(AtomicU64::new(0)),
            on_change: None,
        }
    }

    /// Run `callback` for every observed change
    pub fn with_callback(mut self, callback: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(callback));
        self
    }

    pub fn changes_seen(&self) -> u64 {
        self.changes_seen.load(Ordering::Relaxed)
    }

    pub fn active_subscriptions(&self) -> usize {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions.retain(|handle| !handle.is_finished());
        subscriptions.len()
    }
}

#[async_trait]
impl ChangeNotifier for MirrorChangeNotifier {
    async fn watch(&self) -> Result<()> {
        let mut receiver = self.mirror.subscribe();
        let changes_seen = self.changes_seen.clone();
        let on_change = self.on_change.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        changes_seen.fetch_add(1, Ordering::Relaxed);
                        debug!(kind = ?event.kind, count = event.ids.len(), "workspace changed");
                        if let Some(callback) = &on_change {
                            callback(&event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change notifier fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        info!("watching workspace mirror for changes");
        Ok(())
    }

    async fn stop_all(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        let count = handles.len();
        for handle in handles {
            handle.abort();
        }
        info!(count, "stopped workspace change subscriptions");
        Ok(())
    }
}
