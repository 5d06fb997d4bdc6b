//! Message router owning every background component

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sl_core::{
    AnalysisRequest, ChangeNotifier, CleanupTarget, KeyValueStore, MemoryProbe, Result, Scorer,
};
use sl_scoring::ScoringEngine;
use sl_store::{
    Eviction, JsonFileStore, MemoryStore, MirrorChangeNotifier, ResultCache, WorkspaceMirror,
};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::memory::MemoryMonitor;
use crate::messages::{BackgroundMessage, BackgroundResponse, DecodedMessage};
use crate::monitor::MonitorController;
use crate::probe::ProcMemoryProbe;
use crate::queue::AnalysisRequestQueue;

/// Collaborators the service is assembled from
pub struct ServiceComponents {
    pub store: Arc<dyn KeyValueStore>,
    pub scorer: Arc<dyn Scorer>,
    pub notifier: Arc<dyn ChangeNotifier>,
    pub probe: Arc<dyn MemoryProbe>,
    /// Run after the result cache during memory cleanup
    pub cleanup_targets: Vec<Arc<dyn CleanupTarget>>,
    pub mirror: Option<Arc<WorkspaceMirror>>,
}

/// The long-running background service.
///
/// Owns the analysis queue, the monitoring state machine and the memory
/// monitor, and answers messages from the message channel.
pub struct BackgroundService {
    config: ServiceConfig,
    cache: ResultCache,
    queue: AnalysisRequestQueue,
    monitor: MonitorController,
    memory: Arc<MemoryMonitor>,
    mirror: Option<Arc<WorkspaceMirror>>,
}

impl BackgroundService {
    /// Build the production stack from configuration and launch it
    pub async fn start(config: ServiceConfig) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = match &config.data_file {
            Some(path) => {
                info!(path = %path.display(), "using durable store");
                Arc::new(JsonFileStore::open(path).await?)
            }
            None => {
                info!("using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let mirror = Arc::new(WorkspaceMirror::new(store.clone()));
        let notifier = Arc::new(MirrorChangeNotifier::new(mirror.clone()).with_callback(|event| {
            debug!(kind = ?event.kind, ids = ?event.ids, "workspace change observed");
        }));

        let engine = Arc::new(ScoringEngine::new());
        engine.warm_up()?;

        let probe = Arc::new(ProcMemoryProbe::new().with_heap_limit_mb(config.memory.heap_limit_mb));

        let components = ServiceComponents {
            store,
            scorer: engine.clone(),
            notifier,
            probe,
            cleanup_targets: vec![engine as Arc<dyn CleanupTarget>, mirror.clone()],
            mirror: Some(mirror),
        };

        let service = Self::with_components(config, components);
        service.launch().await;
        Ok(service)
    }

    /// Assemble the service without starting any timers or observation
    pub fn with_components(config: ServiceConfig, components: ServiceComponents) -> Self {
        let cache = ResultCache::new(components.store);
        let queue = AnalysisRequestQueue::new(components.scorer, cache.clone(), &config.queue);
        let monitor = MonitorController::new(components.notifier);

        let mut targets: Vec<Arc<dyn CleanupTarget>> = vec![Arc::new(cache.clone())];
        targets.extend(components.cleanup_targets);
        let memory = Arc::new(MemoryMonitor::new(components.probe, targets, &config.memory));
        memory.on_high_memory(|sample| {
            warn!(
                used_mb = sample.used,
                limit_mb = sample.limit,
                "high memory usage, dropping caches"
            );
        });

        Self {
            config,
            cache,
            queue,
            monitor,
            memory,
            mirror: components.mirror,
        }
    }

    /// Start the memory timer and, when configured, workspace monitoring
    pub async fn launch(&self) {
        self.memory.start();
        if self.config.start_monitoring {
            self.monitor.start().await;
        }
        info!("background service started");
    }

    pub async fn shutdown(&self) {
        self.memory.stop();
        self.monitor.stop().await;
        info!("background service stopped");
    }

    pub fn queue(&self) -> &AnalysisRequestQueue {
        &self.queue
    }

    pub fn monitor(&self) -> &MonitorController {
        &self.monitor
    }

    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.memory
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn mirror(&self) -> Option<&Arc<WorkspaceMirror>> {
        self.mirror.as_ref()
    }

    /// Answer one raw message. Every message gets exactly one response.
    pub async fn handle_message(&self, message: Value) -> BackgroundResponse {
        match BackgroundMessage::decode(message) {
            DecodedMessage::Message(message) => self.dispatch(message).await,
            DecodedMessage::Unknown => BackgroundResponse::failure("Unknown message type"),
            DecodedMessage::Invalid(reason) => {
                BackgroundResponse::failure(format!("Invalid message: {}", reason))
            }
        }
    }

    async fn dispatch(&self, message: BackgroundMessage) -> BackgroundResponse {
        match message {
            BackgroundMessage::Ping => BackgroundResponse::ok()
                .with_message("Pong from background script")
                .with_timestamp(Utc::now()),

            BackgroundMessage::OpenTimeline => {
                info!("timeline view requested");
                BackgroundResponse::ok()
            }

            BackgroundMessage::AnalyzeUpdateQuality {
                update_id,
                update_text,
                update_type,
                state,
            } => {
                let Some(text) = update_text.filter(|text| !text.trim().is_empty()) else {
                    return BackgroundResponse::failure("No update text provided");
                };
                let request = AnalysisRequest::new(
                    update_id.unwrap_or_default(),
                    text,
                    update_type.unwrap_or_default(),
                    state.unwrap_or_default(),
                );

                match self.queue.submit(request).await {
                    Ok(result) => BackgroundResponse::ok().with_result(result),
                    Err(e) => BackgroundResponse::failure(e.to_string()),
                }
            }

            BackgroundMessage::GetMemoryStats => match self.memory.current_sample() {
                Some(sample) => BackgroundResponse::ok().with_stats(sample, self.memory.last_cleanup()),
                None => BackgroundResponse::failure("Memory statistics are unavailable"),
            },

            BackgroundMessage::ForceCleanup => {
                self.memory.cleanup().await;
                BackgroundResponse::ok()
            }

            BackgroundMessage::InvalidateQualityCache { fingerprint } => {
                let evicted = match fingerprint {
                    Some(fingerprint) => self
                        .cache
                        .evict_one(&fingerprint)
                        .await
                        .map(usize::from),
                    None => self.cache.evict(Eviction::All).await,
                };
                match evicted {
                    Ok(evicted) => BackgroundResponse::ok().with_evicted(evicted),
                    Err(e) => BackgroundResponse::failure(e.to_string()),
                }
            }

            BackgroundMessage::GetMonitoringStatus => {
                BackgroundResponse::ok().with_active(self.monitor.is_active())
            }

            BackgroundMessage::SetMonitoring { enabled } => {
                if enabled {
                    self.monitor.start().await;
                } else {
                    self.monitor.stop().await;
                }
                BackgroundResponse::ok().with_active(self.monitor.is_active())
            }

            BackgroundMessage::ConfigureMemoryMonitor {
                threshold_percent,
                interval_seconds,
            } => match self.configure_memory(threshold_percent, interval_seconds) {
                Ok(()) => BackgroundResponse::ok(),
                Err(e) => BackgroundResponse::failure(e.to_string()),
            },
        }
    }

    fn configure_memory(&self, threshold_percent: Option<f64>, interval_seconds: Option<u64>) -> Result<()> {
        if let Some(threshold) = threshold_percent {
            self.memory.set_threshold(threshold)?;
        }
        if let Some(secs) = interval_seconds {
            self.memory.set_interval(Duration::from_secs(secs))?;
        }
        Ok(())
    }
}
