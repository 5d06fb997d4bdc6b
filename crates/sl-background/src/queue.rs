//! Deduplicating, bounded-concurrency analysis queue

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use sl_core::{AnalysisRequest, Error, QualityResult, Result, Scorer};
use sl_store::ResultCache;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;

type Waiter = oneshot::Sender<Result<QualityResult>>;

/// Counters describing queue activity since startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub submitted: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub analyses: u64,
    pub failures: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    analyses: AtomicU64,
    failures: AtomicU64,
}

/// A fingerprint waiting for a scoring slot
struct Job {
    fingerprint: String,
    text: String,
}

struct QueueInner {
    scorer: Arc<dyn Scorer>,
    cache: ResultCache,
    in_flight: Mutex<HashMap<String, Vec<Waiter>>>,
    slots: Arc<Semaphore>,
    jobs: UnboundedSender<Job>,
    /// Taken by the first `submit`, which starts the admission task
    pending_jobs: Mutex<Option<UnboundedReceiver<Job>>>,
    analysis_timeout: Option<Duration>,
    counters: Counters,
}

/// Accepts analysis requests and answers each one exactly once.
///
/// Requests are answered from the result cache when possible. Concurrent
/// requests with the same fingerprint share a single scoring run, and at most
/// `max_concurrent` runs execute at a time, admitted in arrival order.
///
/// A run that outlives the analysis timeout fails its current waiters but
/// keeps its slot and its fingerprint until the scorer returns. Requests
/// arriving meanwhile attach to it and receive its result.
#[derive(Clone)]
pub struct AnalysisRequestQueue {
    inner: Arc<QueueInner>,
}

impl AnalysisRequestQueue {
    pub fn new(scorer: Arc<dyn Scorer>, cache: ResultCache, config: &QueueConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        info!(
            max_concurrent,
            timeout_secs = config.analysis_timeout.map(|t| t.as_secs()),
            "analysis queue ready"
        );

        let (jobs, pending_jobs) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                scorer,
                cache,
                in_flight: Mutex::new(HashMap::new()),
                slots: Arc::new(Semaphore::new(max_concurrent)),
                jobs,
                pending_jobs: Mutex::new(Some(pending_jobs)),
                analysis_timeout: config.analysis_timeout,
                counters: Counters::default(),
            }),
        }
    }

    /// Score a request, reusing a cached or in-flight result when one exists
    pub async fn submit(&self, request: AnalysisRequest) -> Result<QualityResult> {
        let inner = &self.inner;
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.start_admission();
        let fingerprint = request.fingerprint();

        if let Some(result) = inner.cached(&fingerprint).await {
            inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(request_id = %request.id, %fingerprint, "served from cache");
            return Ok(result);
        }

        let (waiter, receiver) = oneshot::channel();
        {
            let mut in_flight = inner.lock_in_flight();
            match in_flight.get_mut(&fingerprint) {
                Some(waiters) => {
                    waiters.push(waiter);
                    inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(request_id = %request.id, %fingerprint, "joined in-flight analysis");
                }
                None => {
                    // Enqueued under the lock so admission follows registration order
                    let job = Job {
                        fingerprint: fingerprint.clone(),
                        text: request.text,
                    };
                    if inner.jobs.send(job).is_err() {
                        return Err(Error::Scoring("Analysis queue is closed".to_string()));
                    }
                    in_flight.insert(fingerprint.clone(), vec![waiter]);
                    debug!(request_id = %request.id, %fingerprint, "queued analysis");
                }
            }
        }

        let outcome = receiver
            .await
            .unwrap_or_else(|_| Err(Error::Scoring("Analysis was abandoned".to_string())));
        if outcome.is_err() {
            inner.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Number of fingerprints currently being scored or waiting for a slot
    pub fn in_flight(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    pub fn stats(&self) -> QueueStats {
        let counters = &self.inner.counters;
        QueueStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            analyses: counters.analyses.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }

    fn start_admission(&self) {
        let pending = self
            .inner
            .pending_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(jobs) = pending {
            tokio::spawn(admit(
                Arc::downgrade(&self.inner),
                self.inner.slots.clone(),
                jobs,
            ));
        }
    }
}

/// Hand queued jobs a scoring slot one at a time, in the order they were queued
async fn admit(queue: Weak<QueueInner>, slots: Arc<Semaphore>, mut jobs: UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let permit = slots.clone().acquire_owned().await;
        let Some(inner) = queue.upgrade() else {
            break;
        };
        match permit {
            Ok(permit) => {
                tokio::spawn(inner.run(job, permit));
            }
            Err(_) => inner.settle(
                &job.fingerprint,
                Err(Error::Scoring("Analysis queue is closed".to_string())),
            ),
        }
    }
    debug!("analysis admission stopped");
}

impl QueueInner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, Vec<Waiter>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cache lookup where read failures count as a miss
    async fn cached(&self, fingerprint: &str) -> Option<QualityResult> {
        match self.cache.get(fingerprint).await {
            Ok(entry) => entry.map(|entry| entry.result),
            Err(e) => {
                warn!(fingerprint, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn run(self: Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let Job { fingerprint, text } = job;

        // Another run may have finished between the submitter's cache check and now
        if let Some(result) = self.cached(&fingerprint).await {
            drop(permit);
            self.settle(&fingerprint, Ok(result));
            return;
        }

        self.counters.analyses.fetch_add(1, Ordering::Relaxed);
        let scorer = self.scorer.clone();
        // The slot is held by the blocking task itself, so it outlives a timeout
        let mut task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            scorer.score(&text)
        });

        let joined = match self.analysis_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(%fingerprint, ?limit, "analysis timed out, still waiting for the scorer");
                    self.fail_waiters(
                        &fingerprint,
                        Error::Timeout(format!("Analysis timed out after {:?}", limit)),
                    );
                    task.await
                }
            },
            None => task.await,
        };

        let outcome = joined.unwrap_or_else(|e| {
            warn!(error = %e, "scoring task panicked");
            Err(Error::Scoring("Analysis failed: scoring task panicked".to_string()))
        });

        match &outcome {
            Ok(result) => {
                if let Err(e) = self.cache.put(&fingerprint, result).await {
                    warn!(%fingerprint, error = %e, "failed to cache quality result");
                }
            }
            Err(e) => warn!(%fingerprint, error = %e, "analysis failed"),
        }

        self.settle(&fingerprint, outcome);
    }

    /// Answer the current waiters with an error, keeping the fingerprint registered
    fn fail_waiters(&self, fingerprint: &str, error: Error) {
        let waiters = match self.lock_in_flight().get_mut(fingerprint) {
            Some(waiters) => std::mem::take(waiters),
            None => return,
        };
        let outcome = Err(error);
        for waiter in waiters {
            let _ = waiter.send(share(&outcome));
        }
    }

    /// Unregister the fingerprint and answer everyone attached to it
    fn settle(&self, fingerprint: &str, outcome: Result<QualityResult>) {
        let waiters = self.lock_in_flight().remove(fingerprint).unwrap_or_default();
        debug!(%fingerprint, waiters = waiters.len(), "analysis settled");
        for waiter in waiters {
            let _ = waiter.send(share(&outcome));
        }
    }
}

/// Copy an outcome for one of several waiters
fn share(outcome: &Result<QualityResult>) -> Result<QualityResult> {
    match outcome {
        Ok(result) => Ok(result.clone()),
        Err(Error::Timeout(msg)) => Err(Error::Timeout(msg.clone())),
        Err(Error::Scoring(msg)) => Err(Error::Scoring(msg.clone())),
        Err(other) => Err(Error::Scoring(other.to_string())),
    }
}
