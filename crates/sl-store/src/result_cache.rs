//! Persistent cache of quality results

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sl_core::{CacheEntry, CleanupTarget, Error, KeyValueStore, QualityResult, Result};
use tracing::{debug, info, warn};

/// Namespace for cache keys inside the shared store
pub const CACHE_KEY_PREFIX: &str = "quality:";

/// Which entries to drop
pub enum Eviction {
    All,
    WrittenBefore(DateTime<Utc>),
    Matching(Box<dyn Fn(&CacheEntry) -> bool + Send + Sync>),
}

impl std::fmt::Debug for Eviction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eviction::All => write!(f, "All"),
            Eviction::WrittenBefore(cutoff) => write!(f, "WrittenBefore({})", cutoff),
            Eviction::Matching(_) => write!(f, "Matching(..)"),
        }
    }
}

/// Quality results keyed by request fingerprint.
///
/// Entries are written once and only disappear through [`ResultCache::evict`].
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KeyValueStore>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(fingerprint: &str) -> String {
        format!("{}{}", CACHE_KEY_PREFIX, fingerprint)
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let Some(value) = self.store.get(&Self::key(fingerprint)).await? else {
            return Ok(None);
        };

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::Cache(format!("Corrupt cache entry {}: {}", fingerprint, e)))
    }

    /// Store a result. Re-writing an identical result is a no-op; a different
    /// result for a cached fingerprint is refused and the first write wins.
    pub async fn put(&self, fingerprint: &str, result: &QualityResult) -> Result<()> {
        if let Ok(Some(existing)) = self.get(fingerprint).await {
            if existing.result != *result {
                warn!(
                    fingerprint,
                    "refusing to overwrite cached result with a different one"
                );
            }
            return Ok(());
        }

        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            result: result.clone(),
            written_at: Utc::now(),
        };
        self.store
            .set(&Self::key(fingerprint), serde_json::to_value(&entry)?)
            .await?;

        debug!(fingerprint, "cached quality result");
        Ok(())
    }

    pub async fn evict_one(&self, fingerprint: &str) -> Result<bool> {
        self.store.remove(&Self::key(fingerprint)).await
    }

    /// Drop entries, returning how many were removed
    pub async fn evict(&self, eviction: Eviction) -> Result<usize> {
        let removed = match eviction {
            Eviction::All => self.store.remove_prefix(CACHE_KEY_PREFIX).await?,
            Eviction::WrittenBefore(cutoff) => {
                self.evict_where(|entry| entry.written_at < cutoff).await?
            }
            Eviction::Matching(predicate) => self.evict_where(|entry| predicate(entry)).await?,
        };

        info!(removed, "evicted cached quality results");
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.keys_with_prefix(CACHE_KEY_PREFIX).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn evict_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> Result<usize> {
        let mut removed = 0;

        for key in self.store.keys_with_prefix(CACHE_KEY_PREFIX).await? {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };

            // unreadable entries are dropped along with matching ones
            let matches = match serde_json::from_value::<CacheEntry>(value) {
                Ok(entry) => predicate(&entry),
                Err(_) => true,
            };

            if matches && self.store.remove(&key).await? {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl CleanupTarget for ResultCache {
    fn name(&self) -> &str {
        "result-cache"
    }

    async fn cleanup(&self) -> Result<()> {
        self.evict(Eviction::All).await.map(|_| ())
    }
}
