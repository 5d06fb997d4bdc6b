//! Durable key/value store backed by a JSON file

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sl_core::{Error, KeyValueStore, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreFile {
    entries: BTreeMap<String, Value>,
    last_updated: DateTime<Utc>,
}

impl StoreFile {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

/// Key/value store that survives process restarts.
///
/// The whole map is kept in memory and written back on every mutation through
/// a temporary file and a rename, so a crash never leaves a half-written file.
/// A mutation only becomes visible once its write has succeeded.
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<StoreFile>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating an empty one if the file is missing.
    ///
    /// An unreadable file is moved aside to `<path>.corrupt` before starting
    /// empty, so the next write can't destroy it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let data = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str(&content) {
                Ok(data) => data,
                Err(e) => {
                    let aside = corrupt_path(&path);
                    tokio::fs::rename(&path, &aside).await.map_err(|err| {
                        Error::Store(format!("Failed to move aside {}: {}", path.display(), err))
                    })?;
                    warn!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        error = %e,
                        "store file unreadable, starting empty"
                    );
                    StoreFile::new()
                }
            }
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            StoreFile::new()
        };

        debug!(path = %path.display(), entries = data.entries.len(), "opened store");

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `next` and only then make it the live map
    async fn commit(&self, data: &mut StoreFile, mut next: StoreFile) -> Result<()> {
        next.last_updated = Utc::now();
        self.save(&next).await?;
        *data = next;
        Ok(())
    }

    async fn save(&self, data: &StoreFile) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| Error::Store(format!("Failed to replace {}: {}", self.path.display(), e)))
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.lock().await.entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        next.entries.insert(key.to_string(), value);
        self.commit(&mut data, next).await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut data = self.data.lock().await;
        let mut next = data.clone();
        next.entries.extend(entries);
        self.commit(&mut data, next).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        if !data.entries.contains_key(key) {
            return Ok(false);
        }
        let mut next = data.clone();
        next.entries.remove(key);
        self.commit(&mut data, next).await?;
        Ok(true)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .lock()
            .await
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        next.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = data.entries.len() - next.entries.len();

        if removed > 0 {
            self.commit(&mut data, next).await?;
        }
        Ok(removed)
    }
}
