//! Local mirror of the project-tracking workspace
//!
//! Projects and status updates fetched from the remote workspace are written
//! here. Every write is announced on a broadcast channel so observers can
//! react without polling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sl_core::{CleanupTarget, Error, KeyValueStore, Result};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const PROJECT_PREFIX: &str = "project:";
const UPDATE_PREFIX: &str = "update:";
const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub state: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub id: String,
    /// Grouping key
    pub project_id: String,
    pub body: String,
    pub update_type: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    StatusUpdate,
}

impl EntityKind {
    fn prefix(&self) -> &'static str {
        match self {
            EntityKind::Project => PROJECT_PREFIX,
            EntityKind::StatusUpdate => UPDATE_PREFIX,
        }
    }
}

/// Announced after every successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub ids: Vec<String>,
}

/// Workspace entities persisted in the shared key/value store.
///
/// Reads go through a short-lived in-memory cache that the memory monitor can
/// clear at any time.
pub struct WorkspaceMirror {
    store: Arc<dyn KeyValueStore>,
    read_cache: RwLock<HashMap<String, serde_json::Value>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl WorkspaceMirror {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            read_cache: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Receive a [`ChangeEvent`] for every write from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.read(EntityKind::Project, id).await
    }

    pub async fn put_project(&self, project: Project) -> Result<()> {
        let id = project.id.clone();
        self.write(EntityKind::Project, vec![(id, serde_json::to_value(&project)?)])
            .await
    }

    pub async fn bulk_upsert_projects(&self, projects: Vec<Project>) -> Result<()> {
        let entries = projects
            .iter()
            .map(|p| -> Result<(String, serde_json::Value)> {
                Ok((p.id.clone(), serde_json::to_value(p)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.write(EntityKind::Project, entries).await
    }

    pub async fn get_update(&self, id: &str) -> Result<Option<StatusUpdate>> {
        self.read(EntityKind::StatusUpdate, id).await
    }

    pub async fn put_update(&self, update: StatusUpdate) -> Result<()> {
        let id = update.id.clone();
        self.write(EntityKind::StatusUpdate, vec![(id, serde_json::to_value(&update)?)])
            .await
    }

    pub async fn bulk_upsert_updates(&self, updates: Vec<StatusUpdate>) -> Result<()> {
        let entries = updates
            .iter()
            .map(|u| -> Result<(String, serde_json::Value)> {
                Ok((u.id.clone(), serde_json::to_value(u)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.write(EntityKind::StatusUpdate, entries).await
    }

    /// Every update belonging to `project_id`, newest first
    pub async fn updates_for_project(&self, project_id: &str) -> Result<Vec<StatusUpdate>> {
        let mut updates = Vec::new();

        for key in self.store.keys_with_prefix(UPDATE_PREFIX).await? {
            let id = &key[UPDATE_PREFIX.len()..];
            if let Some(update) = self.get_update(id).await? {
                if update.project_id == project_id {
                    updates.push(update);
                }
            }
        }

        updates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(updates)
    }

    pub async fn cached_reads(&self) -> usize {
        self.read_cache.read().await.len()
    }

    /// Drop the in-memory read cache, returning how many entries it held
    pub async fn clear_read_cache(&self) -> usize {
        let mut cache = self.read_cache.write().await;
        let cleared = cache.len();
        cache.clear();
        cleared
    }

    async fn read<T: DeserializeOwned>(&self, kind: EntityKind, id: &str) -> Result<Option<T>> {
        let key = format!("{}{}", kind.prefix(), id);

        let cached = self.read_cache.read().await.get(&key).cloned();
        let value = match cached {
            Some(value) => value,
            None => {
                // Held across the store read so a concurrent write can't be
                // evicted before this fill lands
                let mut cache = self.read_cache.write().await;
                match cache.get(&key) {
                    Some(value) => value.clone(),
                    None => match self.store.get(&key).await? {
                        Some(value) => {
                            cache.insert(key.clone(), value.clone());
                            value
                        }
                        None => return Ok(None),
                    },
                }
            }
        };

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::Store(format!("Corrupt {:?} {}: {}", kind, id, e)))
    }

    async fn write(&self, kind: EntityKind, entries: Vec<(String, serde_json::Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = entries.iter().map(|(id, _)| id.clone()).collect();
        let keyed: Vec<(String, serde_json::Value)> = entries
            .into_iter()
            .map(|(id, value)| (format!("{}{}", kind.prefix(), id), value))
            .collect();

        self.store.set_many(keyed.clone()).await?;

        let mut cache = self.read_cache.write().await;
        for (key, _) in &keyed {
            cache.remove(key);
        }
        drop(cache);

        debug!(kind = ?kind, count = ids.len(), "mirror updated");
        // no subscribers is fine
        let _ = self.changes.send(ChangeEvent { kind, ids });
        Ok(())
    }
}

#[async_trait]
impl CleanupTarget for WorkspaceMirror {
    fn name(&self) -> &str {
        "workspace-read-cache"
    }

    async fn cleanup(&self) -> Result<()> {
        let cleared = self.clear_read_cache().await;
        debug!(cleared, "cleared workspace read cache");
        Ok(())
    }
}
