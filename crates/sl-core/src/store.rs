//! Persistent key/value store trait

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

/// Trait for durable key/value stores
///
/// Values are JSON documents. Callers namespace their keys with a prefix
/// (`quality:`, `project:`, ...) so unrelated state can share one store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value, replacing any existing one
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Write several values in one operation
    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()>;

    /// Remove a value, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// List every key starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove every key starting with `prefix`, returning how many were removed
    async fn remove_prefix(&self, prefix: &str) -> Result<usize>;
}
