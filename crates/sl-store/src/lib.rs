//! Storage for StatusLens
//!
//! This crate provides the key/value store adapters, the persistent quality
//! result cache, the local workspace mirror and its change notifier.

mod json_store;
mod memory_store;
mod mirror;
mod notifier;
mod result_cache;


pub use json_store::JsonFileStore;
pub use memory_store::MemoryStore;
pub use mirror::{ChangeEvent, EntityKind, Project, StatusUpdate, WorkspaceMirror};
pub use notifier::MirrorChangeNotifier;
pub use result_cache::{Eviction, ResultCache, CACHE_KEY_PREFIX};

// Re-export core types for convenience
pub use sl_core::{CacheEntry, Error, KeyValueStore, QualityResult, Result};
