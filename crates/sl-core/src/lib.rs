//! Core traits and types for StatusLens
//!
//! This crate defines the data model shared by every StatusLens component and
//! the ports the background service consumes: persistent key/value storage,
//! change notification, scoring, memory probing and cache cleanup. Keeping the ports
//! here lets the scoring, storage and orchestration crates stay independent of
//! one another and makes every collaborator swappable in tests.

pub mod cleanup;
pub mod error;
pub mod memory;
pub mod notifier;
pub mod scorer;
pub mod store;
pub mod types;

pub use cleanup::CleanupTarget;
pub use error::{Error, Result};
pub use memory::{MemoryProbe, MemoryReading};
pub use notifier::ChangeNotifier;
pub use scorer::Scorer;
pub use store::KeyValueStore;
pub use types::*;
