//! Cleanup target trait

use async_trait::async_trait;

use crate::Result;

/// A component that can drop cached state when memory runs high.
///
/// The memory monitor receives its targets at construction and never reaches
/// into another component's internals.
#[async_trait]
pub trait CleanupTarget: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Drop whatever this target caches
    async fn cleanup(&self) -> Result<()>;
}
