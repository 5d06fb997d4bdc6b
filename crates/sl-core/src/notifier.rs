//! Change notifier trait

use async_trait::async_trait;

use crate::Result;

/// Observes the local store and reacts to "something changed" events.
///
/// The monitor controller only toggles observation on and off; events carry
/// no payload it cares about.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Begin observing the local store
    async fn watch(&self) -> Result<()>;

    /// Cancel every active observation
    async fn stop_all(&self) -> Result<()>;
}
