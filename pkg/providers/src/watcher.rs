use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::store::EndpointStore;

/// Capability set every provider watcher exposes to the rest of the system.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Poll the registry until the shutdown signal flips. One refresh runs
    /// immediately on entry, then one per interval; an in-flight refresh
    /// completes before the task exits.
    async fn run(&self, shutdown: watch::Receiver<bool>);

    /// The endpoint store this watcher feeds.
    fn store(&self) -> Arc<EndpointStore>;

    /// Name prefix for mesh entries built from this watcher's hosts, so
    /// entries from different providers never collide on a name.
    fn prefix(&self) -> &str;
}
