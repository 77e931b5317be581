use async_trait::async_trait;

use pkg_types::service_entry::ServiceEntry;

/// The remote mesh store the synchronizer writes entries through.
///
/// Implementations treat "not found" as a soft condition: `get` returns
/// `None` for a missing entry and `delete` succeeds when the entry is
/// already gone. Every other failure is an error the caller logs and leaves
/// for the next tick.
#[async_trait]
pub trait EntryClient: Send + Sync {
    /// Create the entry; returns the stored resource version.
    async fn create(&self, entry: ServiceEntry) -> anyhow::Result<String>;

    /// Replace the entry; `resource_version` must be set from a prior `get`.
    async fn update(&self, entry: ServiceEntry) -> anyhow::Result<String>;

    /// Fetch the live entry by name.
    async fn get(&self, name: &str) -> anyhow::Result<Option<ServiceEntry>>;

    /// Remove the entry by name.
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
}
