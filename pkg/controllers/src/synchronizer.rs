use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use pkg_providers::watcher::Watcher;
use pkg_state::entries::EntryStore;
use pkg_types::endpoint::Endpoint;
use pkg_types::owner::OwnerReference;

use crate::client::EntryClient;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Reconciles provider endpoint stores against the mesh's entry collection.
///
/// Entries are derived entirely from a host's endpoint list, so reconciling
/// a host reduces to comparing its current endpoints with the ones last
/// written. The entry store reflects what exists remotely (via the event
/// feed), which also closes the loop on our own writes: a successful create
/// shows up in `ours` a moment later and suppresses the next tick's write.
pub struct Synchronizer {
    owner: OwnerReference,
    entries: Arc<dyn EntryStore>,
    watchers: Vec<Arc<dyn Watcher>>,
    client: Arc<dyn EntryClient>,
    interval: Duration,
}

impl Synchronizer {
    pub fn new(
        owner: OwnerReference,
        entries: Arc<dyn EntryStore>,
        watchers: Vec<Arc<dyn Watcher>>,
        client: Arc<dyn EntryClient>,
    ) -> Self {
        Self {
            owner,
            entries,
            watchers,
            client,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Reconcile on every tick until the shutdown signal flips; an in-flight
    /// pass completes before the task exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Synchronizer started (interval={}s)", self.interval.as_secs());
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sync().await,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("Synchronizer stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn sync(&self) {
        for watcher in &self.watchers {
            self.sync_provider(watcher.as_ref()).await;
        }
    }

    async fn sync_provider(&self, watcher: &dyn Watcher) {
        let theirs = self.entries.theirs();
        for (host, endpoints) in watcher.store().snapshot() {
            // A foreign writer owns this host; leave its entry alone.
            if theirs.contains_key(&host) {
                continue;
            }
            self.reconcile_host(watcher.prefix(), &host, endpoints).await;
        }
        self.garbage_collect(watcher.prefix(), &watcher.store().snapshot())
            .await;
    }

    async fn reconcile_host(&self, prefix: &str, host: &str, endpoints: Vec<Endpoint>) {
        let name = pkg_infer::entry_name(prefix, host);
        let mut desired = pkg_infer::service_entry(&self.owner, prefix, host, endpoints);

        let ours = self.entries.ours();
        let current = match ours.get(host) {
            Some(current) => current,
            None => {
                match self.client.create(desired).await {
                    Ok(rv) => info!("created service entry {:?}, resource version is {:?}", name, rv),
                    Err(e) => warn!("error creating service entry {:?}: {:#}", name, e),
                }
                return;
            }
        };

        // An identical entry is already live; avoid write amplification.
        if current.spec.endpoints == desired.spec.endpoints {
            return;
        }

        // Re-read the live object for its resource version; the cached copy
        // may have been superseded by writes we have not observed yet.
        let live = match self.client.get(&name).await {
            Ok(Some(live)) => live,
            Ok(None) => return,
            Err(e) => {
                warn!("error fetching service entry {:?}: {:#}", name, e);
                return;
            }
        };
        desired.resource_version = live.resource_version;
        match self.client.update(desired).await {
            Ok(rv) => info!("updated service entry {:?}, resource version is now {:?}", name, rv),
            Err(e) => warn!("error updating service entry {:?}: {:#}", name, e),
        }
    }

    /// Delete entries we own whose host has disappeared from the provider.
    /// Only entries named with this provider's prefix are considered, so one
    /// provider never collects another's hosts.
    async fn garbage_collect(&self, prefix: &str, current_hosts: &HashMap<String, Vec<Endpoint>>) {
        for (host, entry) in self.entries.ours() {
            if !entry.name.starts_with(prefix) || current_hosts.contains_key(&host) {
                continue;
            }
            let name = pkg_infer::entry_name(prefix, &host);
            match self.client.delete(&name).await {
                Ok(()) => info!("deleted service entry {:?}", name),
                Err(e) => warn!("error deleting service entry {:?}: {:#}", name, e),
            }
        }
    }
}
