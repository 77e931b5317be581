use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use pkg_state::handler::EntryEvent;
use pkg_types::service_entry::ServiceEntry;

use crate::convert;

const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Streams mesh ServiceEntry changes into the handler channel.
///
/// The kube watcher reports only the new object on a change, so the feed
/// keeps the last object seen per name to supply the old half of an update.
/// Across a re-list it also emits deletes for entries that vanished while
/// the watch was down, which recovers missed events.
pub struct KubeEntryFeed {
    api: Api<DynamicObject>,
    events: mpsc::Sender<EntryEvent>,
}

/// Last object seen per "namespace/name", plus the keys observed during an
/// in-progress re-list.
#[derive(Default)]
struct FeedState {
    seen: HashMap<String, ServiceEntry>,
    relisting: Option<HashSet<String>>,
}

impl KubeEntryFeed {
    /// Feed over ServiceEntries in every namespace.
    pub fn new(client: kube::Client, events: mpsc::Sender<EntryEvent>) -> Self {
        Self {
            api: Api::all_with(client, &convert::api_resource()),
            events,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("service entry event feed started");
        let mut state = FeedState::default();
        let mut stream = watcher::watcher(self.api.clone(), watcher::Config::default()).boxed();
        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        if self.forward(event, &mut state).await.is_err() {
                            info!("entry event channel closed, stopping feed");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("service entry watch error, retrying: {}", e);
                        tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
                    }
                    None => {
                        warn!("service entry watch stream ended");
                        return;
                    }
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("service entry event feed stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn forward(
        &self,
        event: Event<DynamicObject>,
        state: &mut FeedState,
    ) -> Result<(), mpsc::error::SendError<EntryEvent>> {
        match event {
            Event::Apply(obj) | Event::InitApply(obj) => {
                let new = match convert::object_to_entry(&obj) {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("ignoring object the feed cannot decode: {:#}", e);
                        return Ok(());
                    }
                };
                let key = feed_key(&new);
                if let Some(relisted) = state.relisting.as_mut() {
                    relisted.insert(key.clone());
                }
                match state.seen.insert(key, new.clone()) {
                    Some(old) => self.events.send(EntryEvent::Update { old, new }).await,
                    None => self.events.send(EntryEvent::Add(new)).await,
                }
            }
            Event::Delete(obj) => {
                let entry = match convert::object_to_entry(&obj) {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("ignoring object the feed cannot decode: {:#}", e);
                        return Ok(());
                    }
                };
                state.seen.remove(&feed_key(&entry));
                self.events.send(EntryEvent::Delete(entry)).await
            }
            Event::Init => {
                debug!("service entry watch (re)listing");
                state.relisting = Some(HashSet::new());
                Ok(())
            }
            Event::InitDone => {
                debug!("service entry watch initialized");
                // Entries that were not part of the re-list disappeared while
                // the watch was down.
                if let Some(relisted) = state.relisting.take() {
                    let vanished: Vec<String> = state
                        .seen
                        .keys()
                        .filter(|key| !relisted.contains(*key))
                        .cloned()
                        .collect();
                    for key in vanished {
                        if let Some(old) = state.seen.remove(&key) {
                            self.events.send(EntryEvent::Delete(old)).await?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

fn feed_key(entry: &ServiceEntry) -> String {
    format!(
        "{}/{}",
        entry.namespace.as_deref().unwrap_or_default(),
        entry.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::owner::OwnerReference;

    fn object(name: &str, address: &str) -> DynamicObject {
        convert::entry_to_object(&make_entry(name, address)).unwrap()
    }

    fn make_entry(name: &str, address: &str) -> ServiceEntry {
        use pkg_types::endpoint::Endpoint;
        use pkg_types::service_entry::{Location, Resolution, ServiceEntrySpec};
        ServiceEntry {
            name: name.to_string(),
            namespace: Some("default".to_string()),
            resource_version: None,
            owner_references: vec![OwnerReference::controller("bridge", "uid-1")],
            spec: ServiceEntrySpec {
                hosts: vec![name.to_string()],
                addresses: vec![],
                location: Location::MeshExternal,
                resolution: Resolution::Dns,
                ports: vec![],
                endpoints: vec![Endpoint::with_default_ports(address)],
            },
        }
    }

    fn feed_and_channel() -> (KubeEntryFeed, mpsc::Receiver<EntryEvent>) {
        // forward() never touches the API, so an inert client is enough.
        static CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();
        CRYPTO_PROVIDER.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
        let (tx, rx) = mpsc::channel(16);
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        (KubeEntryFeed::new(client, tx), rx)
    }

    #[tokio::test]
    async fn test_first_apply_is_add_then_update() {
        let (feed, mut rx) = feed_and_channel();
        let mut state = FeedState::default();

        feed.forward(Event::Apply(object("a", "1.1.1.1")), &mut state)
            .await
            .unwrap();
        feed.forward(Event::Apply(object("a", "2.2.2.2")), &mut state)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            EntryEvent::Add(entry) => assert_eq!(entry.name, "a"),
            other => panic!("expected add, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            EntryEvent::Update { old, new } => {
                assert_eq!(old.spec.endpoints[0].address, "1.1.1.1");
                assert_eq!(new.spec.endpoints[0].address, "2.2.2.2");
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relist_emits_deletes_for_vanished_entries() {
        let (feed, mut rx) = feed_and_channel();
        let mut state = FeedState::default();

        feed.forward(Event::Apply(object("a", "1.1.1.1")), &mut state)
            .await
            .unwrap();
        feed.forward(Event::Apply(object("b", "2.2.2.2")), &mut state)
            .await
            .unwrap();

        // Re-list only mentions "a"; "b" disappeared while disconnected.
        feed.forward(Event::Init, &mut state).await.unwrap();
        feed.forward(Event::InitApply(object("a", "1.1.1.1")), &mut state)
            .await
            .unwrap();
        feed.forward(Event::InitDone, &mut state).await.unwrap();

        let mut deletes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EntryEvent::Delete(entry) = event {
                deletes.push(entry.name);
            }
        }
        assert_eq!(deletes, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_forwards_last_seen_object() {
        let (feed, mut rx) = feed_and_channel();
        let mut state = FeedState::default();

        feed.forward(Event::Apply(object("a", "1.1.1.1")), &mut state)
            .await
            .unwrap();
        feed.forward(Event::Delete(object("a", "1.1.1.1")), &mut state)
            .await
            .unwrap();

        let _add = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            EntryEvent::Delete(entry) => assert_eq!(entry.name, "a"),
            other => panic!("expected delete, got {:?}", other),
        }
        assert!(state.seen.is_empty());
    }
}
