use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;

use pkg_types::service_entry::ServiceEntry;

use crate::entries::EntryStore;

/// A change observed on the mesh's ServiceEntry collection.
#[derive(Debug, Clone)]
pub enum EntryEvent {
    Add(ServiceEntry),
    Update { old: ServiceEntry, new: ServiceEntry },
    Delete(ServiceEntry),
}

/// Applies feed events to the entry store, strictly one at a time.
pub struct EntryEventHandler {
    store: Arc<dyn EntryStore>,
}

impl EntryEventHandler {
    pub fn new(store: Arc<dyn EntryStore>) -> Self {
        Self { store }
    }

    pub fn handle(&self, event: EntryEvent) {
        match event {
            EntryEvent::Add(entry) => self.store.insert(entry),
            EntryEvent::Update { old, new } => self.store.update(old, new),
            EntryEvent::Delete(entry) => self.store.delete(entry),
        }
    }

    /// Consume events until the feed closes or shutdown flips.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<EntryEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("EntryEventHandler started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        info!("entry event feed closed");
                        return;
                    }
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("EntryEventHandler stopping");
                        return;
                    }
                }
            }
        }
    }
}
