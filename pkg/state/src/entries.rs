use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use pkg_types::owner::OwnerReference;
use pkg_types::service_entry::ServiceEntry;

/// Which system owns a mesh entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Marked with our owner reference.
    Us,
    /// Marked by another writer, or carrying no marker at all.
    Them,
    /// Unknown to the store.
    None,
}

/// Mesh entries currently known to exist, partitioned by ownership.
///
/// A hostname is bound in at most one of the two partitions at any moment.
/// All reads return snapshots; all writes happen under one exclusive lock.
pub trait EntryStore: Send + Sync {
    /// Classify a host by which partition currently binds it.
    fn classify(&self, host: &str) -> Owner;

    /// Snapshot of the entries we created.
    fn ours(&self) -> HashMap<String, ServiceEntry>;

    /// Snapshot of the entries every other writer created.
    fn theirs(&self) -> HashMap<String, ServiceEntry>;

    /// The owner marker used for classification.
    fn owner_reference(&self) -> &OwnerReference;

    /// Register an entry under every host it claims.
    fn insert(&self, entry: ServiceEntry);

    /// Replace `old` with `new`; a no-op when the specs are structurally
    /// equal. Old and new may claim different hosts and carry different
    /// owners.
    fn update(&self, old: ServiceEntry, new: ServiceEntry);

    /// Unregister an entry from every host it claims.
    fn delete(&self, entry: ServiceEntry);
}

/// `EntryStore` backed by two in-memory maps under one readers-writer lock.
pub struct InMemoryEntryStore {
    owner: OwnerReference,
    maps: RwLock<Maps>,
}

#[derive(Default)]
struct Maps {
    ours: HashMap<String, ServiceEntry>,
    theirs: HashMap<String, ServiceEntry>,
}

impl Maps {
    fn insert(&mut self, owner: Owner, entry: &ServiceEntry) {
        for host in &entry.spec.hosts {
            // Keep the partitions disjoint: binding a host on one side
            // unbinds it on the other.
            match owner {
                Owner::Us => {
                    self.theirs.remove(host);
                    self.ours.insert(host.clone(), entry.clone());
                }
                // An entry without any owner marker is never adopted; it
                // counts as foreign so the synchronizer leaves it alone.
                Owner::Them | Owner::None => {
                    self.ours.remove(host);
                    self.theirs.insert(host.clone(), entry.clone());
                }
            }
        }
    }

    fn delete(&mut self, owner: Owner, entry: &ServiceEntry) {
        for host in &entry.spec.hosts {
            match owner {
                Owner::Us => {
                    self.ours.remove(host);
                }
                Owner::Them => {
                    self.theirs.remove(host);
                }
                Owner::None => {
                    self.ours.remove(host);
                    self.theirs.remove(host);
                }
            }
        }
    }
}

impl InMemoryEntryStore {
    pub fn new(owner: OwnerReference) -> Self {
        Self {
            owner,
            maps: RwLock::new(Maps::default()),
        }
    }
}

/// Classify a set of owner references against our marker: no references
/// means no owner; any structural match means us; anything else is a
/// foreign owner.
fn classify_references(ours: &OwnerReference, refs: &[OwnerReference]) -> Owner {
    if refs.is_empty() {
        return Owner::None;
    }
    if refs.iter().any(|r| r == ours) {
        return Owner::Us;
    }
    Owner::Them
}

impl EntryStore for InMemoryEntryStore {
    fn classify(&self, host: &str) -> Owner {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        if maps.ours.contains_key(host) {
            Owner::Us
        } else if maps.theirs.contains_key(host) {
            Owner::Them
        } else {
            Owner::None
        }
    }

    fn ours(&self) -> HashMap<String, ServiceEntry> {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ours
            .clone()
    }

    fn theirs(&self) -> HashMap<String, ServiceEntry> {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .theirs
            .clone()
    }

    fn owner_reference(&self) -> &OwnerReference {
        &self.owner
    }

    fn insert(&self, entry: ServiceEntry) {
        let owner = classify_references(&self.owner, &entry.owner_references);
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        maps.insert(owner, &entry);
    }

    fn update(&self, old: ServiceEntry, new: ServiceEntry) {
        if old.spec == new.spec {
            return;
        }
        let old_owner = classify_references(&self.owner, &old.owner_references);
        let new_owner = classify_references(&self.owner, &new.owner_references);
        // Remove-then-insert under one lock so no reader sees the host
        // unbound between the two halves.
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        maps.delete(old_owner, &old);
        maps.insert(new_owner, &new);
    }

    fn delete(&self, entry: ServiceEntry) {
        let owner = classify_references(&self.owner, &entry.owner_references);
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        maps.delete(owner, &entry);
    }
}

/// Decorator that reports every store call; wired in by the debug flag.
pub struct LoggingEntryStore<S> {
    inner: S,
}

impl<S: EntryStore> LoggingEntryStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: EntryStore> EntryStore for LoggingEntryStore<S> {
    fn classify(&self, host: &str) -> Owner {
        let owner = self.inner.classify(host);
        debug!("classified {:?} as {:?}", host, owner);
        owner
    }

    fn ours(&self) -> HashMap<String, ServiceEntry> {
        let ours = self.inner.ours();
        debug!("returned ours map with {} hosts", ours.len());
        ours
    }

    fn theirs(&self) -> HashMap<String, ServiceEntry> {
        let theirs = self.inner.theirs();
        debug!("returned theirs map with {} hosts", theirs.len());
        theirs
    }

    fn owner_reference(&self) -> &OwnerReference {
        self.inner.owner_reference()
    }

    fn insert(&self, entry: ServiceEntry) {
        debug!("inserting {:?} claiming {:?}", entry.name, entry.spec.hosts);
        self.inner.insert(entry);
    }

    fn update(&self, old: ServiceEntry, new: ServiceEntry) {
        debug!(
            "updating {:?}: hosts {:?} -> {:?}",
            new.name, old.spec.hosts, new.spec.hosts
        );
        self.inner.update(old, new);
    }

    fn delete(&self, entry: ServiceEntry) {
        debug!("deleting {:?} claiming {:?}", entry.name, entry.spec.hosts);
        self.inner.delete(entry);
    }
}
