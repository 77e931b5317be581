use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use pkg_types::endpoint::Endpoint;

/// Thread-safe map of hostname to the endpoints its provider last reported.
///
/// Readers get a snapshot disjoint from the internal map, and writers replace
/// the whole map in one step; partial updates are never visible. The watcher
/// and the synchronizer share one store, so handing out live references would
/// race with the next refresh.
pub struct EndpointStore {
    hosts: RwLock<HashMap<String, Vec<Endpoint>>>,
}

impl EndpointStore {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// A deep copy of the current host map.
    pub fn snapshot(&self) -> HashMap<String, Vec<Endpoint>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Atomically replace the host map.
    pub fn replace(&self, hosts: HashMap<String, Vec<Endpoint>>) {
        *self.hosts.write().unwrap_or_else(PoisonError::into_inner) = hosts;
    }
}

impl Default for EndpointStore {
    fn default() -> Self {
        Self::new()
    }
}
