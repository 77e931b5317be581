use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One workload instance of an external service: an address plus the named
/// ports it serves. The address is either a literal IP or a DNS hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub ports: BTreeMap<String, u32>,
}

impl Endpoint {
    /// Endpoint exposing the conventional web ports, used when a registry
    /// reports an instance without any port information.
    pub fn with_default_ports(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ports: BTreeMap::from([("http".to_string(), 80), ("https".to_string(), 443)]),
        }
    }
}
