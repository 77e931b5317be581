//! Pure helpers that turn endpoint sets into the derived pieces of a mesh
//! entry: port names, resolution mode, deduplicated port lists and the entry
//! itself.

use std::collections::BTreeMap;
use std::net::IpAddr;

use pkg_types::endpoint::Endpoint;
use pkg_types::owner::OwnerReference;
use pkg_types::service_entry::{Location, Port, Resolution, ServiceEntry, ServiceEntrySpec};

/// Infer the conventional port name from a port number.
pub fn port_name(port: u32) -> &'static str {
    match port {
        80 => "http",
        443 => "https",
        _ => "tcp",
    }
}

/// Build a single-port endpoint, naming the port by convention.
pub fn endpoint(address: impl Into<String>, port: u32) -> Endpoint {
    Endpoint {
        address: address.into(),
        ports: BTreeMap::from([(port_name(port).to_string(), port)]),
    }
}

/// STATIC when the set is non-empty and every address is a literal IP;
/// DNS for an empty set or any hostname address.
pub fn resolution(endpoints: &[Endpoint]) -> Resolution {
    if endpoints.is_empty() {
        return Resolution::Dns;
    }
    for ep in endpoints {
        if ep.address.parse::<IpAddr>().is_err() {
            return Resolution::Dns;
        }
    }
    Resolution::Static
}

/// Collect the ports of a set of endpoints, deduplicated by port number and
/// sorted by number so the output is stable.
pub fn ports(endpoints: &[Endpoint]) -> Vec<Port> {
    let mut numbers: Vec<u32> = endpoints
        .iter()
        .flat_map(|ep| ep.ports.values().copied())
        .collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers
        .into_iter()
        .map(|number| Port {
            name: port_name(number).to_string(),
            number,
            protocol: port_name(number).to_uppercase(),
        })
        .collect()
}

/// Mesh entry name for a host produced by the provider with `prefix`.
pub fn entry_name(prefix: &str, host: &str) -> String {
    format!("{}{}", prefix, host)
}

/// Assemble the full mesh entry for a host from its endpoints.
///
/// The `addresses` field carries the first endpoint's address only when it
/// is a literal IP; hostname addresses are resolved by the mesh instead.
pub fn service_entry(
    owner: &OwnerReference,
    prefix: &str,
    host: &str,
    endpoints: Vec<Endpoint>,
) -> ServiceEntry {
    let addresses = endpoints
        .first()
        .filter(|ep| ep.address.parse::<IpAddr>().is_ok())
        .map(|ep| vec![ep.address.clone()])
        .unwrap_or_default();

    ServiceEntry {
        name: entry_name(prefix, host),
        namespace: None,
        resource_version: None,
        owner_references: vec![owner.clone()],
        spec: ServiceEntrySpec {
            hosts: vec![host.to_string()],
            addresses,
            location: Location::MeshExternal,
            resolution: resolution(&endpoints),
            ports: ports(&endpoints),
            endpoints,
        },
    }
}
