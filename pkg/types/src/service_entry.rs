use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::owner::OwnerReference;

/// How the mesh resolves an entry's endpoints at data-plane time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Static,
    Dns,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Static => write!(f, "STATIC"),
            Resolution::Dns => write!(f, "DNS"),
        }
    }
}

/// Where the service runs relative to the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Location {
    MeshExternal,
}

/// A service port exposed by a mesh entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub number: u32,
    pub protocol: String,
}

/// The declarative half of a mesh ServiceEntry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntrySpec {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub location: Location,
    pub resolution: Resolution,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// The slice of a mesh ServiceEntry this controller works with: identity,
/// ownership markers, the optimistic-concurrency token and the spec payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    pub spec: ServiceEntrySpec,
}

impl ServiceEntry {
    pub fn hosts(&self) -> &[String] {
        &self.spec.hosts
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.spec.endpoints
    }
}
