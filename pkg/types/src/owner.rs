use serde::{Deserialize, Serialize};

/// API group/version stamped on owner references created by this controller.
pub const API_VERSION: &str = "meshbridge.istio.io/v1alpha1";

/// Kind stamped on owner references created by this controller.
pub const KIND: &str = "ServiceController";

/// Marks a mesh resource as created by a specific controller instance.
///
/// Equality is structural across every field, including the UID, so two
/// controller incarnations with the same `name` but different UIDs do not
/// recognize each other's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

impl OwnerReference {
    /// Owner reference for the controller instance identified by `id`,
    /// scoped to one process lifetime by `uid`.
    pub fn controller(id: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: id.into(),
            uid: uid.into(),
            controller: true,
        }
    }
}
