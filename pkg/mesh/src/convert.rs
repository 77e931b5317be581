use anyhow::anyhow;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference as K8sOwnerReference;
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;

use pkg_types::owner::OwnerReference;
use pkg_types::service_entry::{ServiceEntry, ServiceEntrySpec};

pub const GROUP: &str = "networking.istio.io";
pub const VERSION: &str = "v1alpha3";
pub const KIND: &str = "ServiceEntry";

/// The ServiceEntry resource descriptor. The plural is given explicitly;
/// naive pluralization would guess "serviceentrys".
pub fn api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(GROUP, VERSION, KIND),
        "serviceentries",
    )
}

/// Render our partial view of an entry into the dynamic object the API
/// server expects.
pub fn entry_to_object(entry: &ServiceEntry) -> anyhow::Result<DynamicObject> {
    let mut obj = DynamicObject::new(&entry.name, &api_resource());
    obj.metadata.namespace = entry.namespace.clone();
    obj.metadata.resource_version = entry.resource_version.clone();
    if !entry.owner_references.is_empty() {
        obj.metadata.owner_references = Some(
            entry
                .owner_references
                .iter()
                .map(owner_to_k8s)
                .collect(),
        );
    }
    obj.data = serde_json::json!({ "spec": entry.spec });
    Ok(obj)
}

/// Extract our partial view from a dynamic object. Fails on objects without
/// a name or a decodable spec; callers treat that as "not a service entry".
pub fn object_to_entry(obj: &DynamicObject) -> anyhow::Result<ServiceEntry> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("object has no name"))?;
    let spec = obj
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| anyhow!("object {:?} has no spec", name))?;
    let spec: ServiceEntrySpec = serde_json::from_value(spec)?;

    Ok(ServiceEntry {
        name,
        namespace: obj.metadata.namespace.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        owner_references: obj
            .metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(k8s_to_owner)
            .collect(),
        spec,
    })
}

fn owner_to_k8s(owner: &OwnerReference) -> K8sOwnerReference {
    K8sOwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: Some(owner.controller),
        block_owner_deletion: None,
    }
}

fn k8s_to_owner(reference: &K8sOwnerReference) -> OwnerReference {
    OwnerReference {
        api_version: reference.api_version.clone(),
        kind: reference.kind.clone(),
        name: reference.name.clone(),
        uid: reference.uid.clone(),
        controller: reference.controller.unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::endpoint::Endpoint;
    use pkg_types::service_entry::{Location, Port, Resolution};

    fn entry() -> ServiceEntry {
        ServiceEntry {
            name: "cloudmap-demo.tetrate.io".to_string(),
            namespace: Some("istio-system".to_string()),
            resource_version: Some("42".to_string()),
            owner_references: vec![OwnerReference::controller("bridge", "uid-1")],
            spec: ServiceEntrySpec {
                hosts: vec!["demo.tetrate.io".to_string()],
                addresses: vec!["8.8.8.8".to_string()],
                location: Location::MeshExternal,
                resolution: Resolution::Static,
                ports: vec![Port {
                    name: "http".to_string(),
                    number: 80,
                    protocol: "HTTP".to_string(),
                }],
                endpoints: vec![Endpoint::with_default_ports("8.8.8.8")],
            },
        }
    }

    #[test]
    fn test_entry_round_trips_through_dynamic_object() {
        let original = entry();
        let obj = entry_to_object(&original).unwrap();
        let back = object_to_entry(&obj).unwrap();
        assert_eq!(original, back);
    }

    #[test]
    fn test_object_without_spec_is_rejected() {
        let obj = DynamicObject::new("broken", &api_resource());
        assert!(object_to_entry(&obj).is_err());
    }

    #[test]
    fn test_spec_serializes_with_wire_field_names() {
        let obj = entry_to_object(&entry()).unwrap();
        let spec = &obj.data["spec"];
        assert_eq!(spec["location"], "MESH_EXTERNAL");
        assert_eq!(spec["resolution"], "STATIC");
        assert_eq!(spec["hosts"][0], "demo.tetrate.io");
    }
}
