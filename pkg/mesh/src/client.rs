use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};

use pkg_controllers::client::EntryClient;
use pkg_types::service_entry::ServiceEntry;

use crate::convert;

/// Build a kube client from an explicit kubeconfig path, or fall back to
/// in-cluster configuration and the default kubeconfig discovery.
pub async fn kube_client(kube_config: Option<&str>) -> anyhow::Result<kube::Client> {
    match kube_config {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            Ok(kube::Client::try_from(config)?)
        }
        None => Ok(kube::Client::try_default().await?),
    }
}

/// `EntryClient` over the dynamic ServiceEntry API, scoped to the namespace
/// entries are published into.
pub struct KubeEntryClient {
    api: Api<DynamicObject>,
    namespace: String,
}

impl KubeEntryClient {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced_with(client, namespace, &convert::api_resource()),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl EntryClient for KubeEntryClient {
    async fn create(&self, mut entry: ServiceEntry) -> anyhow::Result<String> {
        entry.namespace = Some(self.namespace.clone());
        let obj = convert::entry_to_object(&entry)?;
        let created = self.api.create(&PostParams::default(), &obj).await?;
        Ok(created.metadata.resource_version.unwrap_or_default())
    }

    async fn update(&self, mut entry: ServiceEntry) -> anyhow::Result<String> {
        entry.namespace = Some(self.namespace.clone());
        let obj = convert::entry_to_object(&entry)?;
        let updated = self
            .api
            .replace(&entry.name, &PostParams::default(), &obj)
            .await?;
        Ok(updated.metadata.resource_version.unwrap_or_default())
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<ServiceEntry>> {
        match self.api.get_opt(name).await? {
            Some(obj) => Ok(Some(convert::object_to_entry(&obj)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Deleting an entry that is already gone counts as success.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
