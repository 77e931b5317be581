use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_servicediscovery::config::{Credentials, Region};
use aws_sdk_servicediscovery::types::{FilterCondition, ServiceFilter, ServiceFilterName};
use tokio::sync::watch;
use tracing::{error, info};

use pkg_types::endpoint::Endpoint;

use crate::store::EndpointStore;
use crate::watcher::Watcher;

const ATTR_IPV4: &str = "AWS_INSTANCE_IPV4";
const ATTR_CNAME: &str = "AWS_INSTANCE_CNAME";
const ATTR_PORT: &str = "AWS_INSTANCE_PORT";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// A Cloud Map namespace, by ID and DNS name.
#[derive(Debug, Clone)]
pub struct CloudMapNamespace {
    pub id: String,
    pub name: String,
}

/// One registered instance of a Cloud Map service.
#[derive(Debug, Clone, Default)]
pub struct CloudMapInstance {
    pub instance_id: Option<String>,
    pub attributes: HashMap<String, String>,
}

/// The slice of the Cloud Map service-discovery API the watcher needs.
#[async_trait]
pub trait CloudMapApi: Send + Sync {
    async fn list_namespaces(&self) -> anyhow::Result<Vec<CloudMapNamespace>>;

    /// Names of the services registered in the namespace with `namespace_id`.
    async fn list_services(&self, namespace_id: &str) -> anyhow::Result<Vec<String>>;

    async fn discover_instances(
        &self,
        namespace: &str,
        service: &str,
    ) -> anyhow::Result<Vec<CloudMapInstance>>;
}

/// `CloudMapApi` backed by the AWS SDK.
pub struct AwsCloudMapApi {
    client: aws_sdk_servicediscovery::Client,
}

impl AwsCloudMapApi {
    /// Connect to Cloud Map. The region comes from the argument or
    /// `AWS_REGION`; explicit credentials are used only when both halves of
    /// the key pair are given, otherwise the SDK default chain applies.
    pub async fn connect(
        region: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let region = region
            .or_else(|| std::env::var("AWS_REGION").ok())
            .ok_or_else(|| anyhow::anyhow!("AWS region must be specified (flag or AWS_REGION)"))?;

        let mut loader =
            aws_config::defaults(aws_config::BehaviorVersion::latest()).region(Region::new(region));
        if let (Some(id), Some(secret)) = (access_key_id, secret_access_key) {
            loader =
                loader.credentials_provider(Credentials::new(id, secret, None, None, "meshbridge"));
        }
        let config = loader.load().await;
        Ok(Self {
            client: aws_sdk_servicediscovery::Client::new(&config),
        })
    }
}

#[async_trait]
impl CloudMapApi for AwsCloudMapApi {
    async fn list_namespaces(&self) -> anyhow::Result<Vec<CloudMapNamespace>> {
        let mut namespaces = Vec::new();
        let mut pages = self.client.list_namespaces().into_paginator().send();
        while let Some(page) = pages.next().await {
            for ns in page?.namespaces.unwrap_or_default() {
                if let (Some(id), Some(name)) = (ns.id, ns.name) {
                    namespaces.push(CloudMapNamespace { id, name });
                }
            }
        }
        Ok(namespaces)
    }

    async fn list_services(&self, namespace_id: &str) -> anyhow::Result<Vec<String>> {
        let filter = ServiceFilter::builder()
            .name(ServiceFilterName::NamespaceId)
            .values(namespace_id)
            .condition(FilterCondition::Eq)
            .build()?;

        let mut names = Vec::new();
        let mut pages = self
            .client
            .list_services()
            .filters(filter)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            for service in page?.services.unwrap_or_default() {
                if let Some(name) = service.name {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    async fn discover_instances(
        &self,
        namespace: &str,
        service: &str,
    ) -> anyhow::Result<Vec<CloudMapInstance>> {
        let out = self
            .client
            .discover_instances()
            .namespace_name(namespace)
            .service_name(service)
            .send()
            .await?;
        Ok(out
            .instances
            .unwrap_or_default()
            .into_iter()
            .map(|inst| CloudMapInstance {
                instance_id: inst.instance_id,
                attributes: inst.attributes.unwrap_or_default(),
            })
            .collect())
    }
}

/// Polls Cloud Map and replaces the endpoint store wholesale on success.
pub struct CloudMapWatcher {
    api: Arc<dyn CloudMapApi>,
    store: Arc<EndpointStore>,
    interval: Duration,
}

impl CloudMapWatcher {
    pub fn new(api: Arc<dyn CloudMapApi>, store: Arc<EndpointStore>) -> Self {
        Self {
            api,
            store,
            interval: DEFAULT_INTERVAL,
        }
    }

    async fn refresh(&self) {
        let namespaces = match self.api.list_namespaces().await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                error!("error retrieving namespace list from Cloud Map: {:#}", e);
                return;
            }
        };

        // The next map is assembled fully before touching the store: a failed
        // namespace leaves the previous (stale but complete) view in place,
        // since a partial map would make the synchronizer GC live hosts.
        let mut hosts = HashMap::new();
        for ns in &namespaces {
            match self.hosts_for_namespace(ns).await {
                Ok(ns_hosts) => hosts.extend(ns_hosts),
                Err(e) => {
                    error!(
                        "unable to refresh Cloud Map cache, keeping existing cache: {:#}",
                        e
                    );
                    return;
                }
            }
        }
        self.store.replace(hosts);
        info!("Cloud Map store sync successful");
    }

    async fn hosts_for_namespace(
        &self,
        ns: &CloudMapNamespace,
    ) -> anyhow::Result<HashMap<String, Vec<Endpoint>>> {
        let mut hosts = HashMap::new();
        let services = self.api.list_services(&ns.id).await?;
        for service in services {
            // Hosts are "service.namespace", so they cannot repeat across
            // namespaces or services.
            let host = format!("{}.{}", service, ns.name);
            let endpoints = self.endpoints_for_service(&ns.name, &service).await?;
            info!("{} endpoints found for {:?}", endpoints.len(), host);
            hosts.insert(host, endpoints);
        }
        Ok(hosts)
    }

    async fn endpoints_for_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> anyhow::Result<Vec<Endpoint>> {
        let mut instances = self.api.discover_instances(namespace, service).await?;
        // A service with no registered instances stays reachable over DNS by
        // synthesizing a CNAME instance pointing at the service hostname.
        if instances.is_empty() {
            let host = format!("{}.{}", service, namespace);
            instances = vec![CloudMapInstance {
                instance_id: None,
                attributes: HashMap::from([(ATTR_CNAME.to_string(), host)]),
            }];
        }
        Ok(instances.iter().filter_map(instance_endpoint).collect())
    }
}

#[async_trait]
impl Watcher for CloudMapWatcher {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "CloudMapWatcher started (interval={}s)",
            self.interval.as_secs()
        );
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.refresh().await,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("CloudMapWatcher stopping");
                        return;
                    }
                }
            }
        }
    }

    fn store(&self) -> Arc<EndpointStore> {
        Arc::clone(&self.store)
    }

    fn prefix(&self) -> &str {
        "cloudmap-"
    }
}

/// Translate one Cloud Map instance into an endpoint, preferring the IPv4
/// attribute over CNAME and falling back to http/https when the port
/// attribute is absent or malformed.
fn instance_endpoint(instance: &CloudMapInstance) -> Option<Endpoint> {
    let address = match instance
        .attributes
        .get(ATTR_IPV4)
        .or_else(|| instance.attributes.get(ATTR_CNAME))
    {
        Some(address) if !address.is_empty() => address.clone(),
        _ => {
            info!(
                "instance {:?} is of a type that is not currently supported",
                instance.instance_id
            );
            return None;
        }
    };

    if let Some(port) = instance.attributes.get(ATTR_PORT) {
        match port.parse::<u32>() {
            Ok(port) => return Some(pkg_infer::endpoint(address, port)),
            Err(e) => error!("error converting port {:?} to int: {}", port, e),
        }
    }
    info!(
        "no port found for address {}, assuming http (80) and https (443)",
        address
    );
    Some(Endpoint::with_default_ports(address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Canned Cloud Map API; `fail_*` flags inject errors per call.
    #[derive(Default)]
    struct MockApi {
        namespaces: Vec<CloudMapNamespace>,
        services: HashMap<String, Vec<String>>,
        instances: HashMap<String, Vec<CloudMapInstance>>,
        fail_namespaces: bool,
        fail_services: bool,
    }

    #[async_trait]
    impl CloudMapApi for MockApi {
        async fn list_namespaces(&self) -> anyhow::Result<Vec<CloudMapNamespace>> {
            if self.fail_namespaces {
                anyhow::bail!("cloud map is down");
            }
            Ok(self.namespaces.clone())
        }

        async fn list_services(&self, namespace_id: &str) -> anyhow::Result<Vec<String>> {
            if self.fail_services {
                anyhow::bail!("throttled");
            }
            Ok(self.services.get(namespace_id).cloned().unwrap_or_default())
        }

        async fn discover_instances(
            &self,
            namespace: &str,
            service: &str,
        ) -> anyhow::Result<Vec<CloudMapInstance>> {
            let key = format!("{}.{}", service, namespace);
            Ok(self.instances.get(&key).cloned().unwrap_or_default())
        }
    }

    fn instance(attributes: &[(&str, &str)]) -> CloudMapInstance {
        CloudMapInstance {
            instance_id: Some("i-1".to_string()),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn tetrate_namespace() -> Vec<CloudMapNamespace> {
        vec![CloudMapNamespace {
            id: "ns-1".to_string(),
            name: "tetrate.io".to_string(),
        }]
    }

    fn demo_services() -> HashMap<String, Vec<String>> {
        HashMap::from([("ns-1".to_string(), vec!["demo".to_string()])])
    }

    fn watcher_with(api: MockApi) -> CloudMapWatcher {
        CloudMapWatcher::new(Arc::new(api), Arc::new(EndpointStore::new()))
    }

    #[tokio::test]
    async fn test_refresh_maps_ipv4_instances() {
        let api = MockApi {
            namespaces: tetrate_namespace(),
            services: demo_services(),
            instances: HashMap::from([(
                "demo.tetrate.io".to_string(),
                vec![instance(&[(ATTR_IPV4, "8.8.8.8")])],
            )]),
            ..Default::default()
        };
        let watcher = watcher_with(api);

        watcher.refresh().await;

        let snapshot = watcher.store().snapshot();
        assert_eq!(
            snapshot["demo.tetrate.io"],
            vec![Endpoint::with_default_ports("8.8.8.8")]
        );
    }

    #[tokio::test]
    async fn test_refresh_synthesizes_cname_for_empty_service() {
        let api = MockApi {
            namespaces: tetrate_namespace(),
            services: demo_services(),
            ..Default::default()
        };
        let watcher = watcher_with(api);

        watcher.refresh().await;

        let snapshot = watcher.store().snapshot();
        assert_eq!(
            snapshot["demo.tetrate.io"],
            vec![Endpoint::with_default_ports("demo.tetrate.io")]
        );
    }

    #[tokio::test]
    async fn test_refresh_keeps_store_when_namespace_listing_fails() {
        let api = MockApi {
            fail_namespaces: true,
            ..Default::default()
        };
        let watcher = watcher_with(api);
        watcher.store().replace(HashMap::from([(
            "demo.tetrate.io".to_string(),
            vec![Endpoint::with_default_ports("8.8.8.8")],
        )]));

        watcher.refresh().await;

        assert_eq!(watcher.store().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_aborts_cycle_when_a_namespace_fails() {
        let api = MockApi {
            namespaces: tetrate_namespace(),
            fail_services: true,
            ..Default::default()
        };
        let watcher = watcher_with(api);
        watcher.store().replace(HashMap::from([(
            "old.tetrate.io".to_string(),
            vec![Endpoint::with_default_ports("8.8.8.8")],
        )]));

        watcher.refresh().await;

        // The stale view survives; a partial replacement would let the
        // synchronizer delete live hosts.
        assert!(watcher.store().snapshot().contains_key("old.tetrate.io"));
    }

    #[test]
    fn test_instance_endpoint_port_parsing() {
        let ep = instance_endpoint(&instance(&[(ATTR_IPV4, "1.1.1.1"), (ATTR_PORT, "80")])).unwrap();
        assert_eq!(ep.ports, BTreeMap::from([("http".to_string(), 80)]));

        let ep =
            instance_endpoint(&instance(&[(ATTR_IPV4, "1.1.1.1"), (ATTR_PORT, "9999")])).unwrap();
        assert_eq!(ep.ports, BTreeMap::from([("tcp".to_string(), 9999)]));

        let ep = instance_endpoint(&instance(&[(ATTR_IPV4, "1.1.1.1"), (ATTR_PORT, "notanint")]))
            .unwrap();
        assert_eq!(
            ep.ports,
            BTreeMap::from([("http".to_string(), 80), ("https".to_string(), 443)])
        );
    }

    #[test]
    fn test_instance_endpoint_prefers_ipv4_over_cname() {
        let ep = instance_endpoint(&instance(&[
            (ATTR_IPV4, "1.1.1.1"),
            (ATTR_CNAME, "demo.tetrate.io"),
        ]))
        .unwrap();
        assert_eq!(ep.address, "1.1.1.1");
    }

    #[test]
    fn test_instance_endpoint_drops_unsupported_instance() {
        assert!(instance_endpoint(&instance(&[("SOMETHING_ELSE", "x")])).is_none());
    }
}
