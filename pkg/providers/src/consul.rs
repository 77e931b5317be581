use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::Url;

use pkg_types::endpoint::Endpoint;

use crate::error::ProviderError;
use crate::store::EndpointStore;
use crate::watcher::Watcher;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Server-side long-poll wait; kept well under the HTTP client timeout so a
/// quiet catalog still answers before the client gives up.
const BLOCKING_WAIT: &str = "10s";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const INDEX_HEADER: &str = "X-Consul-Index";

/// One page of the consul service catalog, with the blocking index to resume
/// from.
#[derive(Debug, Clone)]
pub struct ServicesPage {
    pub services: Vec<String>,
    pub last_index: u64,
}

/// A consul catalog record for one service instance.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogService {
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,
    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
    #[serde(rename = "ServicePort", default)]
    pub service_port: u32,
}

/// The slice of consul's catalog API the watcher needs.
#[async_trait]
pub trait ConsulCatalog: Send + Sync {
    /// List service names, blocking server-side until the catalog index
    /// passes `wait_index` or the server's wait timeout elapses.
    async fn services(&self, wait_index: u64) -> anyhow::Result<ServicesPage>;

    /// The instances of one service.
    async fn service(&self, name: &str) -> anyhow::Result<Vec<CatalogService>>;
}

/// `ConsulCatalog` over consul's HTTP API.
pub struct HttpConsulCatalog {
    base: Url,
    http: reqwest::Client,
}

impl HttpConsulCatalog {
    /// Build a catalog client for `endpoint`, e.g. `http://consul:8500`.
    pub fn new(endpoint: &str) -> Result<Self, ProviderError> {
        let base = Url::parse(endpoint).map_err(|e| ProviderError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if !base.has_host() {
            return Err(ProviderError::InvalidEndpoint {
                url: endpoint.to_string(),
                reason: "missing host".to_string(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(ProviderError::Http)?;
        Ok(Self { base, http })
    }
}

#[async_trait]
impl ConsulCatalog for HttpConsulCatalog {
    async fn services(&self, wait_index: u64) -> anyhow::Result<ServicesPage> {
        let mut url = self.base.join("v1/catalog/services")?;
        url.query_pairs_mut()
            .append_pair("index", &wait_index.to_string())
            .append_pair("wait", BLOCKING_WAIT);

        let resp = self.http.get(url).send().await.map_err(ProviderError::Http)?;
        if !resp.status().is_success() {
            return Err(ProviderError::Status(resp.status()).into());
        }
        let last_index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(ProviderError::MissingIndex)?;

        let services: HashMap<String, Vec<String>> =
            resp.json().await.map_err(ProviderError::Http)?;
        Ok(ServicesPage {
            services: services.into_keys().collect(),
            last_index,
        })
    }

    async fn service(&self, name: &str) -> anyhow::Result<Vec<CatalogService>> {
        let url = self.base.join(&format!("v1/catalog/service/{}", name))?;
        let resp = self.http.get(url).send().await.map_err(ProviderError::Http)?;
        if !resp.status().is_success() {
            return Err(ProviderError::Status(resp.status()).into());
        }
        Ok(resp.json().await.map_err(ProviderError::Http)?)
    }
}

/// Polls the consul catalog with blocking queries and replaces the endpoint
/// store when the catalog index moves.
pub struct ConsulWatcher {
    catalog: Arc<dyn ConsulCatalog>,
    store: Arc<EndpointStore>,
    interval: Duration,
    last_index: AtomicU64,
}

impl ConsulWatcher {
    pub fn new(catalog: Arc<dyn ConsulCatalog>, store: Arc<EndpointStore>) -> Self {
        Self {
            catalog,
            store,
            interval: DEFAULT_INTERVAL,
            last_index: AtomicU64::new(0),
        }
    }

    async fn refresh(&self) {
        let wait_index = self.last_index.load(Ordering::Acquire);
        let page = match self.catalog.services(wait_index).await {
            Ok(page) => page,
            Err(e) => {
                error!("error listing services from consul: {:#}", e);
                return;
            }
        };
        if page.last_index == wait_index {
            // The blocking read timed out without catalog movement.
            info!("consul catalog index unchanged at {}, skipping cycle", wait_index);
            return;
        }

        let mut hosts = HashMap::new();
        for name in &page.services {
            let instances = match self.catalog.service(name).await {
                Ok(instances) => instances,
                Err(e) => {
                    warn!("failed to describe consul service {:?}, skipping it: {:#}", name, e);
                    continue;
                }
            };
            let endpoints: Vec<Endpoint> = instances
                .iter()
                .filter_map(catalog_service_endpoint)
                .collect();
            if !endpoints.is_empty() {
                hosts.insert(name.clone(), endpoints);
            }
        }
        self.store.replace(hosts);
        self.last_index.store(page.last_index, Ordering::Release);
        info!("consul store sync successful (index {})", page.last_index);
    }
}

#[async_trait]
impl Watcher for ConsulWatcher {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("ConsulWatcher started (interval={}s)", self.interval.as_secs());
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.refresh().await,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("ConsulWatcher stopping");
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
        "consul-"
    }
}

/// Translate one catalog record into an endpoint. Records without a node
/// address are dropped; a zero port means "unset" and falls back to the
/// http/https defaults.
fn catalog_service_endpoint(service: &CatalogService) -> Option<Endpoint> {
    if service.address.is_empty() {
        info!(
            "instance {:?} of {:?} is of a type that is not currently supported",
            service.service_id, service.service_name
        );
        return None;
    }
    if service.service_port > 0 {
        return Some(pkg_infer::endpoint(service.address.clone(), service.service_port));
    }
    info!(
        "no port found for address {}, assuming http (80) and https (443)",
        service.address
    );
    Some(Endpoint::with_default_ports(service.address.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Canned catalog; failures are injected per service name.
    #[derive(Default)]
    struct MockCatalog {
        last_index: u64,
        services: HashMap<String, Vec<CatalogService>>,
        failing_services: Vec<String>,
        fail_listing: bool,
    }

    #[async_trait]
    impl ConsulCatalog for MockCatalog {
        async fn services(&self, _wait_index: u64) -> anyhow::Result<ServicesPage> {
            if self.fail_listing {
                anyhow::bail!("consul unreachable");
            }
            let mut services: Vec<String> = self.services.keys().cloned().collect();
            services.extend(self.failing_services.iter().cloned());
            Ok(ServicesPage {
                services,
                last_index: self.last_index,
            })
        }

        async fn service(&self, name: &str) -> anyhow::Result<Vec<CatalogService>> {
            if self.failing_services.iter().any(|s| s == name) {
                anyhow::bail!("rpc error");
            }
            Ok(self.services.get(name).cloned().unwrap_or_default())
        }
    }

    fn record(address: &str, port: u32) -> CatalogService {
        CatalogService {
            address: address.to_string(),
            service_id: "svc-1".to_string(),
            service_name: "web".to_string(),
            service_port: port,
        }
    }

    fn watcher_with(catalog: MockCatalog) -> ConsulWatcher {
        ConsulWatcher::new(Arc::new(catalog), Arc::new(EndpointStore::new()))
    }

    #[tokio::test]
    async fn test_refresh_maps_catalog_services() {
        let catalog = MockCatalog {
            last_index: 7,
            services: HashMap::from([("web".to_string(), vec![record("10.0.0.1", 8080)])]),
            ..Default::default()
        };
        let watcher = watcher_with(catalog);

        watcher.refresh().await;

        let snapshot = watcher.store().snapshot();
        assert_eq!(
            snapshot["web"],
            vec![pkg_infer::endpoint("10.0.0.1", 8080)]
        );
        assert_eq!(watcher.last_index.load(Ordering::Acquire), 7);
    }

    #[tokio::test]
    async fn test_refresh_skips_cycle_when_index_unchanged() {
        let catalog = MockCatalog {
            last_index: 0,
            services: HashMap::from([("web".to_string(), vec![record("10.0.0.1", 8080)])]),
            ..Default::default()
        };
        let watcher = watcher_with(catalog);
        watcher.store().replace(HashMap::from([(
            "old".to_string(),
            vec![Endpoint::with_default_ports("10.9.9.9")],
        )]));

        // The mock returns index 0, matching the watcher's initial index.
        watcher.refresh().await;

        assert!(watcher.store().snapshot().contains_key("old"));
        assert!(!watcher.store().snapshot().contains_key("web"));
    }

    #[tokio::test]
    async fn test_refresh_skips_only_the_failing_service() {
        let catalog = MockCatalog {
            last_index: 3,
            services: HashMap::from([("web".to_string(), vec![record("10.0.0.1", 8080)])]),
            failing_services: vec!["broken".to_string()],
            ..Default::default()
        };
        let watcher = watcher_with(catalog);

        watcher.refresh().await;

        let snapshot = watcher.store().snapshot();
        assert!(snapshot.contains_key("web"));
        assert!(!snapshot.contains_key("broken"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_store_when_listing_fails() {
        let catalog = MockCatalog {
            fail_listing: true,
            ..Default::default()
        };
        let watcher = watcher_with(catalog);
        watcher.store().replace(HashMap::from([(
            "web".to_string(),
            vec![Endpoint::with_default_ports("10.0.0.1")],
        )]));

        watcher.refresh().await;

        assert!(watcher.store().snapshot().contains_key("web"));
    }

    #[test]
    fn test_catalog_service_endpoint() {
        assert!(catalog_service_endpoint(&record("", 80)).is_none());

        let ep = catalog_service_endpoint(&record("10.0.0.1", 8500)).unwrap();
        assert_eq!(ep.ports, BTreeMap::from([("tcp".to_string(), 8500)]));

        let ep = catalog_service_endpoint(&record("10.0.0.1", 0)).unwrap();
        assert_eq!(
            ep.ports,
            BTreeMap::from([("http".to_string(), 80), ("https".to_string(), 443)])
        );
    }

    #[test]
    fn test_http_catalog_rejects_bad_endpoint() {
        assert!(HttpConsulCatalog::new("not a url").is_err());
        assert!(HttpConsulCatalog::new("http://consul:8500").is_ok());
    }
}
