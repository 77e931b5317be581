use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::info;
use uuid::Uuid;

use pkg_controllers::synchronizer::Synchronizer;
use pkg_mesh::client::{kube_client, KubeEntryClient};
use pkg_mesh::feed::KubeEntryFeed;
use pkg_mesh::namespace::publish_namespace;
use pkg_providers::cloudmap::{AwsCloudMapApi, CloudMapWatcher};
use pkg_providers::consul::{ConsulWatcher, HttpConsulCatalog};
use pkg_providers::store::EndpointStore;
use pkg_providers::watcher::Watcher;
use pkg_state::entries::{EntryStore, InMemoryEntryStore, LoggingEntryStore};
use pkg_state::handler::EntryEventHandler;
use pkg_types::config::{load_config_file, BridgeConfigFile};
use pkg_types::owner::OwnerReference;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(
    name = "meshbridge",
    about = "Reflects Cloud Map and Consul services into mesh ServiceEntries"
)]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = "/etc/meshbridge/config.yaml")]
    config: String,

    /// ID of this instance; an instance only manages entries marked with its own ID
    #[arg(long)]
    id: Option<String>,

    /// Log every entry-store call and lower the default log level to debug
    #[arg(long)]
    debug: bool,

    /// kubeconfig location; if empty, in-cluster configuration is assumed
    #[arg(long)]
    kube_config: Option<String>,

    /// Namespace to publish service entries into; falls back to PUBLISH_NAMESPACE,
    /// then the pod's service-account namespace, then "default"
    #[arg(long)]
    namespace: Option<String>,

    /// AWS region for Cloud Map; or the AWS_REGION environment variable
    #[arg(long)]
    aws_region: Option<String>,

    /// AWS access key ID; set together with --aws-secret-access-key, or use the
    /// environment pair AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY. Flags and
    /// environment variables must not be mixed.
    #[arg(long)]
    aws_access_key_id: Option<String>,

    /// AWS secret access key; see --aws-access-key-id
    #[arg(long)]
    aws_secret_access_key: Option<String>,

    /// Consul HTTP endpoint URL, e.g. http://consul:8500
    #[arg(long)]
    consul_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Merge: CLI args > config file > environment / defaults
    let file_cfg: BridgeConfigFile = load_config_file(&cli.config)?;
    let debug = cli.debug || file_cfg.debug.unwrap_or(false);
    init_tracing(debug);
    info!("Config file: {}", cli.config);

    let id = cli
        .id
        .or(file_cfg.id)
        .unwrap_or_else(|| "meshbridge".to_string());
    let aws_region = cli.aws_region.or(file_cfg.aws_region);
    let aws_access_key_id = cli.aws_access_key_id.or(file_cfg.aws_access_key_id);
    let aws_secret_access_key = cli.aws_secret_access_key.or(file_cfg.aws_secret_access_key);
    let consul_endpoint = cli.consul_endpoint.or(file_cfg.consul_endpoint);
    let kube_config = cli.kube_config.or(file_cfg.kube_config);
    let namespace_flag = cli.namespace.or(file_cfg.namespace);

    if aws_access_key_id.is_some() != aws_secret_access_key.is_some() {
        anyhow::bail!(
            "aws-access-key-id and aws-secret-access-key must be provided together \
             (or both via the environment)"
        );
    }

    let mut watchers: Vec<Arc<dyn Watcher>> = Vec::new();
    if aws_region.is_some() || std::env::var("AWS_REGION").is_ok() {
        let api =
            AwsCloudMapApi::connect(aws_region, aws_access_key_id, aws_secret_access_key).await?;
        info!("starting Cloud Map watcher");
        watchers.push(Arc::new(CloudMapWatcher::new(
            Arc::new(api),
            Arc::new(EndpointStore::new()),
        )));
    }
    if let Some(endpoint) = consul_endpoint {
        let catalog = HttpConsulCatalog::new(&endpoint)?;
        info!("starting consul watcher for {:?}", endpoint);
        watchers.push(Arc::new(ConsulWatcher::new(
            Arc::new(catalog),
            Arc::new(EndpointStore::new()),
        )));
    }
    if watchers.is_empty() {
        anyhow::bail!("no provider configured: set --aws-region (or AWS_REGION) or --consul-endpoint");
    }

    let owner = OwnerReference::controller(&id, Uuid::new_v4().to_string());
    let entries: Arc<dyn EntryStore> = if debug {
        Arc::new(LoggingEntryStore::new(InMemoryEntryStore::new(owner.clone())))
    } else {
        Arc::new(InMemoryEntryStore::new(owner.clone()))
    };

    let client = kube_client(kube_config.as_deref()).await?;
    let namespace = publish_namespace(namespace_flag.as_deref());
    info!("publishing service entries into {:?}", namespace);
    let entry_client = Arc::new(KubeEntryClient::new(client.clone(), &namespace));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let mut tasks = Vec::new();
    for watcher in &watchers {
        let watcher = Arc::clone(watcher);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { watcher.run(shutdown).await }));
    }

    let feed = KubeEntryFeed::new(client, event_tx);
    tasks.push(tokio::spawn(feed.run(shutdown_rx.clone())));

    let handler = EntryEventHandler::new(Arc::clone(&entries));
    tasks.push(tokio::spawn(handler.run(event_rx, shutdown_rx.clone())));

    info!("Starting Synchronizer control loop");
    let synchronizer = Synchronizer::new(owner, entries, watchers, entry_client);
    tasks.push(tokio::spawn(synchronizer.run(shutdown_rx)));

    info!("meshbridge running (id={:?})", id);
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
