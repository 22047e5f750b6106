//! Symphony Operator - blue/green migrations of Helm releases

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use symphony::controller::{
    handle_migration, handle_workload, Context, Controller, ControllerConfig,
};
use symphony::crd::Migration;
use symphony::events::KubeEventPublisher;
use symphony::keys::APP_LABEL;
use symphony::observer::{observe, ObjectCache, Synced};
use symphony::queue::WorkQueue;
use symphony::release::{HelmCli, HelmConfig};
use symphony::store::{KubeMigrationStore, MigrationStore};
use symphony::workload::CachedWorkloadProvider;
use symphony::CONTROLLER_NAME;

/// Symphony - drives blue/green Helm releases described by Migration resources
#[derive(Parser, Debug)]
#[command(name = "symphony-operator", version, about, long_about = None)]
struct Cli {
    /// Print the Migration CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "SYMPHONY_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "SYMPHONY_NAMESPACE")]
    namespace: Option<String>,

    /// Path to the helm binary
    #[arg(long, env = "SYMPHONY_HELM_BINARY", default_value = "helm")]
    helm_binary: PathBuf,

    /// Timeout for a single helm command in seconds
    #[arg(long, env = "SYMPHONY_HELM_TIMEOUT_SECS", default_value_t = 300)]
    helm_timeout_secs: u64,

    /// Kubeconfig context passed to helm
    #[arg(long, env = "SYMPHONY_KUBE_CONTEXT")]
    kube_context: Option<String>,

    /// How long to wait for the initial watch lists before giving up
    #[arg(long, env = "SYMPHONY_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    cache_sync_timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "SYMPHONY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Migration::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.log_json);
    run_controller(cli).await
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Watch Migrations and Deployments and run the workers until ctrl-c
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Starting Symphony controller...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let (migrations, deployments): (Api<Migration>, Api<Deployment>) = match &cli.namespace {
        Some(ns) => {
            tracing::info!(namespace = %ns, "Watching a single namespace");
            (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            )
        }
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let migration_cache = Arc::new(ObjectCache::<Migration>::new());
    let deployment_cache = Arc::new(ObjectCache::<Deployment>::new());

    let store: Arc<dyn MigrationStore> = Arc::new(KubeMigrationStore::new(
        client.clone(),
        Arc::clone(&migration_cache),
        CONTROLLER_NAME,
    ));
    let releases = Arc::new(HelmCli::new(HelmConfig {
        binary: cli.helm_binary,
        timeout: Duration::from_secs(cli.helm_timeout_secs),
        kube_context: cli.kube_context,
    }));
    let workloads = Arc::new(CachedWorkloadProvider::new(Arc::clone(&deployment_cache)));
    let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));

    let ctx = Arc::new(Context::new(Arc::clone(&store), releases, workloads, events));
    let queue = Arc::new(WorkQueue::<String>::with_default_rate_limiter());
    let shutdown = CancellationToken::new();

    let migration_watch = tokio::spawn({
        let queue = Arc::clone(&queue);
        observe(
            migrations,
            WatcherConfig::default(),
            Arc::clone(&migration_cache),
            move |n| handle_migration(&queue, n),
            shutdown.clone(),
        )
    });

    // only Deployments carrying an app label can belong to a Migration
    let deployment_watch = tokio::spawn({
        let queue = Arc::clone(&queue);
        let store = Arc::clone(&store);
        observe(
            deployments,
            WatcherConfig::default().labels(APP_LABEL),
            Arc::clone(&deployment_cache),
            move |n| handle_workload(store.as_ref(), &queue, n),
            shutdown.clone(),
        )
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received shutdown signal"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        }
    });

    let controller = Controller::new(
        ctx,
        queue,
        ControllerConfig {
            workers: cli.workers,
            cache_sync_timeout: Duration::from_secs(cli.cache_sync_timeout_secs),
        },
    );
    let caches: [&dyn Synced; 2] = [&*migration_cache, &*deployment_cache];
    let result = controller.run(&caches, shutdown.clone()).await;

    shutdown.cancel();
    let _ = tokio::join!(migration_watch, deployment_watch);

    result.map_err(|e| anyhow::anyhow!("Controller failed: {}", e))?;
    tracing::info!("Symphony controller stopped");
    Ok(())
}
