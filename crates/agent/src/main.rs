//! Metrics agent
//!
//! This binary runs on each Kubernetes node, polling Prometheus and Jolokia
//! endpoints (static ones from its config file, dynamic ones discovered
//! from pods on the node) and forwarding normalized time series to a remote
//! store.

use agent_lib::{
    collector::{ClientIdentity, CollectorManager},
    discovery::{EndpointSourceMerger, KubeClient, KubeSettings},
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    sink::SinkWorker,
    status::StatusRegistry,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting metrics-agent");

    // Load configuration
    let config_path = std::env::var("AGENT_CONFIG_FILE").ok();
    let config = config::AgentConfig::load(config_path.as_deref())?;
    let settings = config.collector.settings()?;
    let node_name = config.kubernetes.node_name.clone();
    info!(node_name = %node_name, store = %config.store.url, "Agent configured");

    // Process-wide state
    let status = StatusRegistry::new();
    let health_registry = HealthRegistry::new();
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::SINK).await;
    health_registry.register(components::EMITTER).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&node_name);
    logger.log_startup(AGENT_VERSION);

    // Client identity presented to https endpoints
    let identity = if config.identity.is_configured() {
        let mut identity = ClientIdentity::from_files(
            &config.identity.cert_file,
            &config.identity.private_key_file,
        )
        .await?;
        if !config.identity.ca_cert_file.is_empty() {
            identity = identity.with_ca_file(&config.identity.ca_cert_file).await?;
        }
        Some(identity)
    } else {
        None
    };

    // Sink channels: bounded so a slow store backpressures the schedulers
    let (metrics_tx, metrics_rx) = mpsc::channel(config.collector.buffer_size);
    let (defs_tx, defs_rx) = mpsc::channel(config.collector.buffer_size);

    let sink = SinkWorker::new(config.store.store_config()?, metrics_rx, defs_rx).await?;
    let _sink_handle = tokio::spawn(sink.run());

    let manager = Arc::new(CollectorManager::new(
        settings,
        metrics_tx,
        defs_tx,
        status.clone(),
        metrics.clone(),
    ));

    // Static endpoints from the config file
    manager
        .start_collecting_endpoints(&config.endpoints, identity.as_ref())
        .await;

    // Dynamic endpoints from pods on this node
    if config.kubernetes.enabled && !node_name.is_empty() {
        health_registry.register(components::DISCOVERY).await;
        let kube = Arc::new(
            KubeClient::new(&KubeSettings {
                master_url: config.kubernetes.master_url.clone(),
                namespace: config.kubernetes.namespace.clone(),
                pod_name: config.kubernetes.pod_name.clone(),
                token: config.kubernetes.token.clone(),
                ca_cert_file: config.kubernetes.ca_cert_file.clone(),
            })
            .await?,
        );
        info!(
            namespace = %kube.namespace(),
            pod = %kube.pod_name(),
            node = %node_name,
            "Cluster client ready"
        );

        let (events_tx, events_rx) = mpsc::channel(64);
        let watcher = Arc::clone(&kube);
        let watch_node = node_name.clone();
        tokio::spawn(async move {
            watcher.watch_pods(&watch_node, events_tx).await;
        });

        let merger = EndpointSourceMerger::new(
            Arc::clone(&manager),
            kube,
            identity.clone(),
            config.kubernetes.config_volume_name.clone(),
        );
        tokio::spawn(merger.run(events_rx));
    } else {
        info!("Pod discovery disabled, collecting static endpoints only");
    }

    // Telemetry emitter
    let status_credentials = if config.emitter.status_credentials.username.is_empty() {
        None
    } else {
        Some((
            config.emitter.status_credentials.username.clone(),
            config.emitter.status_credentials.password.clone(),
        ))
    };
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        status.clone(),
        status_credentials,
    ));
    let _api_handle = tokio::spawn(api::serve(config.emitter.clone(), app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    manager.stop_collecting_all().await;
    info!("Shutting down");

    Ok(())
}
