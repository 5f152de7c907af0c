//! Forwarding collected series and definitions to the time-series store
//!
//! The sink worker drains the two outbound channels, accumulates batches,
//! and POSTs them as JSON to the store. Channels are bounded, so a slow or
//! unreachable store backpressures the schedulers instead of dropping data;
//! a send that still fails after the retry budget is counted and dropped.

use crate::endpoint::Credentials;
use crate::models::{EmittedSeries, MetricDefinition};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

/// Configuration for the store connection and batching policy.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base URL of the time-series store.
    pub url: String,
    /// Tenant applied to records that do not carry their own.
    pub default_tenant: String,
    pub credentials: Credentials,
    /// Extra root CA for the store, PEM file path.
    pub ca_cert_file: String,
    /// Maximum records per POST before flushing early.
    pub max_batch_size: usize,
    /// Maximum time to sit on a partial batch.
    pub max_batch_delay: Duration,
    /// Delay between retries of a failed POST.
    pub retry_delay: Duration,
    /// Attempts per batch before giving up.
    pub max_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            default_tenant: "default".to_string(),
            credentials: Credentials::default(),
            ca_cert_file: String::new(),
            max_batch_size: 500,
            max_batch_delay: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

/// Statistics for sink operations.
#[derive(Debug, Default, Clone)]
pub struct SinkStats {
    pub batches_sent: u64,
    pub datapoints_sent: u64,
    pub definitions_sent: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Background worker that owns the receiving ends of the sink channels.
pub struct SinkWorker {
    config: StoreConfig,
    base: Url,
    client: reqwest::Client,
    series_rx: mpsc::Receiver<Vec<EmittedSeries>>,
    defs_rx: mpsc::Receiver<Vec<MetricDefinition>>,
    pending_series: Vec<EmittedSeries>,
    pending_defs: Vec<MetricDefinition>,
    stats: Arc<RwLock<SinkStats>>,
}

impl SinkWorker {
    pub async fn new(
        config: StoreConfig,
        series_rx: mpsc::Receiver<Vec<EmittedSeries>>,
        defs_rx: mpsc::Receiver<Vec<MetricDefinition>>,
    ) -> Result<Self> {
        if config.url.is_empty() {
            bail!("store url is not configured");
        }
        let base = Url::parse(&config.url)
            .with_context(|| format!("invalid store url [{}]", config.url))?;

        let mut builder = reqwest::Client::builder();
        if !config.ca_cert_file.is_empty() {
            let pem = tokio::fs::read(&config.ca_cert_file)
                .await
                .with_context(|| {
                    format!("Failed to read store CA from {}", config.ca_cert_file)
                })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .context("Failed to parse store CA certificate")?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().context("Failed to build store client")?;

        Ok(Self {
            config,
            base,
            client,
            series_rx,
            defs_rx,
            pending_series: Vec::new(),
            pending_defs: Vec::new(),
            stats: Arc::new(RwLock::new(SinkStats::default())),
        })
    }

    pub fn stats_handle(&self) -> Arc<RwLock<SinkStats>> {
        Arc::clone(&self.stats)
    }

    /// Run until both channels are closed and all pending data is flushed.
    pub async fn run(mut self) {
        info!(store = %self.config.url, "Starting sink worker");

        let mut series_open = true;
        let mut defs_open = true;

        loop {
            tokio::select! {
                batch = self.series_rx.recv(), if series_open => {
                    match batch {
                        Some(batch) => {
                            self.pending_series.extend(batch);
                            if self.pending_series.len() >= self.config.max_batch_size {
                                self.flush_series().await;
                            }
                        }
                        None => series_open = false,
                    }
                }
                batch = self.defs_rx.recv(), if defs_open => {
                    match batch {
                        Some(batch) => {
                            self.pending_defs.extend(batch);
                            if self.pending_defs.len() >= self.config.max_batch_size {
                                self.flush_definitions().await;
                            }
                        }
                        None => defs_open = false,
                    }
                }
                _ = tokio::time::sleep(self.config.max_batch_delay) => {
                    if !self.pending_defs.is_empty() {
                        self.flush_definitions().await;
                    }
                    if !self.pending_series.is_empty() {
                        self.flush_series().await;
                    }
                }
            }

            if !series_open && !defs_open {
                break;
            }
        }

        // drain whatever arrived before shutdown
        if !self.pending_defs.is_empty() {
            self.flush_definitions().await;
        }
        if !self.pending_series.is_empty() {
            self.flush_series().await;
        }
        info!("Sink worker stopped");
    }

    async fn flush_definitions(&mut self) {
        let mut batch = std::mem::take(&mut self.pending_defs);
        for def in &mut batch {
            if def.tenant.is_none() {
                def.tenant = Some(self.config.default_tenant.clone());
            }
        }
        let count = batch.len();
        if self.post("metricdefs", &batch).await {
            let mut stats = self.stats.write().await;
            stats.batches_sent += 1;
            stats.definitions_sent += count as u64;
        }
    }

    async fn flush_series(&mut self) {
        let mut batch = std::mem::take(&mut self.pending_series);
        for series in &mut batch {
            if series.tenant.is_none() {
                series.tenant = Some(self.config.default_tenant.clone());
            }
        }
        let datapoints: usize = batch.iter().map(|s| s.data.len()).sum();
        if self.post("datapoints", &batch).await {
            let mut stats = self.stats.write().await;
            stats.batches_sent += 1;
            stats.datapoints_sent += datapoints as u64;
        }
    }

    /// POST one batch with bounded retries. Returns whether it was
    /// accepted.
    async fn post<T: Serialize>(&self, path: &str, batch: &[T]) -> bool {
        let url = match self.base.join(path) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, path = %path, "Bad store path");
                return false;
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(url.clone(), batch).await {
                Ok(()) => {
                    debug!(path = %path, records = batch.len(), "Batch sent to store");
                    return true;
                }
                Err(e) if attempt < self.config.max_retries => {
                    warn!(
                        error = %e,
                        attempt = attempt,
                        "Failed to send batch to store, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        attempts = attempt,
                        "Failed to send batch to store, giving up"
                    );
                    let mut stats = self.stats.write().await;
                    stats.failures += 1;
                    stats.last_error = Some(e.to_string());
                    return false;
                }
            }
        }
    }

    async fn post_once<T: Serialize>(&self, url: Url, batch: &[T]) -> Result<()> {
        let mut request = self.client.post(url).json(batch);
        if !self.config.credentials.token.is_empty() {
            request = request.bearer_auth(&self.config.credentials.token);
        } else if !self.config.credentials.username.is_empty() {
            request = request.basic_auth(
                &self.config.credentials.username,
                Some(&self.config.credentials.password),
            );
        }

        let response = request.send().await.context("store request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("store returned {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Datapoint, MetricType};

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.max_batch_size, 500);
        assert_eq!(config.max_batch_delay, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
    }

    #[tokio::test]
    async fn test_worker_requires_store_url() {
        let (_series_tx, series_rx) = mpsc::channel(1);
        let (_defs_tx, defs_rx) = mpsc::channel(1);
        let result = SinkWorker::new(StoreConfig::default(), series_rx, defs_rx).await;
        assert!(result.is_err());
    }

    /// Start a local store stub that records every POST body it receives.
    async fn start_store_stub() -> (String, Arc<RwLock<Vec<(String, serde_json::Value)>>>) {
        use axum::{extract::State, routing::post, Json, Router};

        let received: Arc<RwLock<Vec<(String, serde_json::Value)>>> =
            Arc::new(RwLock::new(Vec::new()));

        async fn record(
            State((path, received)): State<(
                String,
                Arc<RwLock<Vec<(String, serde_json::Value)>>>,
            )>,
            Json(body): Json<serde_json::Value>,
        ) {
            received.write().await.push((path, body));
        }

        let app = Router::new()
            .route(
                "/metricdefs",
                post(record).with_state(("metricdefs".to_string(), Arc::clone(&received))),
            )
            .route(
                "/datapoints",
                post(record).with_state(("datapoints".to_string(), Arc::clone(&received))),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/"), received)
    }

    #[tokio::test]
    async fn test_worker_forwards_batches_and_stamps_tenant() {
        let (store_url, received) = start_store_stub().await;

        let (series_tx, series_rx) = mpsc::channel(8);
        let (defs_tx, defs_rx) = mpsc::channel(8);
        let config = StoreConfig {
            url: store_url,
            default_tenant: "fallback".to_string(),
            max_batch_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let worker = SinkWorker::new(config, series_rx, defs_rx).await.unwrap();
        let stats = worker.stats_handle();
        let task = tokio::spawn(worker.run());

        series_tx
            .send(vec![
                EmittedSeries {
                    tenant: None,
                    metric_type: MetricType::Gauge,
                    id: "a".into(),
                    data: vec![Datapoint::new(1, 1.0), Datapoint::new(2, 2.0)],
                },
                EmittedSeries {
                    tenant: Some("explicit".into()),
                    metric_type: MetricType::Counter,
                    id: "b".into(),
                    data: vec![Datapoint::new(1, 1.0)],
                },
            ])
            .await
            .unwrap();
        defs_tx
            .send(vec![MetricDefinition {
                tenant: None,
                metric_type: MetricType::Gauge,
                id: "a".into(),
                tags: Default::default(),
            }])
            .await
            .unwrap();

        // closing both channels drains pending batches and stops the worker
        drop(series_tx);
        drop(defs_tx);
        task.await.unwrap();

        let received = received.read().await;
        assert_eq!(received.len(), 2);

        let (_, defs_body) = received.iter().find(|(p, _)| p == "metricdefs").unwrap();
        assert_eq!(defs_body[0]["tenant"], "fallback");

        let (_, series_body) = received.iter().find(|(p, _)| p == "datapoints").unwrap();
        assert_eq!(series_body[0]["tenant"], "fallback");
        assert_eq!(series_body[1]["tenant"], "explicit");
        assert_eq!(series_body[0]["data"].as_array().unwrap().len(), 2);

        let stats = stats.read().await.clone();
        assert_eq!(stats.datapoints_sent, 3);
        assert_eq!(stats.definitions_sent, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_worker_counts_failures_when_store_gone() {
        let (series_tx, series_rx) = mpsc::channel(8);
        let (_defs_tx, defs_rx) = mpsc::channel(8);
        let config = StoreConfig {
            // nothing listens here
            url: "http://127.0.0.1:1/".to_string(),
            retry_delay: Duration::from_millis(10),
            max_retries: 2,
            ..Default::default()
        };
        let worker = SinkWorker::new(config, series_rx, defs_rx).await.unwrap();
        let stats = worker.stats_handle();
        let task = tokio::spawn(worker.run());

        series_tx
            .send(vec![EmittedSeries {
                tenant: None,
                metric_type: MetricType::Gauge,
                id: "a".into(),
                data: vec![Datapoint::new(1, 1.0)],
            }])
            .await
            .unwrap();
        drop(series_tx);
        drop(_defs_tx);
        task.await.unwrap();

        let stats = stats.read().await.clone();
        assert_eq!(stats.failures, 1);
        assert!(stats.last_error.is_some());
        assert_eq!(stats.datapoints_sent, 0);
    }
}
