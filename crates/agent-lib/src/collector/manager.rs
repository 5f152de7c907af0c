//! Collector manager and per-endpoint schedulers
//!
//! The manager owns a table of running schedulers keyed by endpoint id and
//! guarantees at most one scheduler per id. Each scheduler is a tokio task
//! that scrapes on its own interval, expands collected metrics into series,
//! pushes batches onto the outbound channels, and lazily declares metric
//! definitions. Scheduler failures never cross endpoints.

use super::expansion::{self, ExpansionConfig};
use super::{create_collector, ClientIdentity, MetricsCollector};
use crate::endpoint::{scheduler_id, Endpoint, MonitoredMetric, STATIC_ENDPOINT_SENTINEL};
use crate::models::{EmittedSeries, MetricDefinition};
use crate::observability::AgentMetrics;
use crate::status::StatusRegistry;
use crate::tags::Tags;
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Collector-wide settings applied to every scheduler.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Floor for every effective collection interval.
    pub minimum_collection_interval: Duration,
    /// Used when an endpoint declares no interval (or an unparseable one).
    pub default_collection_interval: Duration,
    /// Upper bound on one scrape round-trip; additionally capped at the
    /// endpoint's interval so a hung scrape can never block the next cycle.
    pub scrape_timeout: Duration,
    /// Prefix prepended to every expanded metric id. May reference OS
    /// environment variables.
    pub metric_id_prefix: String,
    /// Global tags merged into every definition, overriding the endpoint
    /// and metric layers.
    pub tags: Tags,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            minimum_collection_interval: Duration::from_secs(10),
            default_collection_interval: Duration::from_secs(5 * 60),
            scrape_timeout: Duration::from_secs(10),
            metric_id_prefix: String::new(),
            tags: Tags::new(),
        }
    }
}

/// A running scheduler: its cancel signal plus the task handle.
struct SchedulerHandle {
    cancel: watch::Sender<bool>,
    _task: tokio::task::JoinHandle<()>,
}

/// Owns all active schedulers and the outbound sink channels.
pub struct CollectorManager {
    settings: CollectorSettings,
    schedulers: Mutex<HashMap<String, SchedulerHandle>>,
    metrics_tx: mpsc::Sender<Vec<EmittedSeries>>,
    defs_tx: mpsc::Sender<Vec<MetricDefinition>>,
    status: StatusRegistry,
    agent_metrics: AgentMetrics,
}

impl CollectorManager {
    pub fn new(
        settings: CollectorSettings,
        metrics_tx: mpsc::Sender<Vec<EmittedSeries>>,
        defs_tx: mpsc::Sender<Vec<MetricDefinition>>,
        status: StatusRegistry,
        agent_metrics: AgentMetrics,
    ) -> Self {
        Self {
            settings,
            schedulers: Mutex::new(HashMap::new()),
            metrics_tx,
            defs_tx,
            status,
            agent_metrics,
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Start collecting from the static endpoints listed in the agent's own
    /// configuration. An endpoint that fails to build is skipped with a
    /// status entry; the rest still start.
    pub async fn start_collecting_endpoints(
        &self,
        endpoints: &[Endpoint],
        identity: Option<&ClientIdentity>,
    ) {
        for endpoint in endpoints {
            let id = scheduler_id(
                STATIC_ENDPOINT_SENTINEL,
                STATIC_ENDPOINT_SENTINEL,
                endpoint.endpoint_type,
                &endpoint.url,
            );
            match create_collector(
                id.clone(),
                endpoint.clone(),
                None,
                HashMap::new(),
                identity,
                self.settings.scrape_timeout,
            ) {
                Ok(collector) => self.start_collecting(collector).await,
                Err(e) => {
                    let msg = format!("Will not start collecting for endpoint [{id}]. err={e}");
                    warn!(endpoint_id = %id, error = %e, "Skipping unusable static endpoint");
                    self.status.set_endpoint(&id, msg).await;
                }
            }
        }
    }

    /// Start a scheduler for the collector's endpoint. If a scheduler with
    /// the same id is already running it is stopped first and replaced.
    pub async fn start_collecting(&self, collector: Arc<dyn MetricsCollector>) {
        let id = collector.id().to_string();

        if !collector.endpoint().enabled {
            let msg = format!("Will not collect metrics from [{id}] - it has been disabled.");
            info!(endpoint_id = %id, "Endpoint is disabled");
            self.status.set_endpoint(&id, msg).await;
            return;
        }

        self.stop_collecting(&id).await;

        let interval = self.effective_interval(collector.endpoint(), &id);

        info!(
            endpoint_id = %id,
            interval = ?interval,
            "START collecting metrics"
        );
        self.status
            .add_log_message(format!("START collection: {id} (interval={interval:?})"))
            .await;
        self.status.set_endpoint(&id, "STARTING").await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let scheduler = EndpointScheduler {
            collector,
            id: id.clone(),
            interval,
            settings: self.settings.clone(),
            metrics_tx: self.metrics_tx.clone(),
            defs_tx: self.defs_tx.clone(),
            status: self.status.clone(),
            agent_metrics: self.agent_metrics.clone(),
        };
        let task = tokio::spawn(scheduler.run(cancel_rx));

        let mut table = self.schedulers.lock().await;
        table.insert(
            id,
            SchedulerHandle {
                cancel: cancel_tx,
                _task: task,
            },
        );
        self.agent_metrics.set_endpoints_active(table.len() as i64);
    }

    /// Stop the scheduler for `id` if one is running. The status entry is
    /// cleared either way.
    pub async fn stop_collecting(&self, id: &str) {
        let removed = {
            let mut table = self.schedulers.lock().await;
            let removed = table.remove(id);
            self.agent_metrics.set_endpoints_active(table.len() as i64);
            removed
        };

        if let Some(handle) = removed {
            info!(endpoint_id = %id, "STOP collecting metrics");
            self.status
                .add_log_message(format!("STOP collection: {id}"))
                .await;
            let _ = handle.cancel.send(true);
        }

        self.status.remove_endpoint(id).await;
    }

    /// Halt every scheduler and clear all endpoint status.
    pub async fn stop_collecting_all(&self) {
        let handles: Vec<(String, SchedulerHandle)> = {
            let mut table = self.schedulers.lock().await;
            self.agent_metrics.set_endpoints_active(0);
            table.drain().collect()
        };

        info!("STOP collecting all metrics from all endpoints");
        self.status
            .add_log_message("STOP collecting all metrics from all endpoints")
            .await;
        for (_, handle) in handles {
            let _ = handle.cancel.send(true);
        }

        self.status.clear_endpoints().await;
    }

    /// Whether a scheduler is currently registered for `id`.
    pub async fn is_collecting(&self, id: &str) -> bool {
        self.schedulers.lock().await.contains_key(id)
    }

    pub async fn active_count(&self) -> usize {
        self.schedulers.lock().await.len()
    }

    /// Resolve the interval a scheduler will tick at: the endpoint's if
    /// present and parseable, else the default; never below the minimum.
    pub fn effective_interval(&self, endpoint: &Endpoint, id: &str) -> Duration {
        let mut interval = if endpoint.collection_interval.is_empty() {
            debug!(
                endpoint_id = %id,
                default = ?self.settings.default_collection_interval,
                "Collection interval not defined, using the default"
            );
            self.settings.default_collection_interval
        } else {
            match humantime::parse_duration(&endpoint.collection_interval) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(
                        endpoint_id = %id,
                        interval = %endpoint.collection_interval,
                        error = %e,
                        "Collection interval is invalid, using the default"
                    );
                    self.settings.default_collection_interval
                }
            }
        };

        if interval < self.settings.minimum_collection_interval {
            warn!(
                endpoint_id = %id,
                interval = ?interval,
                minimum = ?self.settings.minimum_collection_interval,
                "Collection interval is below the minimum allowed, clamping"
            );
            interval = self.settings.minimum_collection_interval;
        }

        interval
    }
}

/// One endpoint's periodic collection loop.
struct EndpointScheduler {
    collector: Arc<dyn MetricsCollector>,
    id: String,
    interval: Duration,
    settings: CollectorSettings,
    metrics_tx: mpsc::Sender<Vec<EmittedSeries>>,
    defs_tx: mpsc::Sender<Vec<MetricDefinition>>,
    status: StatusRegistry,
    agent_metrics: AgentMetrics,
}

impl EndpointScheduler {
    async fn run(self, mut cancel_rx: watch::Receiver<bool>) {
        let by_name: HashMap<String, MonitoredMetric> = self
            .collector
            .endpoint()
            .metrics
            .iter()
            .map(|m| (m.name.clone(), m.clone()))
            .collect();
        let expansion_config = ExpansionConfig {
            metric_id_prefix: self.settings.metric_id_prefix.clone(),
            additional_env: self.collector.additional_environment().clone(),
        };
        // ids already declared at the store, kept for this scheduler's
        // lifetime so each definition is pushed at most once
        let mut declared: HashMap<String, MonitoredMetric> = HashMap::new();

        // first tick fires one interval from now; missed ticks collapse so
        // cycles stay strictly serial
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        debug!(endpoint_id = %self.id, "Scheduler cancelled");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .run_cycle(&by_name, &expansion_config, &mut declared)
                        .await
                    {
                        // only a closed sink channel ends the loop; scrape
                        // failures are absorbed per cycle
                        warn!(endpoint_id = %self.id, error = %e, "Scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn run_cycle(
        &self,
        by_name: &HashMap<String, MonitoredMetric>,
        expansion_config: &ExpansionConfig,
        declared: &mut HashMap<String, MonitoredMetric>,
    ) -> Result<()> {
        let started = std::time::Instant::now();
        let deadline = self.settings.scrape_timeout.min(self.interval);

        let scraped = match tokio::time::timeout(deadline, self.collector.collect_metrics()).await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!("scrape exceeded its deadline of {deadline:?}")),
        };

        let collected = match scraped {
            Ok(collected) => collected,
            Err(e) => {
                warn!(endpoint_id = %self.id, error = %e, "Failed to collect metrics");
                self.status
                    .set_endpoint(
                        &self.id,
                        format!(
                            "Failed to collect metrics at [{}]. err={e}",
                            chrono::Utc::now().to_rfc2822()
                        ),
                    )
                    .await;
                self.agent_metrics.inc_scrape_errors();
                return Ok(());
            }
        };

        let elapsed = started.elapsed();
        self.agent_metrics.observe_scrape_duration(elapsed.as_secs_f64());

        let mut needed: HashMap<String, MonitoredMetric> = HashMap::new();
        let mut batch: Vec<EmittedSeries> = Vec::new();
        let mut datapoints = 0usize;

        for metric in &collected {
            let Some(monitored) = expansion::resolve_monitored(metric, by_name) else {
                warn!(
                    endpoint_id = %self.id,
                    metric = %metric.name,
                    "Metric was collected but wasn't expected from endpoint"
                );
                continue;
            };

            let series = expansion::expand_metric(metric, &monitored, expansion_config);
            for s in &series {
                datapoints += s.data.len();
                if !declared.contains_key(&s.id) {
                    needed.insert(s.id.clone(), monitored.clone());
                }
            }
            batch.extend(series);
        }

        if !batch.is_empty() {
            // blocking push: a slow sink backpressures the scheduler
            self.metrics_tx
                .send(batch)
                .await
                .map_err(|_| anyhow!("datapoints channel closed"))?;
        }

        if !needed.is_empty() {
            debug!(
                endpoint_id = %self.id,
                count = needed.len(),
                "Declaring metric definitions"
            );
            if self.create_metric_definitions(&needed).await? {
                for (id, monitored) in needed {
                    declared.insert(id, monitored);
                }
            }
            // on a details-fetch failure the definitions were still pushed
            // but stay undeclared, so a later cycle retries with full
            // details
        }

        self.agent_metrics.add_datapoints_collected(datapoints as u64);
        self.status
            .set_endpoint(
                &self.id,
                format!(
                    "OK. Last collection at [{}] gathered [{}] datapoints in [{:?}]",
                    chrono::Utc::now().to_rfc2822(),
                    datapoints,
                    elapsed
                ),
            )
            .await;

        Ok(())
    }

    /// Compose and push the definitions for the given expanded ids.
    ///
    /// Returns `Ok(true)` when the ids may be marked declared, `Ok(false)`
    /// when details could not be fetched (definitions were pushed anyway
    /// from configured fields alone), and `Err` only when the definitions
    /// channel is gone.
    async fn create_metric_definitions(
        &self,
        needed: &HashMap<String, MonitoredMetric>,
    ) -> Result<bool> {
        let names: Vec<String> = needed
            .values()
            .map(|m| m.name.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let (details, details_ok) = match self.collector.collect_metric_details(&names).await {
            Ok(details) => (details, true),
            Err(e) => {
                let msg = format!(
                    "Failed to obtain metric details - metric definitions may be incomplete. err={e}"
                );
                warn!(endpoint_id = %self.id, error = %e, "Failed to obtain metric details");
                self.status.set_endpoint(&self.id, msg).await;
                (Vec::new(), false)
            }
        };

        let endpoint = self.collector.endpoint();
        let additional_env = self.collector.additional_environment();
        let defs: Vec<MetricDefinition> = needed
            .iter()
            .map(|(id, monitored)| {
                let detail = details.iter().find(|d| d.name == monitored.name);
                expansion::compose_definition(
                    monitored,
                    id,
                    detail,
                    endpoint,
                    &self.settings.tags,
                    additional_env,
                )
            })
            .collect();

        let count = defs.len();
        self.defs_tx
            .send(defs)
            .await
            .map_err(|_| anyhow!("definitions channel closed"))?;
        self.agent_metrics.add_definitions_declared(count as u64);

        Ok(details_ok)
    }
}
