//! Endpoint source merger
//!
//! Translates pod lifecycle events into start/stop calls on the collector
//! manager. Each pod maps to the set of scheduler ids derived from its
//! configuration document; on modify the old and new sets are diffed, on
//! delete every scheduler belonging to the pod is stopped.

use super::{additional_environment, ConfigDocumentFetcher, Pod, PodEvent};
use crate::collector::{create_collector, ClientIdentity, CollectorManager};
use crate::endpoint::{parse_config_document, scheduler_id, Endpoint};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct EndpointSourceMerger {
    manager: Arc<CollectorManager>,
    fetcher: Arc<dyn ConfigDocumentFetcher>,
    identity: Option<ClientIdentity>,
    /// Name of the pod volume that opts a pod into scraping.
    config_volume_name: String,
    /// pod uid → scheduler ids currently running for that pod
    pods: HashMap<String, Vec<String>>,
}

impl EndpointSourceMerger {
    pub fn new(
        manager: Arc<CollectorManager>,
        fetcher: Arc<dyn ConfigDocumentFetcher>,
        identity: Option<ClientIdentity>,
        config_volume_name: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            fetcher,
            identity,
            config_volume_name: config_volume_name.into(),
            pods: HashMap::new(),
        }
    }

    /// Consume pod events until the watcher side closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<PodEvent>) {
        info!(volume = %self.config_volume_name, "Endpoint source merger started");
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Pod event stream closed, merger stopping");
    }

    pub async fn handle_event(&mut self, event: PodEvent) {
        match event {
            PodEvent::Added(pod) | PodEvent::Modified(pod) => self.reconcile_pod(pod).await,
            PodEvent::Deleted(pod) => self.forget_pod(&pod).await,
        }
    }

    /// Bring the pod's schedulers in line with its current document:
    /// start/replace everything the document names, stop what it no longer
    /// names.
    async fn reconcile_pod(&mut self, pod: Pod) {
        let endpoints = match self.load_endpoints(&pod).await {
            Ok(Some(endpoints)) => endpoints,
            // transient fetch failure: leave whatever is running untouched
            Ok(None) => return,
            Err(e) => {
                // a malformed document stops everything the pod had; the
                // next modify event retries
                warn!(
                    pod = %pod.name,
                    namespace = %pod.namespace,
                    error = %e,
                    "Bad endpoint configuration for pod, stopping its collection"
                );
                self.forget_pod(&pod).await;
                return;
            }
        };

        let env = additional_environment(&pod);
        let mut new_ids: Vec<String> = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let id = match self.start_endpoint(&pod, endpoint, &env) {
                Ok((id, collector)) => {
                    self.manager.start_collecting(collector).await;
                    id
                }
                Err(e) => {
                    warn!(
                        pod = %pod.name,
                        namespace = %pod.namespace,
                        error = %e,
                        "Skipping unusable endpoint for pod"
                    );
                    continue;
                }
            };
            new_ids.push(id);
        }

        let old_ids = self.pods.insert(pod.uid.clone(), new_ids.clone());
        for old_id in old_ids.unwrap_or_default() {
            if !new_ids.contains(&old_id) {
                self.manager.stop_collecting(&old_id).await;
            }
        }
    }

    /// Stop every scheduler belonging to the pod.
    async fn forget_pod(&mut self, pod: &Pod) {
        if let Some(ids) = self.pods.remove(&pod.uid) {
            info!(
                pod = %pod.name,
                namespace = %pod.namespace,
                endpoints = ids.len(),
                "Stopping collection for pod"
            );
            for id in ids {
                self.manager.stop_collecting(&id).await;
            }
        }
    }

    fn start_endpoint(
        &self,
        pod: &Pod,
        endpoint: Endpoint,
        env: &HashMap<String, String>,
    ) -> Result<(String, Arc<dyn crate::collector::MetricsCollector>)> {
        let url = endpoint
            .resolve_url(Some(&pod.ip))
            .context("cannot resolve endpoint address")?;
        let id = scheduler_id(
            &pod.namespace,
            &pod.name,
            endpoint.endpoint_type,
            url.as_str(),
        );
        let collector = create_collector(
            id.clone(),
            endpoint,
            Some(&pod.ip),
            env.clone(),
            self.identity.as_ref(),
            self.manager.settings().scrape_timeout,
        )?;
        Ok((id, collector))
    }

    /// Load and parse the pod's endpoint document. A pod without the
    /// sentinel volume, or whose document is missing, has zero endpoints.
    /// `Ok(None)` signals a transient fetch failure the caller should not
    /// act on.
    async fn load_endpoints(&self, pod: &Pod) -> Result<Option<Vec<Endpoint>>> {
        let Some(document_name) = pod.scrape_document(&self.config_volume_name) else {
            debug!(
                pod = %pod.name,
                namespace = %pod.namespace,
                "Pod has no scrape configuration volume"
            );
            return Ok(Some(Vec::new()));
        };

        let fetched = match self
            .fetcher
            .fetch_document(&pod.namespace, document_name)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(
                    pod = %pod.name,
                    namespace = %pod.namespace,
                    document = %document_name,
                    error = %e,
                    "Failed to fetch endpoint configuration document, keeping current state"
                );
                return Ok(None);
            }
        };

        let Some(yaml) = fetched else {
            info!(
                pod = %pod.name,
                namespace = %pod.namespace,
                document = %document_name,
                "Endpoint configuration document does not exist, no endpoints for pod"
            );
            return Ok(Some(Vec::new()));
        };

        Ok(Some(parse_config_document(&yaml)?.endpoints))
    }
}
