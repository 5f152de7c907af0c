//! Minimal Kubernetes API access for discovery
//!
//! Two interactions only: reading the ConfigMap a pod's scrape volume
//! references, and watching pods scheduled on this agent's node. The watch
//! is a long-lived HTTP request streaming JSON-lines events; on disconnect
//! it reconnects after a delay, resuming from the last seen
//! resourceVersion.

use super::{ConfigDocumentFetcher, Pod, PodEvent, PodVolume};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

const IN_CLUSTER_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const IN_CLUSTER_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const IN_CLUSTER_NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How to reach the cluster API, and who the agent is within the cluster.
#[derive(Debug, Clone, Default)]
pub struct KubeSettings {
    /// API server URL; empty means discover the in-cluster endpoint.
    pub master_url: String,
    /// Namespace the agent's own pod runs in; empty means read the
    /// mounted service-account namespace.
    pub namespace: String,
    /// Name of the agent's own pod (downward API).
    pub pod_name: String,
    /// Bearer token; empty means read the mounted service-account token.
    pub token: String,
    /// Extra root CA for the API server, PEM file path.
    pub ca_cert_file: String,
}

pub struct KubeClient {
    base: Url,
    token: String,
    namespace: String,
    pod_name: String,
    client: reqwest::Client,
}

impl KubeClient {
    pub async fn new(settings: &KubeSettings) -> Result<Self> {
        let master_url = if settings.master_url.is_empty() {
            in_cluster_master_url()?
        } else {
            settings.master_url.clone()
        };
        let base = Url::parse(&master_url)
            .with_context(|| format!("invalid cluster master url [{master_url}]"))?;

        let token = if settings.token.is_empty() {
            match tokio::fs::read_to_string(IN_CLUSTER_TOKEN_PATH).await {
                Ok(token) => token.trim().to_string(),
                Err(_) => String::new(),
            }
        } else {
            settings.token.clone()
        };

        let namespace = if settings.namespace.is_empty() {
            match tokio::fs::read_to_string(IN_CLUSTER_NAMESPACE_PATH).await {
                Ok(namespace) => namespace.trim().to_string(),
                Err(_) => String::new(),
            }
        } else {
            settings.namespace.clone()
        };

        let ca_cert_file = if settings.ca_cert_file.is_empty() {
            if tokio::fs::try_exists(IN_CLUSTER_CA_PATH).await.unwrap_or(false) {
                IN_CLUSTER_CA_PATH.to_string()
            } else {
                String::new()
            }
        } else {
            settings.ca_cert_file.clone()
        };

        let mut builder = reqwest::Client::builder();
        if !ca_cert_file.is_empty() {
            let pem = tokio::fs::read(&ca_cert_file)
                .await
                .with_context(|| format!("Failed to read cluster CA from {ca_cert_file}"))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .context("Failed to parse cluster CA certificate")?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .context("Failed to build cluster API client")?;

        Ok(Self {
            base,
            token,
            namespace,
            pod_name: settings.pod_name.clone(),
            client,
        })
    }

    /// Namespace the agent's own pod runs in; empty outside a cluster.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the agent's own pod; empty outside a cluster.
    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    /// Watch pods on `node_name`, pushing events until the receiver side
    /// closes. Reconnects with resourceVersion resume on stream loss.
    pub async fn watch_pods(&self, node_name: &str, events: mpsc::Sender<PodEvent>) {
        let mut resource_version = String::new();

        loop {
            match self
                .watch_pods_once(node_name, &mut resource_version, &events)
                .await
            {
                Ok(()) => debug!("Pod watch stream ended, reconnecting"),
                Err(e) => warn!(error = %e, "Pod watch failed, reconnecting"),
            }
            if events.is_closed() {
                return;
            }
            tokio::time::sleep(WATCH_RECONNECT_DELAY).await;
        }
    }

    async fn watch_pods_once(
        &self,
        node_name: &str,
        resource_version: &mut String,
        events: &mpsc::Sender<PodEvent>,
    ) -> Result<()> {
        let mut url = self
            .base
            .join("/api/v1/pods")
            .context("bad watch url")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("watch", "true");
            query.append_pair("fieldSelector", &format!("spec.nodeName={node_name}"));
            if !resource_version.is_empty() {
                query.append_pair("resourceVersion", resource_version);
            }
        }

        info!(node = %node_name, "Starting pod watch");
        let mut response = self
            .get(url)
            .send()
            .await
            .context("Failed to open pod watch")?;
        let status = response.status();
        if !status.is_success() {
            bail!("pod watch returned {status}");
        }

        let mut buffer = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .context("pod watch stream broke")?
        {
            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_watch_line(line) {
                    Ok(Some((event, version))) => {
                        if !version.is_empty() {
                            *resource_version = version;
                        }
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Skipping unparseable watch event"),
                }
            }
        }

        Ok(())
    }
}

fn in_cluster_master_url() -> Result<String> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .context("not running in a cluster and no master url configured")?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
    Ok(format!("https://{host}:{port}"))
}

/// Parse one JSON-lines watch event into a pod event plus the object's
/// resourceVersion. Non-pod events (e.g. BOOKMARK) yield `None`.
fn parse_watch_line(line: &str) -> Result<Option<(PodEvent, String)>> {
    let value: Value = serde_json::from_str(line).context("watch line is not JSON")?;
    let kind = value["type"].as_str().unwrap_or_default();
    let object = &value["object"];

    let pod = match pod_from_api_object(object) {
        Some(pod) => pod,
        None => return Ok(None),
    };
    let version = object["metadata"]["resourceVersion"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let event = match kind {
        "ADDED" => PodEvent::Added(pod),
        "MODIFIED" => PodEvent::Modified(pod),
        "DELETED" => PodEvent::Deleted(pod),
        other => {
            debug!(kind = %other, "Ignoring watch event");
            return Ok(None);
        }
    };
    Ok(Some((event, version)))
}

/// Extract the fields the agent cares about from a pod API object.
fn pod_from_api_object(object: &Value) -> Option<Pod> {
    let metadata = &object["metadata"];
    let name = metadata["name"].as_str()?;
    let namespace = metadata["namespace"].as_str().unwrap_or_default();
    let uid = metadata["uid"].as_str().unwrap_or_default();

    let labels: HashMap<String, String> = metadata["labels"]
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let spec = &object["spec"];
    let volumes: Vec<PodVolume> = spec["volumes"]
        .as_array()
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| {
                    Some(PodVolume {
                        name: v["name"].as_str()?.to_string(),
                        config_map: v["configMap"]["name"].as_str().map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let status = &object["status"];
    Some(Pod {
        name: name.to_string(),
        uid: uid.to_string(),
        namespace: namespace.to_string(),
        namespace_uid: String::new(),
        node_name: spec["nodeName"].as_str().unwrap_or_default().to_string(),
        node_uid: String::new(),
        ip: status["podIP"].as_str().unwrap_or_default().to_string(),
        host_ip: status["hostIP"].as_str().unwrap_or_default().to_string(),
        hostname: spec["hostname"].as_str().unwrap_or_default().to_string(),
        subdomain: spec["subdomain"].as_str().unwrap_or_default().to_string(),
        labels,
        volumes,
    })
}

#[async_trait]
impl ConfigDocumentFetcher for KubeClient {
    async fn fetch_document(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let url = self
            .base
            .join(&format!("/api/v1/namespaces/{namespace}/configmaps/{name}"))
            .context("bad configmap url")?;

        let response = self
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch configmap {namespace}/{name}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            bail!("configmap {namespace}/{name} fetch returned {status}");
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("configmap {namespace}/{name} is not valid JSON"))?;
        let data = body["data"].as_object();

        // the document is the "endpoints" entry, or the sole entry when the
        // configmap carries exactly one
        let document = data.and_then(|data| {
            data.get("endpoints")
                .or_else(|| (data.len() == 1).then(|| data.values().next()).flatten())
                .and_then(Value::as_str)
        });

        Ok(document.map(str::to_string))
    }
}
