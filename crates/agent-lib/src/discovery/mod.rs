//! Dynamic endpoint discovery from the node's pods
//!
//! The agent watches pods on its own node. A pod opts into scraping by
//! mounting a volume (with a well-known name) that references a
//! configuration document in the pod's namespace; the document carries the
//! endpoint list to collect from that pod.

mod kube;
mod merger;

pub use kube::{KubeClient, KubeSettings};
pub use merger::EndpointSourceMerger;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The subset of a pod resource the agent reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    #[serde(default)]
    pub namespace_uid: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub node_uid: String,
    /// The pod IP scrape URLs are resolved against.
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<PodVolume>,
}

/// A pod volume; only ConfigMap-backed volumes matter here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodVolume {
    pub name: String,
    /// Name of the referenced ConfigMap, when the volume is backed by one.
    #[serde(default)]
    pub config_map: Option<String>,
}

impl Pod {
    /// The ConfigMap name referenced by the sentinel volume, if the pod
    /// opted into scraping.
    pub fn scrape_document(&self, volume_name: &str) -> Option<&str> {
        self.volumes
            .iter()
            .find(|v| v.name == volume_name)
            .and_then(|v| v.config_map.as_deref())
    }
}

/// Pod lifecycle events produced by the orchestrator watcher.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

impl PodEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Added(pod) | PodEvent::Modified(pod) | PodEvent::Deleted(pod) => pod,
        }
    }
}

/// Reads the per-pod endpoint configuration document from the cluster.
/// `Ok(None)` means the document does not exist.
#[async_trait]
pub trait ConfigDocumentFetcher: Send + Sync {
    async fn fetch_document(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

/// Pod attributes exposed to token expansion in ids and tags.
pub fn additional_environment(pod: &Pod) -> HashMap<String, String> {
    let mut env = HashMap::from([
        ("POD:node_name".to_string(), pod.node_name.clone()),
        ("POD:node_uid".to_string(), pod.node_uid.clone()),
        ("POD:namespace_name".to_string(), pod.namespace.clone()),
        ("POD:namespace_uid".to_string(), pod.namespace_uid.clone()),
        ("POD:name".to_string(), pod.name.clone()),
        ("POD:uid".to_string(), pod.uid.clone()),
        ("POD:ip".to_string(), pod.ip.clone()),
        ("POD:host_ip".to_string(), pod.host_ip.clone()),
        ("POD:hostname".to_string(), pod.hostname.clone()),
        ("POD:subdomain".to_string(), pod.subdomain.clone()),
    ]);

    let mut joined: Vec<String> = pod
        .labels
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect();
    joined.sort();
    env.insert("POD:labels".to_string(), joined.join(","));

    for (key, value) in &pod.labels {
        env.insert(format!("POD:label[{key}]"), value.clone());
    }

    env
}
