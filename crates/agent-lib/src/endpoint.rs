//! Endpoint configuration schema
//!
//! The same schema is used by the agent's own config file (static endpoints)
//! and by the per-pod configuration documents discovered through the
//! orchestrator. Discovered endpoints are usually given as
//! protocol/port/path relative to the pod's IP; static endpoints carry an
//! absolute URL.

use crate::models::MetricType;
use crate::tags::Tags;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Scrape protocol spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Prometheus,
    Jolokia,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Prometheus => "prometheus",
            EndpointType::Jolokia => "jolokia",
        }
    }
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Credentials presented to an endpoint. A bearer token takes precedence
/// over username/password.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.token.is_empty() && self.username.is_empty()
    }
}

/// One metric the endpoint owner wants collected, with identity and tag
/// templates. An empty list on the endpoint means "collect everything".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoredMetric {
    /// Protocol-native identifier (Prometheus family name, or Jolokia
    /// `mbean#attribute#path`).
    pub name: String,
    /// Id template; may contain `${...}` tokens. Defaults to the name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<MetricType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub units: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
}

impl MonitoredMetric {
    /// The id template to expand, falling back to the name when no explicit
    /// template was configured.
    pub fn effective_id(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}

/// One HTTP target metrics are polled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Absolute URL; alternative to protocol/port/path.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Duration string such as "30s". Parsed (and clamped) when the
    /// scheduler starts, not here.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub collection_interval: String,
    #[serde(default, skip_serializing_if = "Credentials::is_empty")]
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MonitoredMetric>,
}

fn default_enabled() -> bool {
    true
}

impl Endpoint {
    /// Check the invariant that exactly one addressing form is used: either
    /// an absolute URL, or protocol/port/path resolved against a host.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            if self.port.is_none() {
                bail!("endpoint must declare either a url or a port");
            }
        } else if self.port.is_some() {
            bail!("endpoint must declare a url or protocol/port/path, not both");
        }
        let mut seen = std::collections::HashSet::new();
        for m in &self.metrics {
            if m.name.is_empty() {
                bail!("monitored metric with empty name");
            }
            if !seen.insert(m.name.as_str()) {
                bail!("monitored metric [{}] declared more than once", m.name);
            }
        }
        Ok(())
    }

    /// Resolve the scrape URL. Discovered endpoints pass the pod IP as
    /// `host`; static endpoints carry an absolute URL and pass `None`.
    pub fn resolve_url(&self, host: Option<&str>) -> Result<Url> {
        if !self.url.is_empty() {
            return Url::parse(&self.url)
                .with_context(|| format!("invalid endpoint url [{}]", self.url));
        }
        let host = host.context("endpoint has no url and no host to resolve against")?;
        let port = self
            .port
            .context("endpoint has no url and no port to resolve against")?;
        let path = self.path.trim_start_matches('/');
        let raw = format!("{}://{}:{}/{}", self.protocol.scheme(), host, port, path);
        Url::parse(&raw).with_context(|| format!("invalid endpoint address [{raw}]"))
    }
}

/// The YAML document stored in the cluster configuration object referenced
/// by a pod volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfigDocument {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// Parse a per-pod endpoint document. Every endpoint is validated; a single
/// bad endpoint fails the whole document so the pod's schedulers are not
/// half-started.
pub fn parse_config_document(yaml: &str) -> Result<EndpointConfigDocument> {
    let doc: EndpointConfigDocument =
        serde_yaml::from_str(yaml).context("malformed endpoint configuration document")?;
    for e in &doc.endpoints {
        e.validate()?;
    }
    Ok(doc)
}

/// Sentinel used in place of namespace and pod name for endpoints that come
/// from the agent's own configuration file.
pub const STATIC_ENDPOINT_SENTINEL: &str = "X";

/// Build the scheduler id an endpoint is keyed by. Re-starting under the
/// same id supersedes the prior scheduler.
pub fn scheduler_id(
    namespace: &str,
    pod_name: &str,
    endpoint_type: EndpointType,
    location: &str,
) -> String {
    format!("{namespace}|{pod_name}|{endpoint_type}|{location}")
}
