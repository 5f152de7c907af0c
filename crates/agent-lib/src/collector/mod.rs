//! Metric collection from HTTP monitoring endpoints
//!
//! This module provides the protocol adapters (Prometheus exposition and
//! Jolokia JSON-over-HTTP), the identity expansion pipeline that turns
//! collected samples into store-ready series, and the manager that runs one
//! periodic scheduler per endpoint.

mod expansion;
mod jolokia;
mod manager;
mod prometheus;

#[cfg(test)]
mod tests;

pub use expansion::{compose_definition, expand_metric, resolve_monitored, ExpansionConfig};
pub use jolokia::{JolokiaCollector, JolokiaMetricName};
pub use manager::{CollectorManager, CollectorSettings};
pub use prometheus::PrometheusCollector;

use crate::endpoint::{Credentials, Endpoint, EndpointType};
use crate::models::{CollectedMetric, MetricDetails};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use async_trait::async_trait;

/// A protocol adapter bound to one endpoint.
///
/// Adapters are stateless beyond their construction arguments: one
/// `collect_metrics` call performs exactly one HTTP request and never
/// retries — the collection interval is the pacing mechanism.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Scrape the endpoint once and return the collected samples.
    async fn collect_metrics(&self) -> Result<Vec<CollectedMetric>>;

    /// Fetch per-metric metadata (type, description, units) for the named
    /// metrics, where the protocol exposes any.
    async fn collect_metric_details(&self, names: &[String]) -> Result<Vec<MetricDetails>>;

    /// The scheduler id this adapter is keyed by.
    fn id(&self) -> &str;

    fn endpoint(&self) -> &Endpoint;

    /// Pod-derived environment used for token expansion; empty for static
    /// endpoints.
    fn additional_environment(&self) -> &HashMap<String, String>;
}

/// TLS material presented to https endpoints: the agent's client
/// certificate and key, plus an optional extra root CA for endpoints
/// signed by a private issuer.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_pem: Option<Vec<u8>>,
}

impl ClientIdentity {
    pub async fn from_files(cert_file: &str, key_file: &str) -> Result<Self> {
        let cert_pem = tokio::fs::read(cert_file)
            .await
            .with_context(|| format!("Failed to read client certificate from {cert_file}"))?;
        let key_pem = tokio::fs::read(key_file)
            .await
            .with_context(|| format!("Failed to read client key from {key_file}"))?;
        Ok(Self {
            cert_pem,
            key_pem,
            ca_pem: None,
        })
    }

    /// Additionally trust the root CA in the given PEM file.
    pub async fn with_ca_file(mut self, ca_file: &str) -> Result<Self> {
        let ca_pem = tokio::fs::read(ca_file)
            .await
            .with_context(|| format!("Failed to read endpoint CA from {ca_file}"))?;
        self.ca_pem = Some(ca_pem);
        Ok(self)
    }
}

/// Build the reqwest client an adapter scrapes with. The agent's client
/// identity (and its extra root CA, when declared) is attached only when
/// the endpoint scheme is https.
pub(crate) fn build_http_client(
    url: &url::Url,
    identity: Option<&ClientIdentity>,
    timeout: Duration,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if url.scheme() == "https" {
        if let Some(identity) = identity {
            let mut pem = identity.cert_pem.clone();
            pem.extend_from_slice(&identity.key_pem);
            let client_identity = reqwest::Identity::from_pem(&pem)
                .context("Failed to load agent client identity")?;
            builder = builder.identity(client_identity);

            if let Some(ca_pem) = &identity.ca_pem {
                let cert = reqwest::Certificate::from_pem(ca_pem)
                    .context("Failed to parse endpoint CA certificate")?;
                builder = builder.add_root_certificate(cert);
            }
        }
    }

    builder.build().context("Failed to build HTTP client")
}

/// Attach endpoint credentials to a request. A bearer token takes
/// precedence over username/password.
pub(crate) fn apply_auth(
    request: reqwest::RequestBuilder,
    credentials: &Credentials,
) -> reqwest::RequestBuilder {
    if !credentials.token.is_empty() {
        request.bearer_auth(&credentials.token)
    } else if !credentials.username.is_empty() {
        request.basic_auth(&credentials.username, Some(&credentials.password))
    } else {
        request
    }
}

/// Create the adapter matching the endpoint's declared protocol.
///
/// `host` resolves the protocol/port/path addressing form (the pod IP for
/// discovered endpoints); static endpoints carry absolute URLs and pass
/// `None`.
pub fn create_collector(
    id: String,
    endpoint: Endpoint,
    host: Option<&str>,
    additional_env: HashMap<String, String>,
    identity: Option<&ClientIdentity>,
    scrape_timeout: Duration,
) -> Result<Arc<dyn MetricsCollector>> {
    endpoint.validate()?;
    let url = endpoint.resolve_url(host)?;
    let client = build_http_client(&url, identity, scrape_timeout)?;

    let collector: Arc<dyn MetricsCollector> = match endpoint.endpoint_type {
        EndpointType::Prometheus => Arc::new(PrometheusCollector::new(
            id,
            endpoint,
            url,
            additional_env,
            client,
        )),
        EndpointType::Jolokia => Arc::new(JolokiaCollector::new(
            id,
            endpoint,
            url,
            additional_env,
            client,
        )),
    };

    Ok(collector)
}
