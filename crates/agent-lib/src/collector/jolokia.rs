//! Jolokia endpoint adapter
//!
//! Reads JMX attributes over Jolokia's JSON-over-HTTP protocol. All
//! configured metrics are fetched with a single bulk-read POST; each
//! response entry yields one `CollectedMetric` with one `Datapoint`. A
//! failed entry (error status, missing or non-numeric value) is logged and
//! dropped without failing the cycle.
//!
//! Metric names use the grammar `mbean-object-name '#' attribute
//! ('#' composite-key)?`, e.g. `java.lang:type=Memory#HeapMemoryUsage#used`.

use super::{apply_auth, MetricsCollector};
use crate::endpoint::Endpoint;
use crate::models::{now_millis, CollectedMetric, Datapoint, MetricDetails};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;
use url::Url;

/// A parsed Jolokia metric name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JolokiaMetricName {
    pub mbean: String,
    pub attribute: String,
    /// Key within a composite attribute value, if any.
    pub path: Option<String>,
}

impl JolokiaMetricName {
    /// Parse `mbean#attribute(#composite-key)?`.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('#').collect();
        match parts.as_slice() {
            [mbean, attribute] if !mbean.is_empty() && !attribute.is_empty() => Ok(Self {
                mbean: mbean.to_string(),
                attribute: attribute.to_string(),
                path: None,
            }),
            [mbean, attribute, path]
                if !mbean.is_empty() && !attribute.is_empty() && !path.is_empty() =>
            {
                Ok(Self {
                    mbean: mbean.to_string(),
                    attribute: attribute.to_string(),
                    path: Some(path.to_string()),
                })
            }
            _ => bail!("metric name [{raw}] is not of the form mbean#attribute(#path)"),
        }
    }
}

/// One entry of the bulk-read request array.
#[derive(Debug, Serialize)]
struct ReadRequest<'a> {
    #[serde(rename = "type")]
    request_type: &'static str,
    mbean: &'a str,
    attribute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
}

/// One entry of the bulk-read response array.
#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<String>,
}

pub struct JolokiaCollector {
    id: String,
    endpoint: Endpoint,
    url: Url,
    additional_env: HashMap<String, String>,
    client: reqwest::Client,
}

impl JolokiaCollector {
    pub fn new(
        id: String,
        endpoint: Endpoint,
        url: Url,
        additional_env: HashMap<String, String>,
        client: reqwest::Client,
    ) -> Self {
        if endpoint.metrics.is_empty() {
            // unlike Prometheus there is nothing to enumerate, so an empty
            // list collects nothing until the endpoint config names metrics
            warn!(
                endpoint_id = %id,
                "Jolokia endpoint declares no metrics; nothing will be collected"
            );
        }
        Self {
            id,
            endpoint,
            url,
            additional_env,
            client,
        }
    }
}

#[async_trait]
impl MetricsCollector for JolokiaCollector {
    async fn collect_metrics(&self) -> Result<Vec<CollectedMetric>> {
        // parse every configured name first; a bad name drops that entry
        // only
        let mut targets: Vec<(&str, JolokiaMetricName)> = Vec::new();
        for metric in &self.endpoint.metrics {
            match JolokiaMetricName::parse(&metric.name) {
                Ok(parsed) => targets.push((metric.name.as_str(), parsed)),
                Err(e) => {
                    warn!(
                        endpoint_id = %self.id,
                        metric = %metric.name,
                        error = %e,
                        "Skipping unparseable Jolokia metric name"
                    );
                }
            }
        }

        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<ReadRequest<'_>> = targets
            .iter()
            .map(|(_, name)| ReadRequest {
                request_type: "read",
                mbean: &name.mbean,
                attribute: &name.attribute,
                path: name.path.as_deref(),
            })
            .collect();

        let request = apply_auth(
            self.client.post(self.url.clone()).json(&requests),
            &self.endpoint.credentials,
        );
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to scrape [{}]", self.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("endpoint [{}] returned {}", self.url, status);
        }

        let responses: Vec<ReadResponse> = response
            .json()
            .await
            .with_context(|| format!("endpoint [{}] returned unparseable JSON", self.url))?;

        if responses.len() != targets.len() {
            bail!(
                "endpoint [{}] returned {} responses for {} requests",
                self.url,
                responses.len(),
                targets.len()
            );
        }

        // the bulk response array parallels the request array
        let timestamp = now_millis();
        let mut collected = Vec::with_capacity(targets.len());
        for ((raw_name, parsed), entry) in targets.iter().zip(responses) {
            if entry.status != 200 {
                warn!(
                    endpoint_id = %self.id,
                    metric = %raw_name,
                    status = entry.status,
                    error = entry.error.as_deref().unwrap_or("unknown"),
                    "Jolokia read failed for metric"
                );
                continue;
            }
            let Some(value) = numeric_value(&entry.value, parsed.path.as_deref()) else {
                warn!(
                    endpoint_id = %self.id,
                    metric = %raw_name,
                    "Jolokia read returned a missing or non-numeric value"
                );
                continue;
            };

            let monitored = self
                .endpoint
                .metrics
                .iter()
                .find(|m| m.name == *raw_name);
            collected.push(CollectedMetric {
                name: raw_name.to_string(),
                metric_type: monitored.and_then(|m| m.metric_type),
                tenant: self.endpoint.tenant.clone(),
                data: vec![Datapoint::new(timestamp, value)],
            });
        }

        Ok(collected)
    }

    async fn collect_metric_details(&self, _names: &[String]) -> Result<Vec<MetricDetails>> {
        // Jolokia carries no type/help metadata
        Ok(Vec::new())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn additional_environment(&self) -> &HashMap<String, String> {
        &self.additional_env
    }
}

/// Pull a numeric value out of a Jolokia response entry. When a composite
/// key was requested Jolokia usually resolves it server-side, but an object
/// value with a known path is still indexed here.
fn numeric_value(value: &serde_json::Value, path: Option<&str>) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Object(map) => {
            let key = path?;
            match map.get(key) {
                Some(serde_json::Value::Number(n)) => n.as_f64(),
                _ => None,
            }
        }
        _ => None,
    }
}
