//! Core data records for the collection pipeline

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Metric type understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample: a timestamped value with its labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

impl Datapoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value,
            tags: HashMap::new(),
        }
    }

    pub fn with_tags(timestamp: i64, value: f64, tags: HashMap<String, String>) -> Self {
        Self {
            timestamp,
            value,
            tags,
        }
    }
}

/// What an adapter returns for one metric name in one scrape cycle.
///
/// Alive only within that cycle; the identity expander turns it into one or
/// more [`EmittedSeries`].
#[derive(Debug, Clone)]
pub struct CollectedMetric {
    /// Protocol-native metric name.
    pub name: String,
    /// Type as reported by the endpoint, if the protocol carries one.
    pub metric_type: Option<MetricType>,
    pub tenant: Option<String>,
    pub data: Vec<Datapoint>,
}

/// A fully identified time series forwarded to the store.
#[derive(Debug, Clone, Serialize)]
pub struct EmittedSeries {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub id: String,
    pub data: Vec<Datapoint>,
}

/// A definition record announcing a series id, its type, and tags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub id: String,
    pub tags: HashMap<String, String>,
}

/// Per-metric metadata an endpoint exposes about itself (Prometheus HELP and
/// TYPE lines; Jolokia carries none).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricDetails {
    pub name: String,
    pub metric_type: Option<MetricType>,
    pub description: String,
    /// Unit symbol inferred from the metric name, empty when unknown.
    pub units: String,
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
