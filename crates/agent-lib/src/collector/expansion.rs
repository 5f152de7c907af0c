//! Metric identity expansion
//!
//! One collected metric can materialize into many emitted series. Endpoints
//! that report distinct time series through labels (Prometheus) declare
//! metric ids with `${label}` tokens; a metric whose datapoints carry labels
//! but whose id declares no tokens is split anyway under a deterministic
//! template built from the sorted label keys, so the same label set always
//! produces the same ids regardless of sample ordering.

use crate::endpoint::{Endpoint, MonitoredMetric};
use crate::expand::{expand_tokens, ExpansionContext};
use crate::models::{CollectedMetric, EmittedSeries, MetricDefinition, MetricDetails, MetricType};
use crate::tags::Tags;
use crate::units;
use std::collections::{BTreeSet, HashMap};
use tracing::{trace, warn};

/// Per-scheduler context for id expansion.
#[derive(Debug, Clone, Default)]
pub struct ExpansionConfig {
    /// Global prefix prepended to every expanded id. May reference OS
    /// environment variables.
    pub metric_id_prefix: String,
    /// Pod-derived environment; the only environment id templates and
    /// endpoint/metric tags may read.
    pub additional_env: HashMap<String, String>,
}

/// Match a collected metric against the endpoint's declared list.
///
/// A non-empty list acts as a filter: collected metrics not in it return
/// `None` (the caller drops them with a warning). An empty list means
/// "collect everything" and fabricates a synthetic declaration from the
/// collected data.
pub fn resolve_monitored(
    collected: &CollectedMetric,
    by_name: &HashMap<String, MonitoredMetric>,
) -> Option<MonitoredMetric> {
    if by_name.is_empty() {
        return Some(MonitoredMetric {
            name: collected.name.clone(),
            id: collected.name.clone(),
            metric_type: collected.metric_type,
            ..Default::default()
        });
    }
    by_name.get(&collected.name).cloned()
}

/// Expand one collected metric into its emitted series.
pub fn expand_metric(
    collected: &CollectedMetric,
    monitored: &MonitoredMetric,
    config: &ExpansionConfig,
) -> Vec<EmittedSeries> {
    // the prefix may read OS env; the id template may not (pod-provided
    // templates must not see agent secrets). Unmapped tokens are kept so a
    // still-templated id signals "split by label".
    let prefix_ctx = ExpansionContext::new(config.additional_env.clone()).with_os_env();
    let id_ctx = ExpansionContext::new(config.additional_env.clone()).keeping_unresolved();

    let mut id = format!(
        "{}{}",
        expand_tokens(&config.metric_id_prefix, &prefix_ctx),
        expand_tokens(monitored.effective_id(), &id_ctx)
    );

    let metric_type = monitored
        .metric_type
        .or(collected.metric_type)
        .unwrap_or(MetricType::Gauge);

    if !id.contains("${") {
        // a plain id with labeled datapoints is rewritten to a template
        // over the sorted union of label keys
        let keys: BTreeSet<&str> = collected
            .data
            .iter()
            .flat_map(|dp| dp.tags.keys().map(String::as_str))
            .collect();
        if !keys.is_empty() {
            let template = keys
                .iter()
                .map(|k| format!("{k}=${{{k}}}"))
                .collect::<Vec<_>>()
                .join(",");
            id = format!("{id}{{{template}}}");
            trace!(
                metric = %monitored.name,
                id = %id,
                "Metric will be split into separate series by label"
            );
        }
    }

    if id.contains("${") {
        // templated id: one series per datapoint, tokens resolved against
        // that datapoint's own labels (missing keys expand to empty)
        collected
            .data
            .iter()
            .map(|dp| {
                let dp_ctx = ExpansionContext::new(dp.tags.clone());
                EmittedSeries {
                    tenant: collected.tenant.clone(),
                    metric_type,
                    id: expand_tokens(&id, &dp_ctx),
                    data: vec![dp.clone()],
                }
            })
            .collect()
    } else {
        vec![EmittedSeries {
            tenant: collected.tenant.clone(),
            metric_type,
            id,
            data: collected.data.clone(),
        }]
    }
}

/// Compose the definition record for one expanded id.
///
/// Tag layers merge with endpoint tags overridden by metric tags overridden
/// by global tags; this inversion is intentional so cluster operators can
/// pin tags that pod-provided configuration cannot shadow. Only the global
/// layer may read OS environment variables.
pub fn compose_definition(
    monitored: &MonitoredMetric,
    metric_id: &str,
    details: Option<&MetricDetails>,
    endpoint: &Endpoint,
    global_tags: &Tags,
    additional_env: &HashMap<String, String>,
) -> MetricDefinition {
    let metric_type = monitored
        .metric_type
        .or(details.and_then(|d| d.metric_type))
        .unwrap_or_else(|| {
            warn!(
                metric = %monitored.name,
                assumed = %MetricType::Gauge,
                "Metric type cannot be determined; assuming gauge"
            );
            MetricType::Gauge
        });

    let description = if monitored.description.is_empty() {
        details.map(|d| d.description.clone()).unwrap_or_default()
    } else {
        monitored.description.clone()
    };

    let units_symbol = if monitored.units.is_empty() {
        details.map(|d| d.units.clone()).unwrap_or_default()
    } else {
        monitored.units.clone()
    };
    let units = match units::metric_units(&units_symbol) {
        Ok(u) => u,
        Err(e) => {
            warn!(
                metric = %monitored.name,
                units = %units_symbol,
                error = %e,
                "Invalid units symbol; dropping units"
            );
            units::NONE
        }
    };

    // tag tokens can reference the metric being defined as well as the
    // pod-derived environment
    let mut env = additional_env.clone();
    env.insert("METRIC:name".to_string(), monitored.name.clone());
    env.insert("METRIC:id".to_string(), metric_id.to_string());
    env.insert("METRIC:units".to_string(), units.symbol.to_string());
    env.insert("METRIC:description".to_string(), description.clone());

    let no_os_env = ExpansionContext::new(env.clone());
    let with_os_env = ExpansionContext::new(env).with_os_env();

    let endpoint_tags = endpoint.tags.expand_tokens(&no_os_env);
    let mut metric_tags = monitored.tags.expand_tokens(&no_os_env);
    let global = global_tags.expand_tokens(&with_os_env);

    // fixed tags join the metric layer before the precedence merge, so
    // higher layers may override them
    if !description.is_empty() {
        metric_tags.insert("description", description);
    }
    if !units.symbol.is_empty() {
        metric_tags.insert("units", units.symbol);
    }

    let mut all_tags = Tags::new();
    all_tags.append(&endpoint_tags); // endpoint tags are overridden by
    all_tags.append(&metric_tags); // metric tags which are overridden by
    all_tags.append(&global); // global tags

    MetricDefinition {
        tenant: endpoint.tenant.clone(),
        metric_type,
        id: metric_id.to_string(),
        tags: all_tags.into_inner(),
    }
}
