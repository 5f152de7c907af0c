//! Prometheus endpoint adapter
//!
//! Scrapes the text exposition format and the delimited protobuf protocol,
//! dispatching on the response Content-Type. Each metric family becomes one
//! `CollectedMetric` whose datapoints carry the sample labels; histogram and
//! summary families are flattened into their `_bucket`/`_sum`/`_count` and
//! quantile component series so both formats normalize to the same emission
//! model.

use super::{apply_auth, MetricsCollector};
use crate::endpoint::Endpoint;
use crate::models::{now_millis, CollectedMetric, Datapoint, MetricDetails, MetricType};
use crate::units::infer_units_from_name;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Accept header offering the delimited protobuf protocol with a text
/// exposition fallback.
const ACCEPT_HEADER: &str = "application/vnd.google.protobuf;proto=io.prometheus.client.MetricFamily;encoding=delimited, text/plain;version=0.0.4;q=0.8";

const PROTOBUF_CONTENT_TYPE: &str = "application/vnd.google.protobuf";

pub struct PrometheusCollector {
    id: String,
    endpoint: Endpoint,
    url: Url,
    additional_env: HashMap<String, String>,
    client: reqwest::Client,
}

impl PrometheusCollector {
    pub fn new(
        id: String,
        endpoint: Endpoint,
        url: Url,
        additional_env: HashMap<String, String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            id,
            endpoint,
            url,
            additional_env,
            client,
        }
    }

    /// One GET against the exposition endpoint.
    async fn fetch(&self) -> Result<(String, Vec<u8>)> {
        let request = apply_auth(
            self.client
                .get(self.url.clone())
                .header(reqwest::header::ACCEPT, ACCEPT_HEADER),
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

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read scrape body from [{}]", self.url))?;

        Ok((content_type, body.to_vec()))
    }

    async fn fetch_and_parse(&self) -> Result<Exposition> {
        let (content_type, body) = self.fetch().await?;
        if content_type.starts_with(PROTOBUF_CONTENT_TYPE) {
            debug!(endpoint_id = %self.id, "Parsing protobuf exposition");
            parse_protobuf_exposition(&body)
        } else {
            let text = std::str::from_utf8(&body)
                .with_context(|| format!("endpoint [{}] returned non-UTF8 text body", self.url))?;
            parse_text_exposition(text)
        }
    }
}

#[async_trait]
impl MetricsCollector for PrometheusCollector {
    async fn collect_metrics(&self) -> Result<Vec<CollectedMetric>> {
        let exposition = self.fetch_and_parse().await?;
        Ok(exposition.into_collected(self.endpoint.tenant.clone()))
    }

    async fn collect_metric_details(&self, names: &[String]) -> Result<Vec<MetricDetails>> {
        let exposition = self.fetch_and_parse().await?;
        Ok(exposition.details(names))
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

/// What a family's TYPE line declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FamilyKind {
    #[default]
    Untyped,
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl FamilyKind {
    fn parse(raw: &str) -> Self {
        match raw {
            "counter" => FamilyKind::Counter,
            "gauge" => FamilyKind::Gauge,
            "histogram" => FamilyKind::Histogram,
            "summary" => FamilyKind::Summary,
            _ => FamilyKind::Untyped,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FamilyMeta {
    help: String,
    kind: FamilyKind,
}

/// Parsed scrape body, independent of the wire format it came in.
#[derive(Debug, Default)]
struct Exposition {
    /// Sample-series names in first-seen order.
    order: Vec<String>,
    samples: HashMap<String, Vec<Datapoint>>,
    /// Keyed by family name (which differs from the sample name for
    /// histogram/summary components).
    meta: HashMap<String, FamilyMeta>,
}

impl Exposition {
    fn push_sample(&mut self, name: &str, datapoint: Datapoint) {
        if !self.samples.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.samples.entry(name.to_string()).or_default().push(datapoint);
    }

    fn into_collected(self, tenant: Option<String>) -> Vec<CollectedMetric> {
        let Exposition {
            order,
            mut samples,
            meta,
        } = self;
        order
            .iter()
            .filter_map(|name| {
                let data = samples.remove(name)?;
                Some(CollectedMetric {
                    metric_type: metric_type_for(&meta, name),
                    name: name.clone(),
                    tenant: tenant.clone(),
                    data,
                })
            })
            .collect()
    }

    fn details(&self, names: &[String]) -> Vec<MetricDetails> {
        names
            .iter()
            .filter_map(|name| {
                let meta = meta_for(&self.meta, name)?;
                Some(MetricDetails {
                    name: name.clone(),
                    metric_type: metric_type_for(&self.meta, name),
                    description: meta.help.clone(),
                    units: infer_units_from_name(name).unwrap_or("").to_string(),
                })
            })
            .collect()
    }
}

/// The family meta a sample series belongs to, looking through the
/// histogram/summary component suffixes.
fn meta_for<'a>(
    meta: &'a HashMap<String, FamilyMeta>,
    sample_name: &str,
) -> Option<&'a FamilyMeta> {
    if let Some(found) = meta.get(sample_name) {
        return Some(found);
    }
    for suffix in ["_bucket", "_sum", "_count"] {
        if let Some(base) = sample_name.strip_suffix(suffix) {
            if let Some(found) = meta.get(base) {
                return Some(found);
            }
        }
    }
    None
}

fn metric_type_for(meta: &HashMap<String, FamilyMeta>, sample_name: &str) -> Option<MetricType> {
    let family = meta_for(meta, sample_name)?;
    match family.kind {
        FamilyKind::Counter => Some(MetricType::Counter),
        FamilyKind::Gauge => Some(MetricType::Gauge),
        FamilyKind::Untyped => None,
        // summary quantile samples keep the family name and read as gauges;
        // every _bucket/_sum/_count component accumulates
        FamilyKind::Summary if meta.contains_key(sample_name) => Some(MetricType::Gauge),
        FamilyKind::Summary | FamilyKind::Histogram => Some(MetricType::Counter),
    }
}

/// Parse the text exposition format (version 0.0.4).
fn parse_text_exposition(body: &str) -> Result<Exposition> {
    let mut exposition = Exposition::default();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("# HELP ") {
            let (name, help) = match rest.split_once(' ') {
                Some((name, help)) => (name, unescape_help(help)),
                None => (rest, String::new()),
            };
            exposition.meta.entry(name.to_string()).or_default().help = help;
        } else if let Some(rest) = line.strip_prefix("# TYPE ") {
            if let Some((name, kind)) = rest.split_once(' ') {
                exposition.meta.entry(name.to_string()).or_default().kind =
                    FamilyKind::parse(kind.trim());
            }
        } else if line.starts_with('#') {
            // other comments are ignored
        } else {
            let (name, datapoint) = parse_sample_line(line)?;
            exposition.push_sample(&name, datapoint);
        }
    }

    Ok(exposition)
}

/// Parse one sample line: `name[{labels}] value [timestamp_ms]`.
fn parse_sample_line(line: &str) -> Result<(String, Datapoint)> {
    let (name, rest) = match line.find(|c: char| c == '{' || c.is_whitespace()) {
        Some(idx) => (&line[..idx], &line[idx..]),
        None => bail!("sample line [{line}] has no value"),
    };

    let (labels, rest) = if let Some(stripped) = rest.strip_prefix('{') {
        parse_labels(stripped).with_context(|| format!("bad labels in sample line [{line}]"))?
    } else {
        (HashMap::new(), rest)
    };

    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or_else(|| anyhow!("sample line [{line}] has no value"))?;
    let value = parse_value(value).with_context(|| format!("bad value in sample line [{line}]"))?;
    let timestamp = match fields.next() {
        Some(ts) => ts
            .parse::<i64>()
            .with_context(|| format!("bad timestamp in sample line [{line}]"))?,
        None => now_millis(),
    };

    Ok((name.to_string(), Datapoint::with_tags(timestamp, value, labels)))
}

/// Parse `key="value",...}` starting just past the opening brace. Returns
/// the labels and the remainder of the line after the closing brace.
fn parse_labels(input: &str) -> Result<(HashMap<String, String>, &str)> {
    let mut labels = HashMap::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix('}') {
            return Ok((labels, after));
        }

        let eq = rest
            .find('=')
            .ok_or_else(|| anyhow!("label without '=' in [{rest}]"))?;
        let key = rest[..eq].trim().to_string();
        rest = rest[eq + 1..]
            .trim_start()
            .strip_prefix('"')
            .ok_or_else(|| anyhow!("label value is not quoted"))?;

        let mut value = String::new();
        let mut chars = rest.char_indices();
        let mut end = None;
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, escaped)) => value.push(escaped),
                    None => bail!("dangling escape in label value"),
                },
                '"' => {
                    end = Some(i + 1);
                    break;
                }
                _ => value.push(c),
            }
        }
        let end = end.ok_or_else(|| anyhow!("unterminated label value"))?;
        labels.insert(key, value);

        rest = rest[end..].trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest);
    }
}

fn parse_value(raw: &str) -> Result<f64> {
    match raw {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => raw
            .parse::<f64>()
            .map_err(|e| anyhow!("[{raw}] is not a number: {e}")),
    }
}

fn unescape_help(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(escaped) => out.push(escaped),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse the delimited protobuf protocol: a sequence of length-prefixed
/// `MetricFamily` messages.
fn parse_protobuf_exposition(body: &[u8]) -> Result<Exposition> {
    use prometheus::proto::{self, MetricFamily};

    let mut exposition = Exposition::default();
    let mut stream = protobuf::CodedInputStream::from_bytes(body);

    while !stream
        .eof()
        .context("Failed to read protobuf exposition stream")?
    {
        let family: MetricFamily = stream
            .read_message()
            .context("Failed to decode MetricFamily message")?;

        let name = family.get_name().to_string();
        let kind = match family.get_field_type() {
            proto::MetricType::COUNTER => FamilyKind::Counter,
            proto::MetricType::GAUGE => FamilyKind::Gauge,
            proto::MetricType::SUMMARY => FamilyKind::Summary,
            proto::MetricType::HISTOGRAM => FamilyKind::Histogram,
            proto::MetricType::UNTYPED => FamilyKind::Untyped,
        };
        {
            let meta = exposition.meta.entry(name.clone()).or_default();
            meta.help = family.get_help().to_string();
            meta.kind = kind;
        }

        for metric in family.get_metric() {
            let labels: HashMap<String, String> = metric
                .get_label()
                .iter()
                .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
                .collect();
            let timestamp = if metric.get_timestamp_ms() > 0 {
                metric.get_timestamp_ms()
            } else {
                now_millis()
            };

            match kind {
                FamilyKind::Counter => {
                    let dp =
                        Datapoint::with_tags(timestamp, metric.get_counter().get_value(), labels);
                    exposition.push_sample(&name, dp);
                }
                FamilyKind::Gauge => {
                    let dp =
                        Datapoint::with_tags(timestamp, metric.get_gauge().get_value(), labels);
                    exposition.push_sample(&name, dp);
                }
                FamilyKind::Untyped => {
                    let dp =
                        Datapoint::with_tags(timestamp, metric.get_untyped().get_value(), labels);
                    exposition.push_sample(&name, dp);
                }
                FamilyKind::Summary => {
                    let summary = metric.get_summary();
                    for q in summary.get_quantile() {
                        let mut tags = labels.clone();
                        tags.insert("quantile".to_string(), format_bound(q.get_quantile()));
                        exposition.push_sample(
                            &name,
                            Datapoint::with_tags(timestamp, q.get_value(), tags),
                        );
                    }
                    exposition.push_sample(
                        &format!("{name}_sum"),
                        Datapoint::with_tags(timestamp, summary.get_sample_sum(), labels.clone()),
                    );
                    exposition.push_sample(
                        &format!("{name}_count"),
                        Datapoint::with_tags(
                            timestamp,
                            summary.get_sample_count() as f64,
                            labels,
                        ),
                    );
                }
                FamilyKind::Histogram => {
                    let histogram = metric.get_histogram();
                    for bucket in histogram.get_bucket() {
                        let mut tags = labels.clone();
                        tags.insert("le".to_string(), format_bound(bucket.get_upper_bound()));
                        exposition.push_sample(
                            &format!("{name}_bucket"),
                            Datapoint::with_tags(
                                timestamp,
                                bucket.get_cumulative_count() as f64,
                                tags,
                            ),
                        );
                    }
                    exposition.push_sample(
                        &format!("{name}_sum"),
                        Datapoint::with_tags(timestamp, histogram.get_sample_sum(), labels.clone()),
                    );
                    exposition.push_sample(
                        &format!("{name}_count"),
                        Datapoint::with_tags(
                            timestamp,
                            histogram.get_sample_count() as f64,
                            labels,
                        ),
                    );
                }
            }
        }
    }

    Ok(exposition)
}

/// Render a bucket bound or quantile the way the text format spells it.
fn format_bound(v: f64) -> String {
    if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}
