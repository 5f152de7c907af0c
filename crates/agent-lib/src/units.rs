//! Measurement units attached to metric definitions
//!
//! Units are free-form in the endpoint configuration but validated against
//! the set the store understands. Prometheus metric names often encode their
//! unit as a suffix, which the adapter uses to fill in details the
//! configuration left out.

use anyhow::{bail, Result};

/// A validated measurement unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricUnits {
    pub symbol: &'static str,
}

pub const NONE: MetricUnits = MetricUnits { symbol: "" };

/// Unit symbols accepted in endpoint configuration.
const KNOWN_UNITS: &[&str] = &[
    "", "none", "%", "B", "KB", "MB", "GB", "TB", "KiB", "MiB", "GiB", "TiB", "ns", "us", "ms",
    "s", "min", "h", "d", "Hz", "KHz", "MHz", "GHz",
];

/// Look up a configured unit symbol. An empty symbol means "no units".
pub fn metric_units(symbol: &str) -> Result<MetricUnits> {
    for known in KNOWN_UNITS {
        if symbol == *known {
            let symbol = if *known == "none" { "" } else { known };
            return Ok(MetricUnits { symbol });
        }
    }
    bail!("unknown units symbol [{symbol}]");
}

/// Metric-name suffixes that imply a unit, per Prometheus naming practice.
const NAME_SUFFIX_UNITS: &[(&str, &str)] = &[
    ("_seconds", "s"),
    ("_milliseconds", "ms"),
    ("_microseconds", "us"),
    ("_nanoseconds", "ns"),
    ("_bytes", "B"),
    ("_ratio", "%"),
    ("_percent", "%"),
];

/// Infer a unit from a metric name, if the name carries a recognized suffix.
pub fn infer_units_from_name(name: &str) -> Option<&'static str> {
    NAME_SUFFIX_UNITS
        .iter()
        .find(|(suffix, _)| name.ends_with(suffix))
        .map(|(_, symbol)| *symbol)
}
