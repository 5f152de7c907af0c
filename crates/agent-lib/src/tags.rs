//! Tag maps attached to endpoints, metrics, and definitions
//!
//! Tags come in three layers (endpoint, metric, global) that are merged
//! with append-overrides semantics; each layer is token-expanded
//! independently before merging.

use crate::expand::{expand_tokens, ExpansionContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A set of key/value tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(pub HashMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with every value token-expanded against `ctx`.
    /// Keys are never expanded.
    pub fn expand_tokens(&self, ctx: &ExpansionContext) -> Tags {
        Tags(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), expand_tokens(v, ctx)))
                .collect(),
        )
    }

    /// Merge `other` into this set; on key conflict `other` wins.
    pub fn append(&mut self, other: &Tags) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

impl From<HashMap<String, String>> for Tags {
    fn from(map: HashMap<String, String>) -> Self {
        Tags(map)
    }
}

impl FromIterator<(String, String)> for Tags {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Tags(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_append_overrides() {
        let mut merged = tags(&[("env", "endpoint"), ("region", "us")]);
        merged.append(&tags(&[("env", "metric"), ("team", "core")]));

        assert_eq!(merged.get("env").unwrap(), "metric");
        assert_eq!(merged.get("region").unwrap(), "us");
        assert_eq!(merged.get("team").unwrap(), "core");
    }

    #[test]
    fn test_layer_precedence_endpoint_metric_global() {
        // endpoint tags are overridden by metric tags, which are overridden
        // by global tags
        let endpoint = tags(&[("env", "endpoint-level")]);
        let metric = tags(&[("env", "metric-level")]);
        let global = tags(&[("env", "global-level")]);

        let mut merged = Tags::new();
        merged.append(&endpoint);
        merged.append(&metric);
        merged.append(&global);

        assert_eq!(merged.get("env").unwrap(), "global-level");
    }

    #[test]
    fn test_expand_tokens_values_only() {
        let env: HashMap<String, String> =
            [("POD:name".to_string(), "web-1".to_string())].into();
        let ctx = ExpansionContext::new(env);

        let expanded = tags(&[("pod", "${POD:name}"), ("${POD:name}", "literal-key")])
            .expand_tokens(&ctx);

        assert_eq!(expanded.get("pod").unwrap(), "web-1");
        // keys pass through untouched
        assert_eq!(expanded.get("${POD:name}").unwrap(), "literal-key");
    }
}
