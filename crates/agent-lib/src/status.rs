//! Process-wide status report
//!
//! Tracks the last known state of every active endpoint plus a bounded ring
//! of lifecycle log lines. Created once at startup and passed by handle to
//! the schedulers and the telemetry emitter; every mutation goes through the
//! inner lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

const DEFAULT_LOG_CAPACITY: usize = 100;

/// Shared handle to the status report.
#[derive(Debug, Clone)]
pub struct StatusRegistry {
    inner: Arc<RwLock<StatusInner>>,
}

#[derive(Debug)]
struct StatusInner {
    endpoints: HashMap<String, String>,
    log: VecDeque<String>,
    log_capacity: usize,
}

/// Point-in-time view served by the telemetry emitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub endpoints: BTreeMap<String, String>,
    pub log: Vec<String>,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StatusInner {
                endpoints: HashMap::new(),
                log: VecDeque::with_capacity(log_capacity),
                log_capacity,
            })),
        }
    }

    /// Record the latest state string for an endpoint.
    pub async fn set_endpoint(&self, id: impl Into<String>, state: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.endpoints.insert(id.into(), state.into());
    }

    /// Drop an endpoint's entry entirely (used when its scheduler stops).
    pub async fn remove_endpoint(&self, id: &str) {
        let mut inner = self.inner.write().await;
        inner.endpoints.remove(id);
    }

    pub async fn clear_endpoints(&self) {
        let mut inner = self.inner.write().await;
        inner.endpoints.clear();
    }

    /// Append a timestamped line to the bounded log ring; the oldest line is
    /// evicted once the ring is full.
    pub async fn add_log_message(&self, message: impl Into<String>) {
        let line = format!("{}: {}", chrono::Utc::now().to_rfc3339(), message.into());
        let mut inner = self.inner.write().await;
        if inner.log.len() >= inner.log_capacity {
            inner.log.pop_front();
        }
        inner.log.push_back(line);
    }

    pub async fn endpoint(&self, id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.endpoints.get(id).cloned()
    }

    pub async fn endpoint_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.endpoints.len()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read().await;
        StatusSnapshot {
            endpoints: inner
                .endpoints
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            log: inner.log.iter().cloned().collect(),
        }
    }
}
