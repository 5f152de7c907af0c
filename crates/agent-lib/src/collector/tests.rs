//! Integration tests for the collection engine
//!
//! Adapters are exercised against local HTTP servers speaking the real wire
//! formats; the manager is exercised with mock collectors so timing and
//! isolation behavior can be observed without a network.

use crate::collector::{
    create_collector, CollectorManager, CollectorSettings, MetricsCollector,
};
use crate::endpoint::{parse_config_document, Endpoint};
use crate::models::{
    now_millis, CollectedMetric, Datapoint, EmittedSeries, MetricDefinition, MetricDetails,
    MetricType,
};
use crate::observability::AgentMetrics;
use crate::status::StatusRegistry;
use anyhow::Result;
use async_trait::async_trait;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn recv_batch<T>(rx: &mut mpsc::Receiver<Vec<T>>) -> Vec<T> {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a batch")
        .expect("channel closed")
}

fn endpoint_from_yaml(yaml: &str) -> Endpoint {
    serde_yaml::from_str(yaml).unwrap()
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

mod prometheus_adapter {
    use super::*;

    const EXPOSITION: &str = "# HELP foo A plain metric.\n\
# TYPE foo gauge\n\
foo 1.0\n\
# TYPE bar counter\n\
bar{k=\"a\"} 2.0\n\
bar{k=\"b\"} 3.0\n";

    async fn start_exposition_server() -> String {
        let app = Router::new().route(
            "/metrics",
            get(|| async {
                (
                    [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                    EXPOSITION,
                )
            }),
        );
        serve(app).await
    }

    #[tokio::test]
    async fn test_scrape_text_exposition() {
        let base = start_exposition_server().await;
        let endpoint = endpoint_from_yaml(&format!(
            "type: prometheus\nurl: {base}/metrics\ntenant: t1\n"
        ));
        let collector = create_collector(
            "test|prom".to_string(),
            endpoint,
            None,
            HashMap::new(),
            None,
            Duration::from_secs(2),
        )
        .unwrap();

        let collected = collector.collect_metrics().await.unwrap();
        assert_eq!(collected.len(), 2);

        assert_eq!(collected[0].name, "foo");
        assert_eq!(collected[0].metric_type, Some(MetricType::Gauge));
        assert_eq!(collected[0].tenant.as_deref(), Some("t1"));
        assert_eq!(collected[0].data.len(), 1);

        assert_eq!(collected[1].name, "bar");
        assert_eq!(collected[1].metric_type, Some(MetricType::Counter));
        assert_eq!(collected[1].data.len(), 2);
        assert_eq!(collected[1].data[0].tags["k"], "a");
    }

    #[tokio::test]
    async fn test_metric_details_from_help_lines() {
        let base = start_exposition_server().await;
        let endpoint = endpoint_from_yaml(&format!("type: prometheus\nurl: {base}/metrics\n"));
        let collector = create_collector(
            "test|prom".to_string(),
            endpoint,
            None,
            HashMap::new(),
            None,
            Duration::from_secs(2),
        )
        .unwrap();

        let details = collector
            .collect_metric_details(&["foo".to_string()])
            .await
            .unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].description, "A plain metric.");
        assert_eq!(details[0].metric_type, Some(MetricType::Gauge));
    }

    #[tokio::test]
    async fn test_bearer_token_attached() {
        let app = Router::new().route(
            "/metrics",
            get(|headers: axum::http::HeaderMap| async move {
                if headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    != Some("Bearer secret-token")
                {
                    return (axum::http::StatusCode::UNAUTHORIZED, "".to_string());
                }
                (axum::http::StatusCode::OK, "ok_metric 1\n".to_string())
            }),
        );
        let base = serve(app).await;

        let authed = endpoint_from_yaml(&format!(
            "type: prometheus\nurl: {base}/metrics\ncredentials:\n  token: secret-token\n"
        ));
        let collector = create_collector(
            "test|prom".to_string(),
            authed,
            None,
            HashMap::new(),
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(collector.collect_metrics().await.unwrap().len(), 1);

        let unauthed = endpoint_from_yaml(&format!("type: prometheus\nurl: {base}/metrics\n"));
        let collector = create_collector(
            "test|prom2".to_string(),
            unauthed,
            None,
            HashMap::new(),
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(collector.collect_metrics().await.is_err());
    }

    #[tokio::test]
    async fn test_non_200_fails_the_scrape() {
        let app = Router::new().route(
            "/metrics",
            get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = serve(app).await;

        let endpoint = endpoint_from_yaml(&format!("type: prometheus\nurl: {base}/metrics\n"));
        let collector = create_collector(
            "test|prom".to_string(),
            endpoint,
            None,
            HashMap::new(),
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(collector.collect_metrics().await.is_err());
    }
}

mod jolokia_adapter {
    use super::*;
    use serde_json::{json, Value};

    /// Answers bulk reads for a Memory mbean; anything else gets a 404
    /// entry.
    async fn bulk_read(Json(requests): Json<Vec<Value>>) -> Json<Vec<Value>> {
        let responses = requests
            .iter()
            .map(|request| {
                let mbean = request["mbean"].as_str().unwrap_or_default();
                let path = request["path"].as_str();
                match (mbean, path) {
                    ("java.lang:type=Memory", Some("used")) => json!({
                        "request": request,
                        "value": 1234,
                        "status": 200,
                    }),
                    ("java.lang:type=Threading", None) => json!({
                        "request": request,
                        "value": "not-a-number",
                        "status": 200,
                    }),
                    _ => json!({
                        "request": request,
                        "error": "no such mbean",
                        "status": 404,
                    }),
                }
            })
            .collect();
        Json(responses)
    }

    fn jolokia_endpoint(base: &str) -> Endpoint {
        endpoint_from_yaml(&format!(
            r#"
type: jolokia
url: {base}/jolokia
metrics:
  - name: java.lang:type=Memory#HeapMemoryUsage#used
  - name: java.lang:type=Threading#ThreadCount
  - name: java.lang:type=Missing#Nothing
"#
        ))
    }

    #[tokio::test]
    async fn test_bulk_read_with_partial_failures() {
        let base = serve(Router::new().route("/jolokia", post(bulk_read))).await;
        let collector = create_collector(
            "test|jolokia".to_string(),
            jolokia_endpoint(&base),
            None,
            HashMap::new(),
            None,
            Duration::from_secs(2),
        )
        .unwrap();

        // the non-numeric and missing entries drop; the cycle still
        // succeeds with the readable one
        let collected = collector.collect_metrics().await.unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].name, "java.lang:type=Memory#HeapMemoryUsage#used");
        assert_eq!(collected[0].data.len(), 1);
        assert_eq!(collected[0].data[0].value, 1234.0);
        // no type declared in config, none from the protocol
        assert_eq!(collected[0].metric_type, None);
    }

    #[tokio::test]
    async fn test_details_are_empty() {
        let base = serve(Router::new().route("/jolokia", post(bulk_read))).await;
        let collector = create_collector(
            "test|jolokia".to_string(),
            jolokia_endpoint(&base),
            None,
            HashMap::new(),
            None,
            Duration::from_secs(2),
        )
        .unwrap();

        let details = collector
            .collect_metric_details(&["java.lang:type=Memory#HeapMemoryUsage#used".to_string()])
            .await
            .unwrap();
        assert!(details.is_empty());
    }
}

mod manager {
    use super::*;

    /// Scriptable collector standing in for a protocol adapter.
    struct MockCollector {
        id: String,
        endpoint: Endpoint,
        env: HashMap<String, String>,
        scrapes: AtomicUsize,
        fail: bool,
    }

    impl MockCollector {
        fn new(id: &str) -> Arc<Self> {
            Self::with_endpoint(id, "type: prometheus\nport: 9090\n")
        }

        fn with_endpoint(id: &str, yaml: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                endpoint: endpoint_from_yaml(yaml),
                env: HashMap::new(),
                scrapes: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                endpoint: endpoint_from_yaml("type: prometheus\nport: 9090\n"),
                env: HashMap::new(),
                scrapes: AtomicUsize::new(0),
                fail: true,
            })
        }

        fn scrape_count(&self) -> usize {
            self.scrapes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetricsCollector for MockCollector {
        async fn collect_metrics(&self) -> Result<Vec<CollectedMetric>> {
            self.scrapes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("mock scrape failure");
            }
            Ok(vec![CollectedMetric {
                name: "mock_metric".to_string(),
                metric_type: Some(MetricType::Gauge),
                tenant: None,
                data: vec![Datapoint::new(now_millis(), 1.0)],
            }])
        }

        async fn collect_metric_details(&self, _names: &[String]) -> Result<Vec<MetricDetails>> {
            Ok(Vec::new())
        }

        fn id(&self) -> &str {
            &self.id
        }

        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        fn additional_environment(&self) -> &HashMap<String, String> {
            &self.env
        }
    }

    fn fast_settings() -> CollectorSettings {
        CollectorSettings {
            minimum_collection_interval: Duration::from_millis(10),
            default_collection_interval: Duration::from_millis(10),
            scrape_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[allow(clippy::type_complexity)]
    fn new_manager(
        settings: CollectorSettings,
    ) -> (
        Arc<CollectorManager>,
        mpsc::Receiver<Vec<EmittedSeries>>,
        mpsc::Receiver<Vec<MetricDefinition>>,
        StatusRegistry,
    ) {
        let (metrics_tx, metrics_rx) = mpsc::channel(64);
        let (defs_tx, defs_rx) = mpsc::channel(64);
        let status = StatusRegistry::new();
        let manager = Arc::new(CollectorManager::new(
            settings,
            metrics_tx,
            defs_tx,
            status.clone(),
            AgentMetrics::new(),
        ));
        (manager, metrics_rx, defs_rx, status)
    }

    #[tokio::test]
    async fn test_scheduler_emits_and_declares_once() {
        let (manager, mut metrics_rx, mut defs_rx, status) = new_manager(fast_settings());
        let collector = MockCollector::new("t|scheduler");
        manager.start_collecting(collector.clone()).await;

        // first cycle emits the series and its definition
        let batch = recv_batch(&mut metrics_rx).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "mock_metric");

        let defs = recv_batch(&mut defs_rx).await;
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id, "mock_metric");

        // later cycles keep emitting but never redeclare
        let _ = recv_batch(&mut metrics_rx).await;
        let _ = recv_batch(&mut metrics_rx).await;
        assert!(defs_rx.try_recv().is_err());

        let state = status.endpoint("t|scheduler").await.unwrap();
        assert!(state.starts_with("OK."), "unexpected status: {state}");

        manager.stop_collecting_all().await;
    }

    #[tokio::test]
    async fn test_failing_endpoint_is_isolated() {
        let (manager, mut metrics_rx, _defs_rx, status) = new_manager(fast_settings());
        let sick = MockCollector::failing("t|sick");
        let healthy = MockCollector::new("t|healthy");

        manager.start_collecting(sick.clone()).await;
        manager.start_collecting(healthy.clone()).await;

        // the healthy endpoint emits even while the sick one keeps erroring
        let batch = recv_batch(&mut metrics_rx).await;
        assert_eq!(batch[0].id, "mock_metric");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sick.scrape_count() > 0);
        let state = status.endpoint("t|sick").await.unwrap();
        assert!(state.contains("Failed to collect"), "unexpected status: {state}");

        manager.stop_collecting_all().await;
    }

    #[tokio::test]
    async fn test_replacement_supersedes_previous_scheduler() {
        let (manager, mut metrics_rx, _defs_rx, _status) = new_manager(fast_settings());
        let first = MockCollector::new("t|replace");
        manager.start_collecting(first.clone()).await;
        let _ = recv_batch(&mut metrics_rx).await;

        let second = MockCollector::new("t|replace");
        manager.start_collecting(second.clone()).await;
        assert_eq!(manager.active_count().await, 1);

        // once the replacement is in, the first collector stops scraping
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first_count = first.scrape_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(first.scrape_count(), first_count);
        assert!(second.scrape_count() > 0);

        manager.stop_collecting_all().await;
    }

    #[tokio::test]
    async fn test_stop_collecting_clears_status() {
        let (manager, mut metrics_rx, _defs_rx, status) = new_manager(fast_settings());
        let collector = MockCollector::new("t|stop");
        manager.start_collecting(collector.clone()).await;
        let _ = recv_batch(&mut metrics_rx).await;
        assert!(status.endpoint("t|stop").await.is_some());

        manager.stop_collecting("t|stop").await;
        assert!(!manager.is_collecting("t|stop").await);
        assert!(status.endpoint("t|stop").await.is_none());

        let count = collector.scrape_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(collector.scrape_count(), count);
    }

    #[tokio::test]
    async fn test_disabled_endpoint_never_starts() {
        let (manager, _metrics_rx, _defs_rx, status) = new_manager(fast_settings());
        let collector =
            MockCollector::with_endpoint("t|disabled", "type: prometheus\nport: 9090\nenabled: false\n");
        manager.start_collecting(collector.clone()).await;

        assert!(!manager.is_collecting("t|disabled").await);
        let state = status.endpoint("t|disabled").await.unwrap();
        assert!(state.contains("disabled"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(collector.scrape_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let (manager, _metrics_rx, _defs_rx, status) = new_manager(fast_settings());
        manager.start_collecting(MockCollector::new("t|a")).await;
        manager.start_collecting(MockCollector::new("t|b")).await;
        assert_eq!(manager.active_count().await, 2);

        manager.stop_collecting_all().await;
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(status.endpoint_count().await, 0);
    }

    #[tokio::test]
    async fn test_interval_clamped_to_minimum() {
        let settings = CollectorSettings {
            minimum_collection_interval: Duration::from_secs(30),
            default_collection_interval: Duration::from_secs(300),
            ..Default::default()
        };
        let (manager, _metrics_rx, _defs_rx, _status) = new_manager(settings);

        let below_minimum =
            endpoint_from_yaml("type: prometheus\nport: 9090\ncollection_interval: 1s\n");
        assert_eq!(
            manager.effective_interval(&below_minimum, "t|clamp"),
            Duration::from_secs(30)
        );

        let above_minimum =
            endpoint_from_yaml("type: prometheus\nport: 9090\ncollection_interval: 2m\n");
        assert_eq!(
            manager.effective_interval(&above_minimum, "t|clamp"),
            Duration::from_secs(120)
        );

        let unparseable =
            endpoint_from_yaml("type: prometheus\nport: 9090\ncollection_interval: soon\n");
        assert_eq!(
            manager.effective_interval(&unparseable, "t|clamp"),
            Duration::from_secs(300)
        );

        let unset = endpoint_from_yaml("type: prometheus\nport: 9090\n");
        assert_eq!(
            manager.effective_interval(&unset, "t|clamp"),
            Duration::from_secs(300)
        );
    }
}

mod end_to_end {
    use super::*;

    /// Scenario: a Prometheus endpoint declaring [foo, bar] where bar
    /// splits by its `k` label, driven through the real adapter, scheduler,
    /// and expansion pipeline.
    #[tokio::test]
    async fn test_label_split_through_the_full_pipeline() {
        let app = Router::new().route(
            "/metrics",
            get(|| async {
                (
                    [("content-type", "text/plain; version=0.0.4")],
                    "foo 1.0\nbar{k=\"a\"} 2.0\nbar{k=\"b\"} 3.0\nbaz 9.0\n",
                )
            }),
        );
        let base = serve(app).await;

        let endpoint = endpoint_from_yaml(&format!(
            r#"
type: prometheus
url: {base}/metrics
collection_interval: 20ms
metrics:
  - name: foo
    type: gauge
  - name: bar
    type: gauge
"#
        ));

        let settings = CollectorSettings {
            minimum_collection_interval: Duration::from_millis(10),
            default_collection_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (metrics_tx, mut metrics_rx) = mpsc::channel(64);
        let (defs_tx, mut defs_rx) = mpsc::channel(64);
        let manager = CollectorManager::new(
            settings,
            metrics_tx,
            defs_tx,
            StatusRegistry::new(),
            AgentMetrics::new(),
        );

        let collector = create_collector(
            "t|e2e".to_string(),
            endpoint,
            None,
            HashMap::new(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        manager.start_collecting(collector).await;

        let batch = recv_batch(&mut metrics_rx).await;
        let mut ids: Vec<&str> = batch.iter().map(|s| s.id.as_str()).collect();
        ids.sort();
        // baz was scraped but not declared, so it is dropped; bar splits
        // under the deterministic sorted-key template
        assert_eq!(ids, vec!["bar{k=a}", "bar{k=b}", "foo"]);

        let defs = recv_batch(&mut defs_rx).await;
        let mut def_ids: Vec<&str> = defs.iter().map(|d| d.id.as_str()).collect();
        def_ids.sort();
        assert_eq!(def_ids, vec!["bar{k=a}", "bar{k=b}", "foo"]);

        // subsequent cycles redeclare nothing
        let _ = recv_batch(&mut metrics_rx).await;
        assert!(defs_rx.try_recv().is_err());

        manager.stop_collecting_all().await;
    }

    /// Scenario: an explicit id template rewrites the split ids.
    #[tokio::test]
    async fn test_explicit_template_through_the_full_pipeline() {
        let app = Router::new().route(
            "/metrics",
            get(|| async {
                (
                    [("content-type", "text/plain; version=0.0.4")],
                    "bar{k=\"a\"} 2.0\nbar{k=\"b\"} 3.0\n",
                )
            }),
        );
        let base = serve(app).await;

        let endpoint = endpoint_from_yaml(&format!(
            r#"
type: prometheus
url: {base}/metrics
collection_interval: 20ms
metrics:
  - name: bar
    id: bar_${{k}}
    type: gauge
"#
        ));

        let settings = CollectorSettings {
            minimum_collection_interval: Duration::from_millis(10),
            default_collection_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (metrics_tx, mut metrics_rx) = mpsc::channel(64);
        let (defs_tx, _defs_rx) = mpsc::channel(64);
        let manager = CollectorManager::new(
            settings,
            metrics_tx,
            defs_tx,
            StatusRegistry::new(),
            AgentMetrics::new(),
        );

        let collector = create_collector(
            "t|e2e2".to_string(),
            endpoint,
            None,
            HashMap::new(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        manager.start_collecting(collector).await;

        let batch = recv_batch(&mut metrics_rx).await;
        let mut ids: Vec<&str> = batch.iter().map(|s| s.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["bar_a", "bar_b"]);

        manager.stop_collecting_all().await;
    }

    /// Scenario: a Jolokia metric with no declared type is defined as a
    /// gauge.
    #[tokio::test]
    async fn test_jolokia_definition_defaults_to_gauge() {
        use serde_json::{json, Value};

        let app = Router::new().route(
            "/jolokia",
            post(|Json(requests): Json<Vec<Value>>| async move {
                let responses: Vec<Value> = requests
                    .iter()
                    .map(|request| json!({"request": request, "value": 1234, "status": 200}))
                    .collect();
                Json(responses)
            }),
        );
        let base = serve(app).await;

        let endpoint = endpoint_from_yaml(&format!(
            r#"
type: jolokia
url: {base}/jolokia
collection_interval: 20ms
metrics:
  - name: java.lang:type=Memory#HeapMemoryUsage#used
"#
        ));

        let settings = CollectorSettings {
            minimum_collection_interval: Duration::from_millis(10),
            default_collection_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (metrics_tx, mut metrics_rx) = mpsc::channel(64);
        let (defs_tx, mut defs_rx) = mpsc::channel(64);
        let manager = CollectorManager::new(
            settings,
            metrics_tx,
            defs_tx,
            StatusRegistry::new(),
            AgentMetrics::new(),
        );

        let collector = create_collector(
            "t|e2e3".to_string(),
            endpoint,
            None,
            HashMap::new(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        manager.start_collecting(collector).await;

        let batch = recv_batch(&mut metrics_rx).await;
        assert_eq!(batch[0].data[0].value, 1234.0);

        let defs = recv_batch(&mut defs_rx).await;
        assert_eq!(defs[0].metric_type, MetricType::Gauge);

        manager.stop_collecting_all().await;
    }
}

#[tokio::test]
async fn test_static_endpoints_skip_bad_and_start_good() {
    let app = Router::new().route(
        "/metrics",
        get(|| async {
            (
                [("content-type", "text/plain; version=0.0.4")],
                "up 1\n",
            )
        }),
    );
    let base = serve(app).await;

    let doc = parse_config_document(&format!(
        r#"
endpoints:
  - type: prometheus
    url: {base}/metrics
    collection_interval: 20ms
  - type: prometheus
    url: "::not a url::"
"#
    ))
    .unwrap();

    let settings = CollectorSettings {
        minimum_collection_interval: Duration::from_millis(10),
        default_collection_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let (metrics_tx, mut metrics_rx) = mpsc::channel(64);
    let (defs_tx, _defs_rx) = mpsc::channel(64);
    let status = StatusRegistry::new();
    let manager = CollectorManager::new(
        settings,
        metrics_tx,
        defs_tx,
        status.clone(),
        AgentMetrics::new(),
    );

    manager.start_collecting_endpoints(&doc.endpoints, None).await;
    assert_eq!(manager.active_count().await, 1);

    // the bad endpoint is reported, the good one emits
    let bad_id = "X|X|prometheus|::not a url::";
    assert!(status.endpoint(bad_id).await.unwrap().contains("Will not start"));

    let batch = recv_batch(&mut metrics_rx).await;
    assert_eq!(batch[0].id, "up");

    manager.stop_collecting_all().await;
}
