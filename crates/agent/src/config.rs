//! Agent configuration
//!
//! Loaded from an optional YAML file with `AGENT_`-prefixed environment
//! variables overriding individual paths (e.g. `AGENT_STORE__URL`).

use agent_lib::collector::CollectorSettings;
use agent_lib::endpoint::{Credentials, Endpoint};
use agent_lib::sink::StoreConfig;
use agent_lib::tags::Tags;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Time-series store the agent forwards to
    #[serde(default)]
    pub store: StoreSection,

    /// Client certificate the agent presents to https endpoints
    #[serde(default)]
    pub identity: IdentitySection,

    /// Cluster access for pod discovery
    #[serde(default)]
    pub kubernetes: KubernetesSection,

    /// Collection engine settings
    #[serde(default)]
    pub collector: CollectorSection,

    /// Telemetry emitter settings
    #[serde(default)]
    pub emitter: EmitterSection,

    /// Static endpoints collected regardless of discovery
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub ca_cert_file: String,
    #[serde(default = "default_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_batch_delay")]
    pub max_batch_delay: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            tenant: default_tenant(),
            credentials: Credentials::default(),
            ca_cert_file: String::new(),
            max_batch_size: default_batch_size(),
            max_batch_delay: default_batch_delay(),
        }
    }
}

impl StoreSection {
    pub fn store_config(&self) -> Result<StoreConfig> {
        let max_batch_delay = humantime::parse_duration(&self.max_batch_delay)
            .with_context(|| format!("invalid store batch delay [{}]", self.max_batch_delay))?;
        Ok(StoreConfig {
            url: self.url.clone(),
            default_tenant: self.tenant.clone(),
            credentials: self.credentials.clone(),
            ca_cert_file: self.ca_cert_file.clone(),
            max_batch_size: self.max_batch_size,
            max_batch_delay,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentitySection {
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub private_key_file: String,
    /// Extra root CA trusted when scraping https endpoints with a private
    /// issuer
    #[serde(default)]
    pub ca_cert_file: String,
}

impl IdentitySection {
    pub fn is_configured(&self) -> bool {
        !self.cert_file.is_empty() && !self.private_key_file.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesSection {
    /// Pod discovery can be turned off to collect static endpoints only
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API server URL; empty means the in-cluster endpoint
    #[serde(default)]
    pub master_url: String,
    /// Namespace the agent's own pod runs in (downward API); empty means
    /// the mounted service-account namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Name of the agent's own pod (downward API)
    #[serde(default = "default_pod_name")]
    pub pod_name: String,
    /// Bearer token; empty means the mounted service-account token
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub ca_cert_file: String,
    /// The node whose pods this agent watches (downward API)
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Pod volume name that opts a pod into scraping
    #[serde(default = "default_volume_name")]
    pub config_volume_name: String,
}

impl Default for KubernetesSection {
    fn default() -> Self {
        Self {
            enabled: true,
            master_url: String::new(),
            namespace: default_namespace(),
            pod_name: default_pod_name(),
            token: String::new(),
            ca_cert_file: String::new(),
            node_name: default_node_name(),
            config_volume_name: default_volume_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorSection {
    #[serde(default = "default_minimum_interval")]
    pub minimum_collection_interval: String,
    #[serde(default = "default_default_interval")]
    pub default_collection_interval: String,
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout: String,
    #[serde(default)]
    pub metric_id_prefix: String,
    /// Global tags, merged into every definition with highest precedence
    #[serde(default)]
    pub tags: Tags,
    /// Capacity of the outbound sink channels
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            minimum_collection_interval: default_minimum_interval(),
            default_collection_interval: default_default_interval(),
            scrape_timeout: default_scrape_timeout(),
            metric_id_prefix: String::new(),
            tags: Tags::new(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl CollectorSection {
    pub fn settings(&self) -> Result<CollectorSettings> {
        let minimum_collection_interval =
            humantime::parse_duration(&self.minimum_collection_interval).with_context(|| {
                format!(
                    "invalid minimum collection interval [{}]",
                    self.minimum_collection_interval
                )
            })?;
        let default_collection_interval =
            humantime::parse_duration(&self.default_collection_interval).with_context(|| {
                format!(
                    "invalid default collection interval [{}]",
                    self.default_collection_interval
                )
            })?;
        let scrape_timeout = humantime::parse_duration(&self.scrape_timeout)
            .with_context(|| format!("invalid scrape timeout [{}]", self.scrape_timeout))?;

        Ok(CollectorSettings {
            minimum_collection_interval,
            default_collection_interval,
            scrape_timeout,
            metric_id_prefix: self.metric_id_prefix.clone(),
            tags: self.tags.clone(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitterSection {
    #[serde(default = "default_emitter_address")]
    pub address: String,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default = "default_true")]
    pub status_enabled: bool,
    #[serde(default = "default_true")]
    pub health_enabled: bool,
    /// When set, /status requires basic auth
    #[serde(default)]
    pub status_credentials: Credentials,
}

impl Default for EmitterSection {
    fn default() -> Self {
        Self {
            address: default_emitter_address(),
            metrics_enabled: true,
            status_enabled: true,
            health_enabled: true,
            status_credentials: Credentials::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_delay() -> String {
    "5s".to_string()
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_default()
}

fn default_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_default()
}

fn default_pod_name() -> String {
    std::env::var("POD_NAME").unwrap_or_default()
}

fn default_volume_name() -> String {
    "metrics-agent".to_string()
}

fn default_minimum_interval() -> String {
    "10s".to_string()
}

fn default_default_interval() -> String {
    "5m".to_string()
}

fn default_scrape_timeout() -> String {
    "10s".to_string()
}

fn default_buffer_size() -> usize {
    1000
}

fn default_emitter_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl AgentConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let loaded = builder
            .add_source(config::Environment::with_prefix("AGENT").separator("__"))
            .build()
            .context("Failed to load configuration")?;

        loaded
            .try_deserialize()
            .context("Failed to parse configuration")
    }
}
