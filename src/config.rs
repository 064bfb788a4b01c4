use crate::error::BrokerResult;
use crate::session::CoordinatorConfig;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Approval web API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Public URL users are sent to for approval
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    3000
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
            base_url: default_base_url(),
        }
    }
}

/// Session store settings
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Lifetime of each stored field after its last write
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
    /// Period of the background eviction pass
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_entry_ttl_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: default_entry_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Approval wait settings
#[derive(Debug, Deserialize, Clone)]
pub struct ApprovalConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often the approval side re-reads the status while waiting
    #[serde(default = "default_outcome_poll_interval_ms")]
    pub outcome_poll_interval_ms: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_outcome_poll_interval_ms() -> u64 {
    300
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            outcome_poll_interval_ms: default_outcome_poll_interval_ms(),
        }
    }
}

/// Connection admission settings
#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    /// Bucket size, refilled over `interval_secs`
    #[serde(default = "default_tokens")]
    pub tokens: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sweep_min_ttl_secs")]
    pub sweep_min_ttl_secs: u64,
}

fn default_tokens() -> u32 {
    3
}

fn default_interval_secs() -> u64 {
    60
}

fn default_sweep_min_ttl_secs() -> u64 {
    300
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            tokens: default_tokens(),
            interval_secs: default_interval_secs(),
            sweep_min_ttl_secs: default_sweep_min_ttl_secs(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> BrokerResult<Self> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: PIPEBRIDGE_)
            // e.g., PIPEBRIDGE_WEB__BASE_URL, PIPEBRIDGE_APPROVAL__TIMEOUT_SECS
            .add_source(
                Environment::with_prefix("PIPEBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        Ok(config.reconciled())
    }

    /// Stored session fields must outlive the approval wait, or the pending
    /// marker lapses while the coordinator is still polling.
    pub fn reconciled(mut self) -> Self {
        if self.session.entry_ttl_secs < self.approval.timeout_secs {
            warn!(
                entry_ttl_secs = self.session.entry_ttl_secs,
                timeout_secs = self.approval.timeout_secs,
                "Session TTL shorter than approval timeout, raising it"
            );
            self.session.entry_ttl_secs = self.approval.timeout_secs;
        }
        self
    }

    /// Initialize the global config singleton
    pub fn init() -> BrokerResult<&'static Self> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            base_url: self.web.base_url.clone(),
            approval_timeout: Duration::from_secs(self.approval.timeout_secs),
            poll_interval: Duration::from_millis(self.approval.poll_interval_ms),
        }
    }
}

impl SessionConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl AdmissionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn sweep_min_ttl(&self) -> Duration {
        Duration::from_secs(self.sweep_min_ttl_secs)
    }
}
