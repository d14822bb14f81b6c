use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.outpost/config.toml`.
///
/// **Security**: This struct NEVER stores the shared secret. The secret is
/// read from the environment variable named by `general.secret_key_env`.
/// See [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load config from `~/.outpost/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        self.aggregation.validate()?;
        self.daemon.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".outpost")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("missing credential: env var `{0}` is not set")]
    MissingCredential(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name this host reports to the backend.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Public identifier sent alongside every sealed payload.
    #[serde(default)]
    pub public_key: String,
    /// Env var holding the shared secret (default: `OUTPOST_SECRET_KEY`).
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON logs instead of the human-readable format.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            public_key: String::new(),
            secret_key_env: default_secret_key_env(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_server_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
}
fn default_secret_key_env() -> String {
    "OUTPOST_SECRET_KEY".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Which adapters to bind and how they behave while disconnected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Adapter names to bind (`axon`, `websocket`).
    #[serde(default = "default_enabled_transports")]
    pub enabled: Vec<String>,
    /// Outbound queue capacity per adapter.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Logical endpoint map (`push`, `reverse`, `websocket`, ...).
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    /// Host resolved to decide whether the network is reachable.
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// A write that takes longer than this counts as a lost connection.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_transports(),
            queue_capacity: default_queue_capacity(),
            endpoints: BTreeMap::new(),
            probe_host: default_probe_host(),
            probe_delay_ms: default_probe_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            protocol_version: default_protocol_version(),
        }
    }
}

impl TransportConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "transport.queue_capacity must be greater than zero".into(),
            ));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "transport.write_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_enabled_transports() -> Vec<String> {
    vec!["websocket".into()]
}
fn default_queue_capacity() -> usize {
    500
}
fn default_probe_host() -> String {
    "google.com".into()
}
fn default_probe_delay_ms() -> u64 {
    2_000
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_write_timeout_ms() -> u64 {
    10_000
}
fn default_protocol_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_shipping_interval_secs")]
    pub shipping_interval_secs: u64,
    /// Quiet period after a process exit during which its rollup is withheld.
    #[serde(default = "default_learning_window_secs")]
    pub learning_window_secs: u64,
    /// Variances shipped per route, highest count first.
    #[serde(default = "default_top_variances")]
    pub top_variances: usize,
    #[serde(default = "default_ewma_tick_ms")]
    pub ewma_tick_ms: u64,
    #[serde(default = "default_ewma_period_ms")]
    pub ewma_period_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            shipping_interval_secs: default_shipping_interval_secs(),
            learning_window_secs: default_learning_window_secs(),
            top_variances: default_top_variances(),
            ewma_tick_ms: default_ewma_tick_ms(),
            ewma_period_ms: default_ewma_period_ms(),
        }
    }
}

impl AggregationConfig {
    pub fn learning_window(&self) -> Duration {
        Duration::from_secs(self.learning_window_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ewma_tick_ms == 0 || self.ewma_period_ms == 0 {
            return Err(ConfigError::Validation(
                "aggregation.ewma_tick_ms and ewma_period_ms must be non-zero".into(),
            ));
        }
        if self.shipping_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "aggregation.shipping_interval_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_shipping_interval_secs() -> u64 {
    30
}
fn default_learning_window_secs() -> u64 {
    15 * 60
}
fn default_top_variances() -> usize {
    5
}
fn default_ewma_tick_ms() -> u64 {
    5_000
}
fn default_ewma_period_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    /// How often the endpoint map is re-resolved and re-applied.
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,
    /// Log lines kept per process and attached to exceptions.
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
    /// How long a remote `startLogging` stays in effect.
    #[serde(default = "default_log_stream_ttl_secs")]
    pub log_stream_ttl_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval_secs(),
            verify_interval_secs: default_verify_interval_secs(),
            log_buffer_lines: default_log_buffer_lines(),
            log_stream_ttl_secs: default_log_stream_ttl_secs(),
        }
    }
}

impl DaemonConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.status_interval_secs == 0 || self.verify_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "daemon.status_interval_secs and verify_interval_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_status_interval_secs() -> u64 {
    5
}
fn default_verify_interval_secs() -> u64 {
    300
}
fn default_log_buffer_lines() -> usize {
    20
}
fn default_log_stream_ttl_secs() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// CredentialProvider
// ---------------------------------------------------------------------------

/// Resolves secrets from the environment at runtime.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read the shared secret from the env var named in the config.
    pub fn secret_key(general: &GeneralConfig) -> Result<String, ConfigError> {
        std::env::var(&general.secret_key_env)
            .map_err(|_| ConfigError::MissingCredential(general.secret_key_env.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
