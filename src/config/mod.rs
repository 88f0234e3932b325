use alloy::primitives::Address;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::pool::PoolId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint - env POOLSYNC_RPC_URL
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Prediction pool contract address (hex) - env POOLSYNC_POOL_CONTRACT
    #[serde(default)]
    pub pool_contract: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// REST API base URL - env POOLSYNC_BACKEND_URL
    #[serde(default)]
    pub api_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    /// Activity websocket URL - env POOLSYNC_WS_URL
    #[serde(default)]
    pub ws_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadSource {
    #[default]
    Rpc,
    Backend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub source: ReadSource,
    /// How long a contract read stays fresh.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default = "default_activity_ring_size")]
    pub activity_ring_size: usize,
    /// Delivery ids seen within this window are dropped as redeliveries.
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Tracked pool ids.
    #[serde(default)]
    pub pool_ids: Vec<PoolId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl_ms() -> u64 {
    30_000
}
fn default_refresh_interval_ms() -> u64 {
    30_000
}
fn default_activity_ring_size() -> usize {
    50
}
fn default_dedup_window_ms() -> u64 {
    60_000
}
fn default_stale_after_ms() -> u64 {
    90_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            pool_contract: String::new(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            enabled: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: ReadSource::default(),
            cache_ttl_ms: default_cache_ttl_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            activity_ring_size: default_activity_ring_size(),
            dedup_window_ms: default_dedup_window_ms(),
            stale_after_ms: default_stale_after_ms(),
            pool_ids: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl SyncConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl LiveConfig {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.ws_url.is_empty()
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment variables (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("POOLSYNC_RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Some(address) = lookup("POOLSYNC_POOL_CONTRACT") {
            self.chain.pool_contract = address;
        }
        if let Some(url) = lookup("POOLSYNC_BACKEND_URL") {
            self.backend.api_url = url;
        }
        if let Some(url) = lookup("POOLSYNC_WS_URL") {
            self.live.ws_url = url;
        }
    }

    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        Address::from_str(self.chain.pool_contract.trim()).map_err(|e| {
            ConfigError::Invalid(format!(
                "chain.pool_contract {:?}: {e}",
                self.chain.pool_contract
            ))
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.cache_ttl_ms == 0 {
            return Err(ConfigError::Invalid("sync.cache_ttl_ms must be non-zero".into()));
        }
        if self.sync.refresh_interval_ms == 0 {
            return Err(ConfigError::Invalid("sync.refresh_interval_ms must be non-zero".into()));
        }
        match self.sync.source {
            ReadSource::Rpc => {
                self.contract_address()?;
                url::Url::parse(&self.chain.rpc_url)
                    .map_err(|e| ConfigError::Invalid(format!("chain.rpc_url: {e}")))?;
            }
            ReadSource::Backend => {
                if self.backend.api_url.is_empty() {
                    return Err(ConfigError::Invalid(
                        "sync.source = \"backend\" requires backend.api_url".into(),
                    ));
                }
                url::Url::parse(&self.backend.api_url)
                    .map_err(|e| ConfigError::Invalid(format!("backend.api_url: {e}")))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::parse(&format!("[chain]\npool_contract = \"{CONTRACT}\"\n")).unwrap();
        assert_eq!(config.sync.cache_ttl_ms, 30_000);
        assert_eq!(config.sync.refresh_interval_ms, 30_000);
        assert_eq!(config.sync.activity_ring_size, 50);
        assert_eq!(config.sync.source, ReadSource::Rpc);
        assert!(config.live.enabled);
        assert!(!config.live.is_active());
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_full_file() {
        let config = Config::parse(
            r#"
            [backend]
            api_url = "https://api.example.com"
            request_timeout_ms = 2500

            [live]
            ws_url = "wss://live.example.com/ws"

            [sync]
            source = "backend"
            cache_ttl_ms = 5000
            pool_ids = [1, "2", " 3 "]

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.source, ReadSource::Backend);
        assert_eq!(config.sync.cache_ttl(), Duration::from_secs(5));
        assert_eq!(config.backend.request_timeout(), Duration::from_millis(2500));
        assert_eq!(
            config.sync.pool_ids,
            vec![PoolId::from(1), PoolId::from(2), PoolId::from(3)]
        );
        assert!(config.live.is_active());
        assert!(config.logging.json);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "POOLSYNC_RPC_URL" => Some("http://node:8545".to_string()),
            "POOLSYNC_POOL_CONTRACT" => Some(CONTRACT.to_string()),
            "POOLSYNC_WS_URL" => Some("ws://live".to_string()),
            _ => None,
        });
        assert_eq!(config.chain.rpc_url, "http://node:8545");
        assert_eq!(config.live.ws_url, "ws://live");
        assert!(config.backend.api_url.is_empty());
        assert!(config.contract_address().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.chain.pool_contract = CONTRACT.to_string();
        config.validate().unwrap();

        config.sync.cache_ttl_ms = 0;
        assert!(config.validate().is_err());
        config.sync.cache_ttl_ms = 1;
        config.sync.refresh_interval_ms = 0;
        assert!(config.validate().is_err());
        config.sync.refresh_interval_ms = 1;

        config.sync.source = ReadSource::Backend;
        assert!(config.validate().is_err());
        config.backend.api_url = "https://api.example.com".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_source_rejected() {
        assert!(matches!(
            Config::parse("[sync]\nsource = \"carrier-pigeon\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
