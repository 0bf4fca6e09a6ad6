// Configuration Management for the Trade-Cost Pipeline
// JSON file sections + environment overrides for venue credentials

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::FeeTier;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

/// Everything `IngestionPipeline::start` consumes. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Venue
    pub endpoint: String,
    pub symbol: String,
    /// Channel to subscribe after connecting. `None` for endpoints that stream on connect.
    pub channel: Option<String>,
    pub await_subscribe_ack: bool,
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,

    // Order parameters
    pub order_size: f64,
    pub fee_tier: FeeTier,

    // Metric engine
    pub cache_capacity: usize,
    pub fingerprint_depth: usize,
    /// Price rounding applied before fingerprinting. 0 keeps exact prices.
    pub tick_size: f64,
    pub retrain_every_updates: u64,
    pub retrain_interval_ms: u64,
    pub retrain_budget_ms: u64,
    pub model_window: usize,
    pub impact_eta: f64,
    pub impact_gamma: f64,
    pub default_volatility: f64,

    // Connection
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: f64,
    pub read_timeout_ms: u64,
    pub max_initial_attempts: Option<u32>,
    pub corrupt_burst_threshold: u32,

    // Reporting
    pub stats_log_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://ws.gomarket-cpp.goquant.io/ws/l2-orderbook/okx/BTC-USDT-SWAP".to_string(),
            symbol: "BTC-USDT-SWAP".to_string(),
            channel: None,
            await_subscribe_ack: false,
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: String::new(),
            order_size: 100.0,
            fee_tier: FeeTier::default(),
            cache_capacity: 256,
            fingerprint_depth: 20,
            tick_size: 0.0,
            retrain_every_updates: 100,
            retrain_interval_ms: 5_000,
            retrain_budget_ms: 5,
            model_window: 50,
            impact_eta: 0.1,
            impact_gamma: 0.3,
            default_volatility: 0.02,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_jitter: 0.1,
            read_timeout_ms: 10_000,
            max_initial_attempts: Some(5),
            corrupt_burst_threshold: 5,
            stats_log_interval: 100,
        }
    }
}

impl PipelineConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retrain_interval(&self) -> Duration {
        Duration::from_millis(self.retrain_interval_ms)
    }

    pub fn retrain_budget(&self) -> Duration {
        Duration::from_millis(self.retrain_budget_ms)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    /// Collect every violated constraint into a single validation error
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.endpoint.is_empty() {
            errors.push("endpoint must not be empty".to_string());
        }
        if self.symbol.is_empty() {
            errors.push("symbol must not be empty".to_string());
        }
        if !self.order_size.is_finite() || self.order_size <= 0.0 {
            errors.push(format!("order_size must be positive, got {}", self.order_size));
        }
        let rates = [self.fee_tier.maker_rate, self.fee_tier.taker_rate];
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            errors.push(format!("fee rates must be non-negative, got {}", self.fee_tier));
        }
        if self.fingerprint_depth == 0 {
            errors.push("fingerprint_depth must be at least 1".to_string());
        }
        if !self.tick_size.is_finite() || self.tick_size < 0.0 {
            errors.push(format!("tick_size must be >= 0, got {}", self.tick_size));
        }
        if self.model_window < 2 {
            errors.push("model_window must be at least 2".to_string());
        }
        if self.backoff_base_ms == 0 {
            errors.push("backoff_base_ms must be positive".to_string());
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            errors.push("backoff_cap_ms must be >= backoff_base_ms".to_string());
        }
        if !(0.0..0.5).contains(&self.backoff_jitter) {
            errors.push(format!("backoff_jitter must be in [0, 0.5), got {}", self.backoff_jitter));
        }
        if self.read_timeout_ms == 0 {
            errors.push("read_timeout_ms must be positive".to_string());
        }
        if self.max_initial_attempts == Some(0) {
            errors.push("max_initial_attempts must be at least 1 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub json_format: bool,
    pub console_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_format: false,
            console_output: true,
        }
    }
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    pipeline: Arc<RwLock<PipelineConfig>>,
    logging: Arc<RwLock<LoggingConfig>>,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self {
            pipeline: Arc::new(RwLock::new(PipelineConfig::default())),
            logging: Arc::new(RwLock::new(LoggingConfig::default())),
        };

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    /// Load configuration from JSON file
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;

        if let Some(pipeline_data) = config_data.get("pipeline") {
            let pipeline = serde_json::from_value::<PipelineConfig>(pipeline_data.clone())?;
            *self.pipeline.write() = pipeline;
        }

        if let Some(logging_data) = config_data.get("logging") {
            let logging = serde_json::from_value::<LoggingConfig>(logging_data.clone())?;
            *self.logging.write() = logging;
        }

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Load endpoint override and credentials from environment variables
    pub fn load_from_env(&mut self) {
        let mut pipeline = self.pipeline.write();
        if let Ok(endpoint) = std::env::var("VENUE_ENDPOINT") {
            pipeline.endpoint = endpoint;
        }
        if let Ok(api_key) = std::env::var("VENUE_API_KEY") {
            pipeline.api_key = api_key;
        }
        if let Ok(api_secret) = std::env::var("VENUE_API_SECRET") {
            pipeline.api_secret = api_secret;
        }
        if let Ok(passphrase) = std::env::var("VENUE_PASSPHRASE") {
            pipeline.passphrase = passphrase;
        }
    }

    /// Save configuration to JSON file (excludes secrets)
    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let mut pipeline = self.pipeline.read().clone();
        pipeline.api_key.clear();
        pipeline.api_secret.clear();
        pipeline.passphrase.clear();

        let mut config_map = HashMap::new();
        config_map.insert("pipeline", serde_json::to_value(&pipeline)?);
        config_map.insert("logging", serde_json::to_value(&*self.logging.read())?);

        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&config_map)?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Validate configuration, logging each problem
    pub fn validate(&self) -> Result<bool, ConfigError> {
        match self.pipeline.read().validate() {
            Ok(()) => {
                info!("Configuration validated successfully");
                Ok(true)
            }
            Err(ConfigError::Validation(msg)) => {
                for error in msg.split("; ") {
                    warn!(error = %error, "Config validation error");
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        self.pipeline.read().clone()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.symbol, "BTC-USDT-SWAP");
        assert_eq!(pipeline.order_size, 100.0);
        assert_eq!(pipeline.read_timeout(), Duration::from_secs(10));
        assert_eq!(pipeline.max_initial_attempts, Some(5));
        assert!(!pipeline.has_credentials());
        assert!(pipeline.validate().is_ok());

        let logging = LoggingConfig::default();
        assert_eq!(logging.log_level, "INFO");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = serde_json::json!({ "symbol": "ETH-USDT-SWAP", "cache_capacity": 8 });
        let config: PipelineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.symbol, "ETH-USDT-SWAP");
        assert_eq!(config.cache_capacity, 8);
        assert_eq!(config.backoff_base_ms, 1_000);
        assert_eq!(config.fee_tier, FeeTier::default());
    }

    #[test]
    fn test_validation_collects_errors() {
        let config = PipelineConfig {
            order_size: -1.0,
            backoff_cap_ms: 10,
            backoff_base_ms: 100,
            backoff_jitter: 0.7,
            ..PipelineConfig::default()
        };
        match config.validate() {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("order_size"));
                assert!(msg.contains("backoff_cap_ms"));
                assert!(msg.contains("backoff_jitter"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_config_manager() {
        let manager = ConfigManager::new(None).unwrap();
        assert!(manager.validate().unwrap());
        assert_eq!(manager.logging().log_level, "INFO");
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let manager = ConfigManager::new(Some("/nonexistent/l2_tradecost.json")).unwrap();
        assert_eq!(manager.pipeline().symbol, "BTC-USDT-SWAP");
    }

    #[test]
    fn test_save_and_load_round_trip_strips_secrets() {
        let dir = std::env::temp_dir().join(format!("l2_tradecost_cfg_{}", std::process::id()));
        let path = dir.join("config.json");
        let path_str = path.to_str().unwrap();

        let manager = ConfigManager::new(None).unwrap();
        manager.pipeline.write().api_secret = "secret".to_string();
        manager.pipeline.write().order_size = 250.0;
        manager.save_to_file(path_str).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("\"secret\""));

        let mut reloaded = ConfigManager::new(None).unwrap();
        reloaded.load_from_file(path_str).unwrap();
        assert_eq!(reloaded.pipeline().order_size, 250.0);

        let _ = fs::remove_dir_all(&dir);
    }
}
