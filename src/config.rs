use crate::error::{MarketError, Result};
use crate::retry::RetryPolicy;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "AGENT_MARKET";

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub discovery: DiscoveryConfig,
    pub settlement: SettlementConfig,
    pub oracle: OracleConfig,
    pub negotiation: NegotiationConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Endpoint advertised to discovery; defaults to `http://{host}:{port}`.
    pub public_endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub endpoint: String,
    pub capability: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub endpoint: String,
    pub timeout_seconds: u64,
    pub opening_balance: Decimal,
    pub record_retention_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OracleProvider {
    Rule,
    OpenAi,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct OracleConfig {
    pub provider: OracleProvider,
    pub model: String,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub max_rounds: u32,
    pub acceptance_threshold: Decimal,
    pub counter_floor: Decimal,
    pub min_acceptable_ratio: Decimal,
    pub anchor_ratio: Decimal,
    pub reservation_ttl_seconds: u64,
    /// Longest a reservation may stay locked for settlement before the seller reconciles it.
    pub settlement_ttl_seconds: u64,
    pub message_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            public_endpoint: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://listings.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            capability: "marketplace_seller".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8002".to_string(),
            timeout_seconds: 15,
            opening_balance: dec!(0),
            record_retention_seconds: 86_400,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: OracleProvider::Rule,
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_base: None,
            max_tokens: 400,
            temperature: 0.2,
            timeout_seconds: 20,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            acceptance_threshold: dec!(0.90),
            counter_floor: dec!(0.75),
            min_acceptable_ratio: dec!(0.80),
            anchor_ratio: dec!(0.90),
            reservation_ttl_seconds: 900,
            settlement_ttl_seconds: 1_800,
            message_timeout_seconds: 10,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            file: None,
        }
    }
}

impl NegotiationConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_seconds)
    }

    pub fn settlement_ttl(&self) -> Duration {
        Duration::from_secs(self.settlement_ttl_seconds)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_seconds)
    }
}

impl SettlementConfig {
    pub fn record_retention(&self) -> Duration {
        Duration::from_secs(self.record_retention_seconds)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::new(&path, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(MarketError::Config("Server port cannot be 0".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(MarketError::Config("Database URL cannot be empty".to_string()));
        }

        if self.discovery.capability.trim().is_empty() {
            return Err(MarketError::Config("Discovery capability cannot be empty".to_string()));
        }

        if self.oracle.provider == OracleProvider::OpenAi && self.oracle.model.is_empty() {
            return Err(MarketError::Config("Oracle model cannot be empty".to_string()));
        }

        let n = &self.negotiation;
        if n.max_rounds == 0 {
            return Err(MarketError::Config("max_rounds must be at least 1".to_string()));
        }
        for (name, ratio) in [
            ("acceptance_threshold", n.acceptance_threshold),
            ("counter_floor", n.counter_floor),
            ("min_acceptable_ratio", n.min_acceptable_ratio),
            ("anchor_ratio", n.anchor_ratio),
        ] {
            if ratio <= Decimal::ZERO || ratio > Decimal::ONE {
                return Err(MarketError::Config(format!("{} must be in (0, 1]", name)));
            }
        }
        if n.counter_floor > n.acceptance_threshold {
            return Err(MarketError::Config(
                "counter_floor cannot exceed acceptance_threshold".to_string(),
            ));
        }

        if n.settlement_ttl_seconds < n.reservation_ttl_seconds {
            return Err(MarketError::Config(
                "settlement_ttl_seconds cannot be shorter than reservation_ttl_seconds".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(MarketError::Config("retry.max_attempts must be at least 1".to_string()));
        }

        Ok(())
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn public_endpoint(&self) -> String {
        self.server
            .public_endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.get_server_address()))
    }

    pub fn get_oracle_api_key(&self) -> Option<&str> {
        self.oracle.api_key.as_deref()
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| MarketError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| MarketError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8001);
        assert_eq!(config.negotiation.max_rounds, 3);
        assert_eq!(config.negotiation.acceptance_threshold, dec!(0.90));
        assert_eq!(config.discovery.capability, "marketplace_seller");
        assert_eq!(config.oracle.provider, OracleProvider::Rule);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.negotiation.counter_floor = dec!(0.95);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.negotiation.max_rounds = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.negotiation.settlement_ttl_seconds = config.negotiation.reservation_ttl_seconds - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("toml");

        create_default_config_file(&path).unwrap();
        assert!(path.exists());

        let loaded_config = AppConfig::load(&path).unwrap();
        assert_eq!(loaded_config.server.port, 8001);
        assert_eq!(loaded_config.negotiation.anchor_ratio, dec!(0.90));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        use std::io::Write;
        writeln!(file, "[negotiation]\nmax_rounds = 5\n").unwrap();

        let loaded = AppConfig::load(file.path()).unwrap();
        assert_eq!(loaded.negotiation.max_rounds, 5);
        assert_eq!(loaded.negotiation.counter_floor, dec!(0.75));
        assert_eq!(loaded.logging.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let loaded = AppConfig::load("/nonexistent/agent-market.toml").unwrap();
        assert_eq!(loaded.retry.max_attempts, 3);
    }
}
