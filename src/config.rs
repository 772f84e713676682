// 7.0 config.rs: all settings in one place. limits, risk, emergency thresholds, breakers, cadence.
// 7.1 every struct denies unknown fields so a typo fails at load, not at first use.

use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::circuit_breaker::{BreakerConfig, BreakerSetConfig};
use crate::decision::DecisionMatrix;
use crate::emergency::EmergencyThresholds;
use crate::limits::ProtectionLimits;
use crate::rate_limiter::RateLimitConfig;
use crate::risk::RiskParams;
use crate::types::Quote;

/// Environment variable holding the wallet the portfolio collaborator values.
pub const WALLET_ENV: &str = "SENTINEL_WALLET";

/** 7.2: loop cadence and concurrency */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CycleConfig {
    // Time between cycle starts
    pub interval_ms: u64,
    // Bound on every network collaborator call
    pub network_timeout_ms: u64,
    // Manual/batch trades allowed in flight at once
    pub max_parallel_trades: usize,
    // Audit events retained in memory
    pub max_events: usize,
    // How long cached token prices stay fresh
    pub price_cache_ttl_ms: i64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            network_timeout_ms: 10_000,
            max_parallel_trades: 4,
            max_events: 10_000,
            price_cache_ttl_ms: 30_000,
        }
    }
}

// The complete control loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SystemConfig {
    pub environment: Environment,
    // Never read from the file; filled from WALLET_ENV
    #[serde(skip)]
    pub wallet: Option<String>,
    pub limits: ProtectionLimits,
    pub risk: RiskParams,
    pub emergency: EmergencyThresholds,
    pub breakers: BreakerSetConfig,
    pub rate_limit: RateLimitConfig,
    pub cycle: CycleConfig,
    pub decision: DecisionMatrix,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            wallet: None,
            limits: ProtectionLimits::default(),
            risk: RiskParams::default(),
            emergency: EmergencyThresholds::default(),
            breakers: BreakerSetConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cycle: CycleConfig::default(),
            decision: DecisionMatrix::default(),
        }
    }
}

impl SystemConfig {
    // Testnet: same shape as development, shorter breaker cooldowns
    pub fn testnet() -> Self {
        let mut config = Self::default();
        config.environment = Environment::Testnet;
        config.breakers.quote.timeout_ms = 30_000;
        config.breakers.swap.timeout_ms = 60_000;
        config
    }

    // Mainnet: conservative sizing and tighter emergency thresholds
    pub fn mainnet_conservative() -> Self {
        let mut config = Self::default();
        config.environment = Environment::Mainnet;
        config.limits.max_position_size = Quote::new(dec!(500));
        config.limits.max_daily_volume = Quote::new(dec!(5000));
        config.limits.max_concentration_pct = dec!(0.20);
        config.limits.max_slippage_tolerance = dec!(0.02);
        config.emergency.daily_loss_pct = dec!(0.10);
        config.emergency.critical_total_loss_pct = dec!(0.30);
        config.breakers.swap = BreakerConfig::new(2, 3, 300_000, 300_000);
        config.cycle.max_parallel_trades = 2;
        config
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SystemConfig = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Fill credentials from the process environment.
    pub fn with_env_credentials(mut self) -> Self {
        if let Ok(wallet) = std::env::var(WALLET_ENV) {
            let wallet = wallet.trim().to_string();
            if !wallet.is_empty() {
                self.wallet = Some(wallet);
            }
        }
        self
    }

    /// Wallet to value, falling back to a placeholder only in development.
    pub fn require_wallet(&self) -> Result<String, ConfigError> {
        match (&self.wallet, self.environment) {
            (Some(wallet), _) => Ok(wallet.clone()),
            (None, Environment::Development) => Ok("dev-wallet".to_string()),
            (None, _) => Err(ConfigError::MissingCredential(WALLET_ENV.to_string())),
        }
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits
            .validate()
            .map_err(|reason| ConfigError::InvalidLimits { reason })?;

        self.risk.validate().map_err(|reason| ConfigError::InvalidRisk { reason })?;

        self.emergency
            .validate()
            .map_err(|reason| ConfigError::InvalidEmergency { reason })?;

        for (name, breaker) in [
            ("health", &self.breakers.health),
            ("quote", &self.breakers.quote),
            ("swap", &self.breakers.swap),
        ] {
            breaker.validate().map_err(|reason| ConfigError::InvalidBreaker {
                reason: format!("{}: {}", name, reason),
            })?;
        }

        self.rate_limit
            .validate()
            .map_err(|reason| ConfigError::InvalidRateLimit { reason })?;

        if self.cycle.interval_ms == 0 || self.cycle.network_timeout_ms == 0 {
            return Err(ConfigError::InvalidCycle {
                reason: "interval and network timeout must be positive".to_string(),
            });
        }
        if self.cycle.max_parallel_trades == 0 || self.cycle.max_events == 0 {
            return Err(ConfigError::InvalidCycle {
                reason: "parallelism cap and event retention must be at least 1".to_string(),
            });
        }
        if self.cycle.price_cache_ttl_ms < 0 {
            return Err(ConfigError::InvalidCycle {
                reason: "price cache ttl cannot be negative".to_string(),
            });
        }

        self.decision
            .validate()
            .map_err(|reason| ConfigError::InvalidDecision { reason })?;

        // the gate's concentration cap should not exceed the emergency trigger
        if self.limits.max_concentration_pct > self.emergency.concentration_pct {
            return Err(ConfigError::InvalidLimits {
                reason: "max_concentration_pct above the emergency concentration threshold".to_string(),
            });
        }

        Ok(())
    }
}

// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid limits: {reason}")]
    InvalidLimits { reason: String },

    #[error("invalid risk params: {reason}")]
    InvalidRisk { reason: String },

    #[error("invalid emergency thresholds: {reason}")]
    InvalidEmergency { reason: String },

    #[error("invalid breaker config: {reason}")]
    InvalidBreaker { reason: String },

    #[error("invalid rate limit: {reason}")]
    InvalidRateLimit { reason: String },

    #[error("invalid cycle config: {reason}")]
    InvalidCycle { reason: String },

    #[error("invalid decision matrix: {reason}")]
    InvalidDecision { reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to read config: {0}")]
    Io(String),

    #[error("missing required credential {0}")]
    MissingCredential(String),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn config(&self) -> SystemConfig {
        match self {
            Environment::Development => SystemConfig::default(),
            Environment::Testnet => SystemConfig::testnet(),
            Environment::Mainnet => SystemConfig::mainnet_conservative(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(SystemConfig::default().validate().is_ok());
    }

    #[test]
    fn test_environment_presets() {
        assert!(Environment::Development.config().validate().is_ok());
        assert!(Environment::Testnet.config().validate().is_ok());
        assert!(Environment::Mainnet.config().validate().is_ok());
        assert_eq!(Environment::Mainnet.config().breakers.swap.failure_threshold, 2);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            environment = "testnet"

            [limits]
            max_position_size = "50"

            [cycle]
            interval_ms = 1000
        "#;
        let config = SystemConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.environment, Environment::Testnet);
        assert_eq!(config.limits.max_position_size, Quote::new(dec!(50)));
        assert_eq!(config.cycle.interval_ms, 1000);
        assert_eq!(config.risk, RiskParams::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = r#"
            [limits]
            max_positon_size = "50"
        "#;
        assert!(matches!(SystemConfig::from_toml_str(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = SystemConfig::default();
        config.cycle.max_parallel_trades = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCycle { .. })));

        let mut config = SystemConfig::default();
        config.breakers.swap.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBreaker { .. })));

        let mut config = SystemConfig::default();
        config.limits.max_slippage_tolerance = dec!(0.9);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLimits { .. })));
    }

    #[test]
    fn test_wallet_required_outside_development() {
        let dev = SystemConfig::default();
        assert!(dev.require_wallet().is_ok());

        let main = SystemConfig::mainnet_conservative();
        assert_eq!(
            main.require_wallet(),
            Err(ConfigError::MissingCredential(WALLET_ENV.to_string()))
        );

        let mut main = main;
        main.wallet = Some("0xabc".to_string());
        assert_eq!(main.require_wallet().unwrap(), "0xabc");
    }

    #[test]
    fn test_config_serialization() {
        let config = SystemConfig::mainnet_conservative();
        let json = serde_json::to_string(&config).unwrap();
        let back: SystemConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.limits, config.limits);
        assert_eq!(back.wallet, None);
    }
}
