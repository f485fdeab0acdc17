//! Engine configuration.
//!
//! Sections mirror the surfaces the engine recognizes (data center, trading,
//! engine, risk, global). Loading precedence, highest first: explicit caller
//! mutations -> environment variables -> TOML configuration file -> embedded
//! defaults. `AppConfig::load` applies the lower three; callers mutate the
//! returned struct for the top layer.

use std::env;
use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Data-center section: HTTP edge, cache, retry, breaker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataCenterConfig {
    /// Override the exchange base URL (testnets, mirrors).
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub enable_cache: bool,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub request_timeout_seconds: u64,
    /// Attempts per call, retryable failures only.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_delay_seconds: f64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_seconds: u64,
}

impl Default for DataCenterConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            api_secret: None,
            enable_cache: true,
            cache_ttl_seconds: 300,
            cache_max_entries: 1000,
            request_timeout_seconds: 30,
            max_retries: 3,
            retry_delay_seconds: 1.0,
            breaker_failure_threshold: 5,
            breaker_cooldown_seconds: 30,
        }
    }
}

/// Trading section: sizing, fees and margin parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub default_leverage: u32,
    /// Fraction of available cash committed as margin per open.
    pub default_position_size_pct: Decimal,
    pub taker_fee: Decimal,
    pub maker_fee: Decimal,
    /// Symmetric multiplicative fill adjustment.
    pub slippage: Decimal,
    pub maintenance_margin_ratio: Decimal,
    pub funding_rate_interval_seconds: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_leverage: 10,
            default_position_size_pct: dec!(0.1),
            taker_fee: dec!(0.0004),
            maker_fee: dec!(0.0002),
            slippage: dec!(0.0005),
            maintenance_margin_ratio: dec!(0.004),
            funding_rate_interval_seconds: 28_800,
        }
    }
}

/// Engine section: loader batching, prefetch and replay pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Bars per loader batch.
    pub batch_size: u32,
    /// Prefetch the next batch while the current one drains.
    pub preload_enabled: bool,
    /// Replay speed ceiling.
    pub max_speed: u32,
    /// Indicator specs precomputed for every tick, e.g. `["sma_20", "macd_12_26_9"]`.
    pub default_indicators: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            preload_enabled: true,
            max_speed: 999,
            default_indicators: Vec::new(),
        }
    }
}

/// Risk section: critical thresholds; warning tiers derive via `warning_ratio`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_daily_loss_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    /// Margin-locked share of wallet that halts new opens.
    pub max_total_position_pct: Decimal,
    pub warning_ratio: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: dec!(0.05),
            max_drawdown_pct: dec!(0.15),
            max_total_position_pct: dec!(0.8),
            warning_ratio: dec!(0.7),
        }
    }
}

/// Global section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Display timezone; the engine itself is UTC-only.
    pub timezone: String,
    pub log_level: String,
    pub debug: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            log_level: "info".to_string(),
            debug: false,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_center: DataCenterConfig,
    pub trading: TradingConfig,
    pub engine: EngineSettings,
    pub risk: RiskConfig,
    pub global: GlobalConfig,
}

impl AppConfig {
    /// Load defaults, then the TOML file (if any), then environment
    /// overrides. Validates before returning.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    EngineError::Config(format!("read {}: {e}", path.display()))
                })?;
                toml::from_str(&raw)
                    .map_err(|e| EngineError::Config(format!("parse {}: {e}", path.display())))?
            }
            None => AppConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment-variable overrides.
    fn apply_env(&mut self) {
        if let Ok(url) = env::var("DATA_CENTER_BASE_URL") {
            self.data_center.base_url = Some(url);
        }
        if let Ok(key) = env::var("BINANCE_API_KEY") {
            self.data_center.api_key = Some(key);
        }
        if let Ok(secret) = env::var("BINANCE_API_SECRET") {
            self.data_center.api_secret = Some(secret);
        }
        if let Ok(ttl) = env::var("CACHE_TTL_SECONDS") {
            if let Ok(ttl) = ttl.parse() {
                self.data_center.cache_ttl_seconds = ttl;
            }
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.global.log_level = level;
        }
        if let Ok(debug) = env::var("ENGINE_DEBUG") {
            self.global.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let unit = |name: &str, value: Decimal| -> EngineResult<()> {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(EngineError::Config(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
            Ok(())
        };

        if self.trading.default_leverage == 0 {
            return Err(EngineError::Config("default_leverage must be >= 1".into()));
        }
        unit("default_position_size_pct", self.trading.default_position_size_pct)?;
        if self.trading.taker_fee < Decimal::ZERO || self.trading.maker_fee < Decimal::ZERO {
            return Err(EngineError::Config("fees must be non-negative".into()));
        }
        if self.trading.slippage < Decimal::ZERO {
            return Err(EngineError::Config("slippage must be non-negative".into()));
        }
        unit("max_daily_loss_pct", self.risk.max_daily_loss_pct)?;
        unit("max_drawdown_pct", self.risk.max_drawdown_pct)?;
        unit("max_total_position_pct", self.risk.max_total_position_pct)?;
        unit("warning_ratio", self.risk.warning_ratio)?;
        if self.engine.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be >= 1".into()));
        }
        if self.engine.max_speed > 999 {
            return Err(EngineError::Config("max_speed must be <= 999".into()));
        }
        if self.data_center.max_retries == 0 {
            return Err(EngineError::Config("max_retries must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trading.default_leverage, 10);
        assert_eq!(config.trading.taker_fee, dec!(0.0004));
        assert_eq!(config.data_center.cache_ttl_seconds, 300);
        assert_eq!(config.risk.max_drawdown_pct, dec!(0.15));
    }

    #[test]
    fn toml_overrides_defaults() {
        let raw = r#"
            [trading]
            default_leverage = 20
            slippage = "0.001"

            [risk]
            max_drawdown_pct = "0.2"

            [engine]
            batch_size = 250
            preload_enabled = false
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.trading.default_leverage, 20);
        assert_eq!(config.trading.slippage, dec!(0.001));
        assert_eq!(config.risk.max_drawdown_pct, dec!(0.2));
        assert_eq!(config.engine.batch_size, 250);
        assert!(!config.engine.preload_enabled);
        // Untouched sections keep their defaults.
        assert_eq!(config.trading.taker_fee, dec!(0.0004));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.trading.default_leverage = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.risk.max_drawdown_pct = dec!(1.5);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
