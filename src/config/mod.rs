//! Configuration management for PerpBot
//!
//! Loads from YAML files + environment variables via .env. All strategy
//! parameters are enumerated here and validated once at startup; nothing
//! is mutated after `UnifiedConfig::load()` returns.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Master configuration for the unified trading system
#[derive(Debug, Clone, Deserialize)]
pub struct UnifiedConfig {
    pub global: GlobalConfig,
    pub futures: FuturesEngineConfig,
    pub spot: SpotEngineConfig,
    pub scanner: ScannerConfig,
    pub analyzer: AnalyzerConfig,
    pub journal: JournalConfig,
}

/// Portfolio-wide limits and supervision thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Daily loss circuit-breaker threshold (% of starting value)
    pub daily_loss_limit_pct: f64,
    /// Max drawdown from the portfolio peak (%)
    pub max_drawdown_pct: f64,
    /// Circuit breaker cooldown in minutes
    pub circuit_breaker_cooldown_minutes: i64,
    /// Heartbeat age that logs a warning (seconds)
    pub heartbeat_warn_secs: i64,
    /// Heartbeat age that triggers an engine restart (seconds)
    pub heartbeat_restart_secs: i64,
    /// Restart budget per engine before it is parked in ERROR
    pub max_restarts: u32,
    /// Grace period for engines to drain on shutdown (seconds)
    pub shutdown_grace_secs: u64,
    /// Monitor loop cadence (seconds)
    pub monitor_tick_secs: u64,
    /// Portfolio-wide unrealized loss that closes everything (%)
    pub emergency_portfolio_loss_pct: f64,
}

/// Leveraged perpetuals engine
#[derive(Debug, Clone, Deserialize)]
pub struct FuturesEngineConfig {
    pub enabled: bool,
    /// Share of portfolio capital (%)
    pub capital_pct: f64,
    pub max_positions: usize,
    pub scan_interval_secs: u64,
    pub monitor_interval_secs: u64,
    /// Minimum confidence in TRENDING regime
    pub min_confidence_trending: u8,
    /// Minimum confidence outside TRENDING (more selective)
    pub min_confidence_sideways: u8,
    /// Position size bounds as a fraction of engine capital
    pub size_pct_min: f64,
    pub size_pct_max: f64,
    /// Leverage bounds (hard cap applies regardless of confidence)
    pub leverage_min: u32,
    pub leverage_max: u32,
    /// Trailing stop activation profit (%), regime-adjusted at runtime
    pub trailing_activation_pct: f64,
    /// Blacklist duration after a stop-loss exit (minutes)
    pub blacklist_duration_minutes: i64,
    /// Candles to wait before executing an accepted entry (0 = immediate)
    pub confirm_candles: u32,
    /// Adverse move that cancels a pending confirmation (%)
    pub confirm_adverse_pct: f64,
    /// Fraction closed at the first take-profit rung
    pub tp1_fraction: f64,
    /// Fraction closed at the second take-profit rung
    pub tp2_fraction: f64,
    /// Single-position unrealized loss that forces an exit (%)
    pub emergency_position_loss_pct: f64,
    /// Max concurrent positions per correlation group
    pub max_per_correlation_group: usize,
}

/// Simple long-only spot engine
#[derive(Debug, Clone, Deserialize)]
pub struct SpotEngineConfig {
    pub enabled: bool,
    pub capital_pct: f64,
    pub max_positions: usize,
    pub scan_interval_secs: u64,
    /// Fixed position size per entry (% of engine capital)
    pub position_size_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub min_confidence: u8,
    pub watchlist: Vec<String>,
}

/// Market scanner thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Minimum 24h quote volume in USD
    pub min_volume_usd: f64,
    /// Symbols returned per scan
    pub top_n: usize,
    /// Symbol substrings that are never traded
    pub excluded_patterns: Vec<String>,
}

/// Multi-timeframe analyzer thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Minimum confidence to emit a proposal at all
    pub min_confidence: u8,
    /// Reference symbol for correlation adjustments
    pub reference_symbol: String,
    /// Candles fetched per timeframe
    pub candle_limit: usize,
}

/// Trade journal persistence
#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    pub data_dir: String,
    /// Closed trades considered for win-rate feedback
    pub winrate_lookback: usize,
}

/// API credentials from the environment, never from config files
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
}

impl Credentials {
    /// Load credentials from the environment. `.env` has already been
    /// read by `UnifiedConfig::load`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("PERPBOT_API_KEY")
            .context("PERPBOT_API_KEY is not set")?;
        let api_secret = std::env::var("PERPBOT_API_SECRET")
            .context("PERPBOT_API_SECRET is not set")?;

        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            bail!("PERPBOT_API_KEY / PERPBOT_API_SECRET must not be empty");
        }

        let testnet = std::env::var("PERPBOT_TESTNET")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(true);

        Ok(Self {
            api_key,
            api_secret,
            testnet,
        })
    }
}

impl UnifiedConfig {
    /// Load configuration from defaults, config files and environment
    pub fn load() -> Result<Self> {
        // Load .env file first so env overrides see it
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Global defaults
            .set_default("global.daily_loss_limit_pct", 5.0)?
            .set_default("global.max_drawdown_pct", 15.0)?
            .set_default("global.circuit_breaker_cooldown_minutes", 60)?
            .set_default("global.heartbeat_warn_secs", 60)?
            .set_default("global.heartbeat_restart_secs", 300)?
            .set_default("global.max_restarts", 3)?
            .set_default("global.shutdown_grace_secs", 30)?
            .set_default("global.monitor_tick_secs", 1)?
            .set_default("global.emergency_portfolio_loss_pct", 5.0)?
            // Futures engine defaults
            .set_default("futures.enabled", true)?
            .set_default("futures.capital_pct", 60.0)?
            .set_default("futures.max_positions", 10)?
            .set_default("futures.scan_interval_secs", 30)?
            .set_default("futures.monitor_interval_secs", 5)?
            .set_default("futures.min_confidence_trending", 60)?
            .set_default("futures.min_confidence_sideways", 65)?
            .set_default("futures.size_pct_min", 0.08)?
            .set_default("futures.size_pct_max", 0.25)?
            .set_default("futures.leverage_min", 2)?
            .set_default("futures.leverage_max", 8)?
            .set_default("futures.trailing_activation_pct", 2.0)?
            .set_default("futures.blacklist_duration_minutes", 60)?
            .set_default("futures.confirm_candles", 1)?
            .set_default("futures.confirm_adverse_pct", 0.3)?
            .set_default("futures.tp1_fraction", 0.40)?
            .set_default("futures.tp2_fraction", 0.30)?
            .set_default("futures.emergency_position_loss_pct", 4.0)?
            .set_default("futures.max_per_correlation_group", 2)?
            // Spot engine defaults
            .set_default("spot.enabled", false)?
            .set_default("spot.capital_pct", 40.0)?
            .set_default("spot.max_positions", 5)?
            .set_default("spot.scan_interval_secs", 60)?
            .set_default("spot.position_size_pct", 10.0)?
            .set_default("spot.stop_loss_pct", 3.0)?
            .set_default("spot.take_profit_pct", 6.0)?
            .set_default("spot.min_confidence", 60)?
            .set_default(
                "spot.watchlist",
                vec!["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT"],
            )?
            // Scanner defaults
            .set_default("scanner.min_volume_usd", 10_000_000.0)?
            .set_default("scanner.top_n", 20)?
            .set_default(
                "scanner.excluded_patterns",
                vec!["USDC", "BUSD", "TUSD", "FDUSD", "DOWN", "UP"],
            )?
            // Analyzer defaults
            .set_default("analyzer.min_confidence", 60)?
            .set_default("analyzer.reference_symbol", "BTCUSDT")?
            .set_default("analyzer.candle_limit", 100)?
            // Journal defaults
            .set_default("journal.data_dir", "./data")?
            .set_default("journal.winrate_lookback", 20)?
            // Load config files if present
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PERPBOT__*)
            .add_source(Environment::with_prefix("PERPBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let unified: UnifiedConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(unified)
    }

    /// Validate configuration values. Called once before the orchestrator
    /// spawns anything; a failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let mut total_allocation = 0.0;
        if self.futures.enabled {
            total_allocation += self.futures.capital_pct;
        }
        if self.spot.enabled {
            total_allocation += self.spot.capital_pct;
        }
        if total_allocation > 100.0 {
            errors.push(format!(
                "total capital allocation ({total_allocation}%) exceeds 100%"
            ));
        }

        if self.futures.capital_pct < 0.0 || self.spot.capital_pct < 0.0 {
            errors.push("capital_pct must be >= 0".into());
        }
        if self.global.daily_loss_limit_pct <= 0.0 {
            errors.push("global.daily_loss_limit_pct must be > 0".into());
        }
        if self.global.max_drawdown_pct <= 0.0 {
            errors.push("global.max_drawdown_pct must be > 0".into());
        }
        if self.global.heartbeat_warn_secs <= 0 {
            errors.push("global.heartbeat_warn_secs must be > 0".into());
        }
        if self.global.heartbeat_restart_secs <= self.global.heartbeat_warn_secs {
            errors.push("global.heartbeat_restart_secs must be > heartbeat_warn_secs".into());
        }

        if self.futures.leverage_min < 1 {
            errors.push("futures.leverage_min must be >= 1".into());
        }
        if self.futures.leverage_max < self.futures.leverage_min {
            errors.push("futures.leverage_max must be >= leverage_min".into());
        }
        if self.futures.size_pct_min <= 0.0 || self.futures.size_pct_max > 1.0 {
            errors.push("futures size bounds must be within (0, 1]".into());
        }
        if self.futures.size_pct_max < self.futures.size_pct_min {
            errors.push("futures.size_pct_max must be >= size_pct_min".into());
        }
        if self.futures.max_positions == 0 || self.spot.max_positions == 0 {
            errors.push("max_positions must be >= 1".into());
        }
        if self.futures.tp1_fraction + self.futures.tp2_fraction >= 1.0 {
            errors.push("tp1_fraction + tp2_fraction must leave a trailed remainder (< 1.0)".into());
        }
        if self.futures.tp1_fraction <= 0.0 || self.futures.tp2_fraction <= 0.0 {
            errors.push("take-profit fractions must be > 0".into());
        }
        if self.futures.min_confidence_sideways < self.futures.min_confidence_trending {
            errors.push(
                "futures.min_confidence_sideways must be >= min_confidence_trending".into(),
            );
        }

        if self.scanner.top_n == 0 {
            errors.push("scanner.top_n must be >= 1".into());
        }
        if self.analyzer.candle_limit < 50 {
            errors.push("analyzer.candle_limit must be >= 50 for indicator warmup".into());
        }

        if !errors.is_empty() {
            bail!("Configuration invalid:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    /// Short digest of the config (no secrets) for startup logging
    pub fn digest(&self) -> String {
        format!(
            "futures={}({:.0}%) spot={}({:.0}%) daily_loss={:.1}% drawdown={:.1}%",
            self.futures.enabled,
            self.futures.capital_pct,
            self.spot.enabled,
            self.spot.capital_pct,
            self.global.daily_loss_limit_pct,
            self.global.max_drawdown_pct,
        )
    }
}

impl Default for UnifiedConfig {
    /// Defaults-only configuration, primarily for tests
    fn default() -> Self {
        Self {
            global: GlobalConfig {
                daily_loss_limit_pct: 5.0,
                max_drawdown_pct: 15.0,
                circuit_breaker_cooldown_minutes: 60,
                heartbeat_warn_secs: 60,
                heartbeat_restart_secs: 300,
                max_restarts: 3,
                shutdown_grace_secs: 30,
                monitor_tick_secs: 1,
                emergency_portfolio_loss_pct: 5.0,
            },
            futures: FuturesEngineConfig {
                enabled: true,
                capital_pct: 60.0,
                max_positions: 10,
                scan_interval_secs: 30,
                monitor_interval_secs: 5,
                min_confidence_trending: 60,
                min_confidence_sideways: 65,
                size_pct_min: 0.08,
                size_pct_max: 0.25,
                leverage_min: 2,
                leverage_max: 8,
                trailing_activation_pct: 2.0,
                blacklist_duration_minutes: 60,
                confirm_candles: 1,
                confirm_adverse_pct: 0.3,
                tp1_fraction: 0.40,
                tp2_fraction: 0.30,
                emergency_position_loss_pct: 4.0,
                max_per_correlation_group: 2,
            },
            spot: SpotEngineConfig {
                enabled: false,
                capital_pct: 40.0,
                max_positions: 5,
                scan_interval_secs: 60,
                position_size_pct: 10.0,
                stop_loss_pct: 3.0,
                take_profit_pct: 6.0,
                min_confidence: 60,
                watchlist: vec![
                    "BTCUSDT".into(),
                    "ETHUSDT".into(),
                    "SOLUSDT".into(),
                    "BNBUSDT".into(),
                ],
            },
            scanner: ScannerConfig {
                min_volume_usd: 10_000_000.0,
                top_n: 20,
                excluded_patterns: vec![
                    "USDC".into(),
                    "BUSD".into(),
                    "TUSD".into(),
                    "FDUSD".into(),
                    "DOWN".into(),
                    "UP".into(),
                ],
            },
            analyzer: AnalyzerConfig {
                min_confidence: 60,
                reference_symbol: "BTCUSDT".into(),
                candle_limit: 100,
            },
            journal: JournalConfig {
                data_dir: "./data".into(),
                winrate_lookback: 20,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = UnifiedConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_allocation_overflow_rejected() {
        let mut cfg = UnifiedConfig::default();
        cfg.futures.capital_pct = 70.0;
        cfg.spot.enabled = true;
        cfg.spot.capital_pct = 50.0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("exceeds 100%"), "{err}");
    }

    #[test]
    fn test_disabled_engine_not_counted() {
        let mut cfg = UnifiedConfig::default();
        cfg.futures.capital_pct = 100.0;
        cfg.spot.enabled = false;
        cfg.spot.capital_pct = 100.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_fractions_must_trail_remainder() {
        let mut cfg = UnifiedConfig::default();
        cfg.futures.tp1_fraction = 0.6;
        cfg.futures.tp2_fraction = 0.4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_heartbeat_thresholds_ordered() {
        let mut cfg = UnifiedConfig::default();
        cfg.global.heartbeat_restart_secs = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_leverage_bounds() {
        let mut cfg = UnifiedConfig::default();
        cfg.futures.leverage_min = 10;
        assert!(cfg.validate().is_err());
    }
}
