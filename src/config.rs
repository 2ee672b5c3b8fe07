use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::gateway::RetryPolicy;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Exchange credentials and endpoint
    pub exchange: ExchangeConfig,
    /// Order size limits and precision
    #[serde(default)]
    pub trading: TradingLimits,
    /// Engine timing and retry behaviour
    #[serde(default)]
    pub engine: EngineConfig,
    /// Simulated exchange used in paper mode
    #[serde(default)]
    pub paper: PaperConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Deserialize)]
pub struct ExchangeConfig {
    pub api_key: String,
    /// Never logged; see the `Debug` impl
    pub api_secret: String,
    #[serde(default = "default_testnet")]
    pub testnet: bool,
    /// Overrides the endpoint implied by `testnet`
    #[serde(default)]
    pub base_url: Option<String>,
}

impl fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .field("testnet", &self.testnet)
            .field("base_url", &self.base_url())
            .finish()
    }
}

impl ExchangeConfig {
    pub fn base_url(&self) -> &str {
        match &self.base_url {
            Some(url) => url,
            None if self.testnet => "https://testnet.binancefuture.com",
            None => "https://fapi.binance.com",
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() || self.api_secret.trim().is_empty() {
            return Err(Error::Config(
                "Missing API credentials. Set BINANCE_API_KEY and BINANCE_API_SECRET \
                 or the [exchange] section of the config file"
                    .into(),
            ));
        }
        Ok(())
    }
}

fn default_testnet() -> bool {
    true
}

fn mask(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    format!("{}***", visible)
}

/// Trading parameters and limits applied to every strategy spec
#[derive(Debug, Clone, Deserialize)]
pub struct TradingLimits {
    #[serde(default = "default_symbol")]
    pub default_symbol: String,
    #[serde(default = "default_min_quantity")]
    pub min_quantity: Decimal,
    #[serde(default = "default_max_quantity")]
    pub max_quantity: Decimal,
    #[serde(default = "default_price_precision")]
    pub price_precision: u32,
    #[serde(default = "default_quantity_precision")]
    pub quantity_precision: u32,
    #[serde(default = "default_max_grid_levels")]
    pub max_grid_levels: u32,
    /// Longest TWAP horizon accepted, in seconds
    #[serde(default = "default_max_twap_horizon")]
    pub max_twap_horizon_secs: u64,
}

impl Default for TradingLimits {
    fn default() -> Self {
        Self {
            default_symbol: default_symbol(),
            min_quantity: default_min_quantity(),
            max_quantity: default_max_quantity(),
            price_precision: default_price_precision(),
            quantity_precision: default_quantity_precision(),
            max_grid_levels: default_max_grid_levels(),
            max_twap_horizon_secs: default_max_twap_horizon(),
        }
    }
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_min_quantity() -> Decimal {
    dec!(0.001)
}

fn default_max_quantity() -> Decimal {
    dec!(100)
}

fn default_price_precision() -> u32 {
    2
}

fn default_quantity_precision() -> u32 {
    3
}

fn default_max_grid_levels() -> u32 {
    50
}

fn default_max_twap_horizon() -> u64 {
    24 * 60 * 60
}

impl TradingLimits {
    /// Round a price to the configured tick precision
    pub fn round_price(&self, price: Decimal) -> Decimal {
        price.round_dp_with_strategy(self.price_precision, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Truncate a quantity to the configured lot precision
    pub fn round_quantity(&self, quantity: Decimal) -> Decimal {
        quantity.round_dp_with_strategy(self.quantity_precision, RoundingStrategy::ToZero)
    }

    /// Check a single-order quantity against the configured bounds
    pub fn check_quantity(&self, what: &str, quantity: Decimal) -> Result<()> {
        if quantity <= Decimal::ZERO {
            return Err(Error::InvalidStrategySpec(format!("{} must be positive", what)));
        }
        if quantity < self.min_quantity {
            return Err(Error::InvalidStrategySpec(format!(
                "{} must be at least {}",
                what, self.min_quantity
            )));
        }
        if quantity > self.max_quantity {
            return Err(Error::InvalidStrategySpec(format!(
                "{} cannot exceed {}",
                what, self.max_quantity
            )));
        }
        Ok(())
    }
}

/// Engine timing, retry and persistence settings
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Interval between engine ticks in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Consecutive skipped TWAP slices tolerated before the strategy fails
    #[serde(default = "default_max_consecutive_skips")]
    pub max_consecutive_skips: u32,
    /// Maximum attempts for a gateway call that fails transiently
    #[serde(default = "default_max_retries")]
    pub max_order_retries: u32,
    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Where to write engine snapshots; disabled when unset
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Snapshot interval in seconds
    #[serde(default = "default_save_interval")]
    pub state_save_interval_secs: u64,
    /// Consecutive ticks with exhausted gateway retries before the runner stops
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Seconds a finished order stays archived before it is pruned; 0 keeps them all
    #[serde(default = "default_archive_retention")]
    pub archive_retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            max_consecutive_skips: default_max_consecutive_skips(),
            max_order_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            state_file: None,
            state_save_interval_secs: default_save_interval(),
            max_consecutive_errors: default_max_consecutive_errors(),
            archive_retention_secs: default_archive_retention(),
        }
    }
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_max_consecutive_skips() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_save_interval() -> u64 {
    30
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_archive_retention() -> u64 {
    3600
}

const MAX_ARCHIVE_RETENTION_SECS: u64 = 10 * 365 * 24 * 3600;

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_order_retries, Duration::from_millis(self.retry_base_delay_ms))
    }

    /// How long archived orders are kept, `None` when pruning is disabled
    pub fn archive_retention(&self) -> Option<chrono::Duration> {
        match self.archive_retention_secs {
            0 => None,
            secs => Some(chrono::Duration::seconds(
                secs.min(MAX_ARCHIVE_RETENTION_SECS) as i64,
            )),
        }
    }
}

/// Paper trading parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    /// Starting price of the simulated market
    #[serde(default = "default_initial_price")]
    pub initial_price: Decimal,
    /// Quote balance available for margin checks
    #[serde(default = "default_quote_balance")]
    pub quote_balance: Decimal,
    /// Maximum random-walk step per tick, in basis points
    #[serde(default = "default_price_step_bps")]
    pub price_step_bps: u32,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_price: default_initial_price(),
            quote_balance: default_quote_balance(),
            price_step_bps: default_price_step_bps(),
        }
    }
}

fn default_initial_price() -> Decimal {
    dec!(45000)
}

fn default_quote_balance() -> Decimal {
    dec!(100000)
}

fn default_price_step_bps() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from an optional configuration file plus the environment
    ///
    /// Precedence, lowest first: file, `BOT__SECTION__KEY` variables, then the
    /// conventional `BINANCE_API_KEY` / `BINANCE_API_SECRET` / `BINANCE_TESTNET`.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // e.g. BOT__ENGINE__TICK_INTERVAL_MS=500
        builder = builder
            .add_source(Environment::with_prefix("BOT").separator("__"))
            .set_override_option("exchange.api_key", std::env::var("BINANCE_API_KEY").ok())?
            .set_override_option(
                "exchange.api_secret",
                std::env::var("BINANCE_API_SECRET").ok(),
            )?
            .set_override_option(
                "exchange.testnet",
                std::env::var("BINANCE_TESTNET")
                    .ok()
                    .map(|v| v.eq_ignore_ascii_case("true") || v == "1"),
            )?;

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.exchange.validate()?;
        Ok(settings)
    }

    /// Settings for tests and embedding, with placeholder credentials
    pub fn with_credentials(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            exchange: ExchangeConfig {
                api_key: api_key.into(),
                api_secret: api_secret.into(),
                testnet: true,
                base_url: None,
            },
            trading: TradingLimits::default(),
            engine: EngineConfig::default(),
            paper: PaperConfig::default(),
            log: LogConfig::default(),
        }
    }
}
