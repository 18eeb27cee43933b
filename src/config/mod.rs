//! Runtime configuration, built once at startup and passed by reference
//! into each component. No component reads ambient globals.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Postgres connection URL (required)
    pub database_url: String,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub limits: TradeLimitsConfig,
    /// Preset selectors, e.g. ["eth:15m", "btc:1h"]
    #[serde(default = "default_presets")]
    pub presets: Vec<String>,
}

fn default_presets() -> Vec<String> {
    vec!["eth:15m".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_clob_url")]
    pub clob_url: String,
    #[serde(default = "default_gamma_url")]
    pub gamma_url: String,
    #[serde(default = "default_price_history_url")]
    pub price_history_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub api_passphrase: Option<String>,
    /// Exchange requests per minute before the limiter holds calls back
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            clob_url: default_clob_url(),
            gamma_url: default_gamma_url(),
            price_history_url: default_price_history_url(),
            api_key: None,
            api_secret: None,
            api_passphrase: None,
            rate_limit_rpm: default_rate_limit_rpm(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_clob_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_gamma_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

fn default_price_history_url() -> String {
    "https://polymarket.com/api/crypto/crypto-price".to_string()
}

fn default_rate_limit_rpm() -> u32 {
    60
}

fn default_request_timeout() -> u64 {
    10
}

/// Retry policy for one order intent. Buys step the price up, sells step
/// it down; both stay inside `max_slippage` of the reference price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_seconds: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_price_step")]
    pub price_step: f64,
    #[serde(default = "default_max_slippage")]
    pub max_slippage: f64,
    #[serde(default)]
    pub market_fallback: bool,
    #[serde(default = "default_size_decimals")]
    pub size_decimals: u32,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            attempt_timeout_seconds: default_attempt_timeout(),
            poll_interval_ms: default_poll_interval(),
            price_step: default_price_step(),
            max_slippage: default_max_slippage(),
            market_fallback: false,
            size_decimals: default_size_decimals(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_attempt_timeout() -> u64 {
    20
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_price_step() -> f64 {
    0.01
}

fn default_max_slippage() -> f64 {
    0.05
}

fn default_size_decimals() -> u32 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Shares per entry
    #[serde(default = "default_shares")]
    pub shares: f64,
    /// Target exit = entry price + spread, clamped to [0.01, 0.99]
    #[serde(default = "default_target_spread")]
    pub target_spread: f64,
    /// Absolute sell-price drop below entry that forces an early exit
    #[serde(default = "default_urgency_price_drop")]
    pub urgency_price_drop: f64,
    /// Seconds after a window start during which entry may still be attempted
    #[serde(default = "default_entry_span")]
    pub entry_span_seconds: i64,
    /// Seconds before window end at which the forced close arms
    #[serde(default = "default_close_margin")]
    pub close_margin_seconds: i64,
    /// How long the resolver waits for the window's market to list
    #[serde(default = "default_resolve_wait")]
    pub resolve_wait_seconds: u64,
    #[serde(default = "default_resolve_poll")]
    pub resolve_poll_ms: u64,
    /// Consecutive same-direction windows required to trigger an entry
    #[serde(default = "default_pattern_trigger")]
    pub pattern_trigger: u32,
    /// Streak length above which entries are suppressed again
    #[serde(default = "default_pattern_max")]
    pub pattern_max: u32,
    /// Monitor tick cadence
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
    /// Integrity reconcile cadence
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,
    /// Windows of history the reconcile pass covers
    #[serde(default = "default_reconcile_lookback")]
    pub reconcile_lookback_windows: u32,
    #[serde(default)]
    pub entry_retry: RetryPolicyConfig,
    #[serde(default = "default_exit_retry")]
    pub exit_retry: RetryPolicyConfig,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            shares: default_shares(),
            target_spread: default_target_spread(),
            urgency_price_drop: default_urgency_price_drop(),
            entry_span_seconds: default_entry_span(),
            close_margin_seconds: default_close_margin(),
            resolve_wait_seconds: default_resolve_wait(),
            resolve_poll_ms: default_resolve_poll(),
            pattern_trigger: default_pattern_trigger(),
            pattern_max: default_pattern_max(),
            tick_interval_seconds: default_tick_interval(),
            reconcile_interval_seconds: default_reconcile_interval(),
            reconcile_lookback_windows: default_reconcile_lookback(),
            entry_retry: RetryPolicyConfig::default(),
            exit_retry: default_exit_retry(),
        }
    }
}

fn default_shares() -> f64 {
    10.0
}

fn default_target_spread() -> f64 {
    0.05
}

fn default_urgency_price_drop() -> f64 {
    0.15
}

fn default_entry_span() -> i64 {
    120
}

fn default_close_margin() -> i64 {
    30
}

fn default_resolve_wait() -> u64 {
    45
}

fn default_resolve_poll() -> u64 {
    2000
}

fn default_pattern_trigger() -> u32 {
    3
}

fn default_pattern_max() -> u32 {
    6
}

fn default_tick_interval() -> u64 {
    5
}

fn default_reconcile_interval() -> u64 {
    900
}

fn default_reconcile_lookback() -> u32 {
    24
}

fn default_exit_retry() -> RetryPolicyConfig {
    RetryPolicyConfig {
        attempt_timeout_seconds: 12,
        market_fallback: true,
        ..RetryPolicyConfig::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLimitsConfig {
    #[serde(default = "default_max_shares")]
    pub max_shares_per_trade: f64,
    #[serde(default = "default_max_usd")]
    pub max_usd_per_trade: f64,
    #[serde(default = "default_max_entry_price")]
    pub max_entry_price: f64,
    #[serde(default = "default_enforce")]
    pub enforce: bool,
}

impl Default for TradeLimitsConfig {
    fn default() -> Self {
        Self {
            max_shares_per_trade: default_max_shares(),
            max_usd_per_trade: default_max_usd(),
            max_entry_price: default_max_entry_price(),
            enforce: default_enforce(),
        }
    }
}

fn default_max_shares() -> f64 {
    100.0
}

fn default_max_usd() -> f64 {
    50.0
}

fn default_max_entry_price() -> f64 {
    0.62
}

fn default_enforce() -> bool {
    true
}

/// Load configuration from an optional TOML file plus environment
/// variables (prefixed `POLYBOT_`, `__` separator). Missing required
/// values are fatal: startup aborts.
pub fn load_config(config_path: Option<&str>) -> Result<BotConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if !Path::new(path).exists() {
            return Err(format!("Config file not found: {}", path).into());
        }
        builder = builder.add_source(File::with_name(path));
    }

    builder = builder.add_source(
        Environment::with_prefix("POLYBOT")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("presets"),
    );

    let config = builder.build()?;
    let bot_config: BotConfig = config.try_deserialize()?;

    if bot_config.database_url.trim().is_empty() {
        return Err("database_url must not be empty".into());
    }
    if bot_config.presets.is_empty() {
        return Err("at least one preset selector is required".into());
    }

    Ok(bot_config)
}
