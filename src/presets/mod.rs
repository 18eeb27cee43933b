use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Supported crypto bases and their market families
const CRYPTO_BASES: &[(&str, &str, &str)] = &[
    ("ETH", "eth-up-or-down", "eth-updown"),
    ("BTC", "btc-up-or-down", "btc-updown"),
    ("SOL", "solana-up-or-down", "sol-updown"),
    ("XRP", "xrp-up-or-down", "xrp-updown"),
];

/// Timeframe label, display name, window length in seconds, feed variant
const TIMEFRAMES: &[(&str, &str, i64, &str)] = &[
    ("15m", "15 minutes", 15 * 60, "fifteen"),
    ("1h", "1 hour", 60 * 60, "oneHour"),
    ("4h", "4 hours", 4 * 60 * 60, "fourHour"),
    ("1d", "1 day", 24 * 60 * 60, "day"),
];

/// An independently scheduled trading configuration: one instrument on one
/// window cadence, with its own position lifecycle and history sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorPreset {
    pub crypto: String,
    pub timeframe_label: String,
    pub variant: String,
    pub series_slug: String,
    pub market_slug_prefix: String,
    pub window_seconds: i64,
}

impl MonitorPreset {
    pub fn symbol(&self) -> String {
        self.crypto.to_uppercase()
    }

    pub fn display_name(&self) -> String {
        let display = TIMEFRAMES
            .iter()
            .find(|(label, _, _, _)| *label == self.timeframe_label)
            .map(|(_, display, _, _)| *display)
            .unwrap_or(self.timeframe_label.as_str());
        format!("{} {}", self.symbol(), display)
    }

    pub fn window_duration(&self) -> Duration {
        Duration::seconds(self.window_seconds)
    }

    /// Window containing `now`; starts are aligned to the cadence from epoch
    pub fn window_containing(&self, now: DateTime<Utc>) -> Window {
        let epoch = now.timestamp();
        let start_epoch = epoch - epoch.rem_euclid(self.window_seconds);
        let start = Utc.timestamp_opt(start_epoch, 0).unwrap();
        Window {
            start,
            end: start + self.window_duration(),
        }
    }

    pub fn market_slug_for(&self, window: &Window) -> String {
        format!("{}-{}", self.market_slug_prefix, window.start.timestamp())
    }
}

/// Bounded interval during which one position may be open for a preset.
/// Derived from the schedule; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        now >= self.start && now < self.end
    }

    pub fn previous(&self, window_seconds: i64) -> Window {
        let step = Duration::seconds(window_seconds);
        Window {
            start: self.start - step,
            end: self.end - step,
        }
    }
}

pub fn available_cryptos() -> Vec<String> {
    let mut cryptos: Vec<String> = CRYPTO_BASES
        .iter()
        .map(|(crypto, _, _)| crypto.to_string())
        .collect();
    cryptos.sort();
    cryptos
}

pub fn available_timeframes() -> Vec<String> {
    TIMEFRAMES
        .iter()
        .map(|(label, _, _, _)| label.to_string())
        .collect()
}

pub fn get_preset(crypto: &str, timeframe: &str) -> Option<MonitorPreset> {
    let crypto_upper = crypto.to_uppercase();
    let (crypto, series_base, market_base) = CRYPTO_BASES
        .iter()
        .find(|(symbol, _, _)| *symbol == crypto_upper)?;
    let (label, _, seconds, variant) = TIMEFRAMES
        .iter()
        .find(|(label, _, _, _)| *label == timeframe)?;
    Some(MonitorPreset {
        crypto: crypto.to_string(),
        timeframe_label: label.to_string(),
        variant: variant.to_string(),
        series_slug: format!("{}-{}", series_base, label),
        market_slug_prefix: format!("{}-{}", market_base, label),
        window_seconds: *seconds,
    })
}

pub fn all_presets() -> Vec<MonitorPreset> {
    let mut presets = Vec::new();
    for (crypto, _, _) in CRYPTO_BASES {
        for (label, _, _, _) in TIMEFRAMES {
            if let Some(preset) = get_preset(crypto, label) {
                presets.push(preset);
            }
        }
    }
    presets
}

/// Parse a preset selector of the form "eth:15m" or "BTC:1h"
pub fn parse_selector(selector: &str) -> Option<MonitorPreset> {
    let (crypto, timeframe) = selector.split_once(':')?;
    get_preset(crypto.trim(), timeframe.trim())
}
