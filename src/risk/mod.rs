//! Trade limits. A breach is a decision outcome (the entry is refused and
//! reported), never a fault to retry.

use serde::{Deserialize, Serialize};

use crate::config::TradeLimitsConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLimits {
    pub max_shares_per_trade: f64,
    pub max_usd_per_trade: f64,
    pub max_entry_price: f64,
    pub enforce: bool,
}

impl From<&TradeLimitsConfig> for TradeLimits {
    fn from(cfg: &TradeLimitsConfig) -> Self {
        Self {
            max_shares_per_trade: cfg.max_shares_per_trade,
            max_usd_per_trade: cfg.max_usd_per_trade,
            max_entry_price: cfg.max_entry_price,
            enforce: cfg.enforce,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LimitBreach {
    Shares { requested: f64, max: f64 },
    Usd { requested: f64, max: f64 },
    EntryPrice { price: f64, max: f64 },
}

impl std::fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitBreach::Shares { requested, max } => {
                write!(f, "shares {:.2} exceed max {:.2}", requested, max)
            }
            LimitBreach::Usd { requested, max } => {
                write!(f, "entry ${:.2} exceeds max ${:.2}", requested, max)
            }
            LimitBreach::EntryPrice { price, max } => {
                write!(f, "entry price {:.3} above max {:.3}", price, max)
            }
        }
    }
}

impl TradeLimits {
    /// Check a prospective entry of `shares` at `price`
    pub fn check(&self, shares: f64, price: f64) -> Result<(), LimitBreach> {
        if !self.enforce {
            return Ok(());
        }
        if shares > self.max_shares_per_trade {
            return Err(LimitBreach::Shares {
                requested: shares,
                max: self.max_shares_per_trade,
            });
        }
        let usd = shares * price;
        if usd > self.max_usd_per_trade {
            return Err(LimitBreach::Usd {
                requested: usd,
                max: self.max_usd_per_trade,
            });
        }
        if price > self.max_entry_price {
            return Err(LimitBreach::EntryPrice {
                price,
                max: self.max_entry_price,
            });
        }
        Ok(())
    }
}
