//! Read-only market discovery and official window price history.
//!
//! Both lookups report "not there yet" as `Ok(None)` rather than an error:
//! the next window's market routinely lists late, and price history lags
//! the window close. Callers defer, they never fail a preset permanently.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::config::ExchangeConfig;
use crate::Result;

const FEED_MAX_RETRIES: u32 = 3;
const FEED_BACKOFF_MS: u64 = 1500;

/// Prices and token ids for one binary up/down market instance
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub slug: String,
    pub up_price: Option<f64>,
    pub down_price: Option<f64>,
    pub up_token_id: Option<String>,
    pub down_token_id: Option<String>,
}

/// Official open/close for a finished window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPrices {
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub completed: bool,
    pub source: String,
}

pub const PRICE_SOURCE_OFFICIAL: &str = "polymarket";

/// Market discovery seam used by the resolver
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn market_snapshot(&self, slug: &str) -> Result<Option<MarketSnapshot>>;
}

/// Price history seam used by candle recording and integrity backfill
#[async_trait]
pub trait PriceHistory: Send + Sync {
    async fn window_open_close(
        &self,
        symbol: &str,
        variant: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<WindowPrices>>;
}

// ============== Wire types ==============

/// Markets encode outcome arrays as JSON strings inside JSON
#[derive(Debug, Deserialize)]
struct GammaMarket {
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    outcomes: Option<String>,
    #[serde(default, rename = "outcomePrices")]
    outcome_prices: Option<String>,
    #[serde(default, rename = "clobTokenIds")]
    clob_token_ids: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CryptoPriceResponse {
    #[serde(default, rename = "openPrice")]
    open_price: Option<serde_json::Value>,
    #[serde(default, rename = "closePrice")]
    close_price: Option<serde_json::Value>,
    #[serde(default)]
    completed: Option<bool>,
}

// ============== Client ==============

#[derive(Clone)]
pub struct GammaClient {
    client: Client,
    gamma_url: String,
    price_history_url: String,
}

impl GammaClient {
    pub fn new(cfg: &ExchangeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            gamma_url: cfg.gamma_url.trim_end_matches('/').to_string(),
            price_history_url: cfg.price_history_url.clone(),
        })
    }

    async fn fetch_snapshot_once(&self, slug: &str) -> Result<Option<MarketSnapshot>> {
        let url = format!("{}/markets/slug/{}", self.gamma_url, slug);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(format!("market feed returned status {}", response.status()).into());
        }

        let market: GammaMarket = response.json().await?;
        Ok(Some(snapshot_from_market(slug, market)))
    }

    async fn fetch_window_once(
        &self,
        symbol: &str,
        variant: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<WindowPrices>> {
        let used_end = floor_to_minute(window_end.min(Utc::now()));
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("eventStartTime".to_string(), dt_to_iso_z(window_start)),
        ];
        if used_end > floor_to_minute(window_start) {
            params.push(("endDate".to_string(), dt_to_iso_z(used_end)));
        }
        if !variant.is_empty() {
            params.push(("variant".to_string(), variant.to_string()));
        }

        let response = self
            .client
            .get(&self.price_history_url)
            .query(&params)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(format!("price history returned status {}", response.status()).into());
        }

        let payload: CryptoPriceResponse = response.json().await?;
        let open = value_to_f64(payload.open_price.as_ref());
        let close = value_to_f64(payload.close_price.as_ref());
        if open.is_none() && close.is_none() {
            return Ok(None);
        }
        Ok(Some(WindowPrices {
            open,
            close,
            completed: payload.completed.unwrap_or(false),
            source: PRICE_SOURCE_OFFICIAL.to_string(),
        }))
    }
}

#[async_trait]
impl MarketFeed for GammaClient {
    async fn market_snapshot(&self, slug: &str) -> Result<Option<MarketSnapshot>> {
        let mut last_error = None;
        for attempt in 1..=FEED_MAX_RETRIES {
            match self.fetch_snapshot_once(slug).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < FEED_MAX_RETRIES {
                        tokio::time::sleep(Duration::from_millis(
                            FEED_BACKOFF_MS * 2u64.pow(attempt - 1),
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| "market feed retries exhausted".into()))
    }
}

#[async_trait]
impl PriceHistory for GammaClient {
    async fn window_open_close(
        &self,
        symbol: &str,
        variant: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<WindowPrices>> {
        let mut last_error = None;
        for attempt in 1..=FEED_MAX_RETRIES {
            match self
                .fetch_window_once(symbol, variant, window_start, window_end)
                .await
            {
                Ok(prices) => return Ok(prices),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < FEED_MAX_RETRIES {
                        tokio::time::sleep(Duration::from_millis(
                            FEED_BACKOFF_MS * 2u64.pow(attempt - 1),
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| "price history retries exhausted".into()))
    }
}

fn snapshot_from_market(slug: &str, market: GammaMarket) -> MarketSnapshot {
    let outcomes = parse_string_array(market.outcomes.as_deref());
    let prices = parse_string_array(market.outcome_prices.as_deref());
    let token_ids = parse_string_array(market.clob_token_ids.as_deref());

    let mut snapshot = MarketSnapshot {
        slug: market.slug.unwrap_or_else(|| slug.to_string()),
        up_price: None,
        down_price: None,
        up_token_id: None,
        down_token_id: None,
    };

    for (index, outcome) in outcomes.iter().enumerate() {
        let price = prices.get(index).and_then(|p| p.parse::<f64>().ok());
        let token_id = token_ids.get(index).filter(|t| !t.is_empty()).cloned();
        match outcome.trim().to_lowercase().as_str() {
            "up" | "yes" => {
                snapshot.up_price = price;
                snapshot.up_token_id = token_id;
            }
            "down" | "no" => {
                snapshot.down_price = price;
                snapshot.down_token_id = token_id;
            }
            _ => {}
        }
    }
    snapshot
}

/// Parse a JSON-encoded string array like `"[\"Up\", \"Down\"]"`
fn parse_string_array(raw: Option<&str>) -> Vec<String> {
    let raw = match raw {
        Some(r) if !r.trim().is_empty() => r,
        _ => return Vec::new(),
    };
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

fn value_to_f64(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn dt_to_iso_z(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn floor_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}
