//! REST gateway to the CLOB exchange: order placement, cancellation,
//! status probes and balance lookups.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ExchangeConfig;
use crate::models::OrderSide;

const GATEWAY_MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

pub type ClobResult<T> = std::result::Result<T, ClobError>;

/// Why an order was refused by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionCode {
    InsufficientBalance,
    MarketClosed,
    InvalidOrder,
    Other,
}

/// Transient failures are retried with backoff; rejections are terminal
/// for the current attempt and surfaced as decision outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Rejection,
}

#[derive(Debug, Error)]
pub enum ClobError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited by exchange")]
    RateLimited,

    #[error("exchange returned status {status}: {body}")]
    Server { status: u16, body: String },

    #[error("order rejected: {message}")]
    Rejected {
        code: RejectionCode,
        message: String,
    },

    #[error("invalid exchange response: {0}")]
    InvalidResponse(String),
}

impl ClobError {
    /// Classification by category, never by string matching at call sites
    pub fn kind(&self) -> FailureKind {
        match self {
            ClobError::Http(_)
            | ClobError::RateLimited
            | ClobError::Server { .. }
            | ClobError::InvalidResponse(_) => FailureKind::Transient,
            ClobError::Rejected { .. } => FailureKind::Rejection,
        }
    }

    pub fn rejection_code(&self) -> Option<RejectionCode> {
        match self {
            ClobError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_insufficient_balance(&self) -> bool {
        self.rejection_code() == Some(RejectionCode::InsufficientBalance)
    }
}

/// The exchange's own status vocabulary, normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOrderStatus {
    Live,
    Matched,
    Delayed,
    Cancelled,
    Expired,
    Rejected,
    Unknown(String),
}

impl ExchangeOrderStatus {
    pub fn parse(raw: &str) -> ExchangeOrderStatus {
        let text = raw.trim().to_lowercase();
        if text.contains("matched")
            || text.contains("filled")
            || text.contains("executed")
            || text.contains("complete")
        {
            ExchangeOrderStatus::Matched
        } else if text.contains("cancel") {
            ExchangeOrderStatus::Cancelled
        } else if text.contains("expired") {
            ExchangeOrderStatus::Expired
        } else if text.contains("reject") || text.contains("fail") || text.contains("invalid") {
            ExchangeOrderStatus::Rejected
        } else if text.contains("delayed") {
            ExchangeOrderStatus::Delayed
        } else if text.contains("live") || text.contains("open") || text.contains("pending") {
            ExchangeOrderStatus::Live
        } else {
            ExchangeOrderStatus::Unknown(text)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderType {
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "FOK")]
    Fok,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub tx_hash: Option<String>,
}

/// Snapshot of one order as the exchange reports it
#[derive(Debug, Clone)]
pub struct OrderState {
    pub order_id: String,
    pub status: ExchangeOrderStatus,
    pub size: f64,
    pub size_matched: f64,
    pub price: f64,
}

impl OrderState {
    /// Filled by status, or by matched size within rounding of the total
    pub fn is_filled(&self) -> bool {
        if self.status == ExchangeOrderStatus::Matched {
            return true;
        }
        self.size > 0.0 && self.size_matched >= self.size * 0.999
    }

    pub fn is_terminal_without_fill(&self) -> bool {
        !self.is_filled()
            && matches!(
                self.status,
                ExchangeOrderStatus::Cancelled
                    | ExchangeOrderStatus::Expired
                    | ExchangeOrderStatus::Rejected
            )
    }
}

/// Seam the execution engine and monitor consume; the live client and the
/// scripted test doubles both implement it.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn place_order(
        &self,
        token_id: &str,
        side: OrderSide,
        price: f64,
        size: f64,
        order_type: OrderType,
    ) -> ClobResult<OrderAck>;

    /// Market-style order spending/collecting a USD amount; guaranteed
    /// fill at the cost of price
    async fn place_market_order(
        &self,
        token_id: &str,
        side: OrderSide,
        amount: f64,
    ) -> ClobResult<OrderAck>;

    async fn cancel_order(&self, order_id: &str) -> ClobResult<()>;

    async fn get_order(&self, order_id: &str) -> ClobResult<OrderState>;

    /// Available collateral (USDC)
    async fn get_collateral_balance(&self) -> ClobResult<f64>;

    /// Available balance of one outcome token
    async fn get_token_balance(&self, token_id: &str) -> ClobResult<f64>;

    /// Best sell price currently on the book for the token
    async fn get_sell_price(&self, token_id: &str) -> ClobResult<f64>;
}

// ============== Wire types ==============

#[derive(Debug, Serialize)]
struct PlaceOrderRequest<'a> {
    token_id: &'a str,
    side: &'a str,
    price: f64,
    size: f64,
    order_type: OrderType,
}

#[derive(Debug, Serialize)]
struct MarketOrderRequest<'a> {
    token_id: &'a str,
    side: &'a str,
    amount: f64,
    order_type: OrderType,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    #[serde(default, rename = "orderID")]
    order_id: Option<String>,
    #[serde(default, rename = "transactionHash")]
    tx_hash: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default, rename = "errorMsg")]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderStatusResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "original_size")]
    original_size: Option<String>,
    #[serde(default, rename = "size_matched")]
    size_matched: Option<String>,
    #[serde(default)]
    price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(default)]
    balance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(default)]
    price: Option<String>,
}

// ============== Client ==============

/// Live CLOB client. Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct ClobClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_passphrase: Option<String>,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl ClobClient {
    pub fn new(cfg: &ExchangeConfig) -> ClobResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_seconds))
            .build()?;

        let rpm = NonZeroU32::new(cfg.rate_limit_rpm.max(1))
            .ok_or_else(|| ClobError::InvalidResponse("invalid rate limit".to_string()))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: cfg.clob_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            api_passphrase: cfg.api_passphrase.clone(),
            rate_limiter,
        })
    }

    fn decorate(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        if let Some(key) = &self.api_key {
            builder = builder.header("POLY-API-KEY", key);
        }
        if let Some(passphrase) = &self.api_passphrase {
            builder = builder.header("POLY-PASSPHRASE", passphrase);
        }
        builder
    }

    /// Rate-limited send with bounded retries for transient failures.
    /// 4xx responses are classified and returned without retry.
    async fn send_retrying<F>(&self, make: F) -> ClobResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error: Option<ClobError> = None;

        for attempt in 1..=GATEWAY_MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.decorate(make()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let body = response.text().await.unwrap_or_default();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        last_error = Some(ClobError::RateLimited);
                    } else if status.is_server_error() {
                        last_error = Some(ClobError::Server {
                            status: status.as_u16(),
                            body,
                        });
                    } else {
                        return Err(classify_rejection(status.as_u16(), &body));
                    }
                }
                Err(e) => {
                    last_error = Some(ClobError::Http(e));
                }
            }

            if attempt < GATEWAY_MAX_RETRIES {
                let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                let jitter = rand::random::<u64>() % 500;
                tracing::warn!(
                    "CLOB request failed ({}), retrying in {}ms (attempt {}/{})",
                    last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    backoff + jitter,
                    attempt,
                    GATEWAY_MAX_RETRIES
                );
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| ClobError::InvalidResponse("retries exhausted".to_string())))
    }

    async fn submit_order_request<B: Serialize>(&self, body: &B) -> ClobResult<OrderAck> {
        let url = format!("{}/order", self.base_url);
        let payload = serde_json::to_value(body)
            .map_err(|e| ClobError::InvalidResponse(e.to_string()))?;
        let response = self
            .send_retrying(|| self.client.post(&url).json(&payload))
            .await?;
        let ack: PlaceOrderResponse = response
            .json()
            .await
            .map_err(|e| ClobError::InvalidResponse(e.to_string()))?;

        if ack.success == Some(false) {
            let message = ack.error_msg.unwrap_or_else(|| "order refused".to_string());
            return Err(classify_rejection(400, &message));
        }
        let order_id = ack
            .order_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ClobError::InvalidResponse("no order id in response".to_string()))?;
        Ok(OrderAck {
            order_id,
            tx_hash: ack.tx_hash.filter(|h| !h.is_empty()),
        })
    }
}

#[async_trait]
impl Exchange for ClobClient {
    async fn place_order(
        &self,
        token_id: &str,
        side: OrderSide,
        price: f64,
        size: f64,
        order_type: OrderType,
    ) -> ClobResult<OrderAck> {
        self.submit_order_request(&PlaceOrderRequest {
            token_id,
            side: side_str(side),
            price,
            size,
            order_type,
        })
        .await
    }

    async fn place_market_order(
        &self,
        token_id: &str,
        side: OrderSide,
        amount: f64,
    ) -> ClobResult<OrderAck> {
        self.submit_order_request(&MarketOrderRequest {
            token_id,
            side: side_str(side),
            amount,
            order_type: OrderType::Fok,
        })
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> ClobResult<()> {
        let url = format!("{}/order", self.base_url);
        let payload = serde_json::json!({ "orderID": order_id });
        self.send_retrying(|| self.client.delete(&url).json(&payload))
            .await?;
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> ClobResult<OrderState> {
        let url = format!("{}/data/order/{}", self.base_url, order_id);
        let response = self.send_retrying(|| self.client.get(&url)).await?;
        let payload: OrderStatusResponse = response
            .json()
            .await
            .map_err(|e| ClobError::InvalidResponse(e.to_string()))?;

        let status = payload
            .status
            .as_deref()
            .map(ExchangeOrderStatus::parse)
            .unwrap_or(ExchangeOrderStatus::Unknown(String::new()));
        Ok(OrderState {
            order_id: payload.id.unwrap_or_else(|| order_id.to_string()),
            status,
            size: parse_numeric(payload.original_size.as_deref()).unwrap_or(0.0),
            size_matched: parse_numeric(payload.size_matched.as_deref()).unwrap_or(0.0),
            price: parse_numeric(payload.price.as_deref()).unwrap_or(0.0),
        })
    }

    async fn get_collateral_balance(&self) -> ClobResult<f64> {
        let url = format!("{}/balance-allowance?asset_type=COLLATERAL", self.base_url);
        let response = self.send_retrying(|| self.client.get(&url)).await?;
        let payload: BalanceResponse = response
            .json()
            .await
            .map_err(|e| ClobError::InvalidResponse(e.to_string()))?;
        normalize_base_units(payload.balance.as_deref())
            .ok_or_else(|| ClobError::InvalidResponse("missing balance".to_string()))
    }

    async fn get_token_balance(&self, token_id: &str) -> ClobResult<f64> {
        let url = format!(
            "{}/balance-allowance?asset_type=CONDITIONAL&token_id={}",
            self.base_url, token_id
        );
        let response = self.send_retrying(|| self.client.get(&url)).await?;
        let payload: BalanceResponse = response
            .json()
            .await
            .map_err(|e| ClobError::InvalidResponse(e.to_string()))?;
        normalize_base_units(payload.balance.as_deref())
            .ok_or_else(|| ClobError::InvalidResponse("missing balance".to_string()))
    }

    async fn get_sell_price(&self, token_id: &str) -> ClobResult<f64> {
        let url = format!("{}/price?token_id={}&side=sell", self.base_url, token_id);
        let response = self.send_retrying(|| self.client.get(&url)).await?;
        let payload: PriceResponse = response
            .json()
            .await
            .map_err(|e| ClobError::InvalidResponse(e.to_string()))?;
        parse_numeric(payload.price.as_deref())
            .ok_or_else(|| ClobError::InvalidResponse("missing price".to_string()))
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn parse_numeric(raw: Option<&str>) -> Option<f64> {
    raw?.trim().parse().ok()
}

/// The exchange reports balances as 6-decimal base units for large values
/// and plain unit amounts for small ones
fn normalize_base_units(raw: Option<&str>) -> Option<f64> {
    let text = raw?.trim();
    if text.is_empty() {
        return None;
    }
    let value: f64 = text.parse().ok()?;
    if !text.contains('.') && value > 1000.0 {
        return Some(value / 1_000_000.0);
    }
    Some(value)
}

/// Map a refusal body to a typed rejection. The only place response text
/// is inspected; callers branch on the code.
fn classify_rejection(status: u16, body: &str) -> ClobError {
    let lowered = body.to_lowercase();
    let code = if lowered.contains("not enough balance") || lowered.contains("insufficient balance")
    {
        RejectionCode::InsufficientBalance
    } else if lowered.contains("market") && (lowered.contains("closed") || lowered.contains("resolved"))
    {
        RejectionCode::MarketClosed
    } else if lowered.contains("invalid") {
        RejectionCode::InvalidOrder
    } else {
        RejectionCode::Other
    };
    ClobError::Rejected {
        code,
        message: format!("status {}: {}", status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_state(status: ExchangeOrderStatus, size: f64, matched: f64) -> OrderState {
        OrderState {
            order_id: "o-1".to_string(),
            status,
            size,
            size_matched: matched,
            price: 0.5,
        }
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(ExchangeOrderStatus::parse("MATCHED"), ExchangeOrderStatus::Matched);
        assert_eq!(ExchangeOrderStatus::parse("live"), ExchangeOrderStatus::Live);
        assert_eq!(ExchangeOrderStatus::parse("canceled"), ExchangeOrderStatus::Cancelled);
        assert_eq!(ExchangeOrderStatus::parse("CANCELLED"), ExchangeOrderStatus::Cancelled);
        assert_eq!(ExchangeOrderStatus::parse("rejected"), ExchangeOrderStatus::Rejected);
        assert_eq!(
            ExchangeOrderStatus::parse("weird"),
            ExchangeOrderStatus::Unknown("weird".to_string())
        );
    }

    #[test]
    fn test_filled_by_matched_size() {
        // Status still live but the book matched the full size
        let state = order_state(ExchangeOrderStatus::Live, 10.0, 10.0);
        assert!(state.is_filled());

        let partial = order_state(ExchangeOrderStatus::Live, 10.0, 4.0);
        assert!(!partial.is_filled());

        // Within the 0.1% rounding allowance
        let rounded = order_state(ExchangeOrderStatus::Live, 10.0, 9.995);
        assert!(rounded.is_filled());
    }

    #[test]
    fn test_terminal_without_fill() {
        let cancelled = order_state(ExchangeOrderStatus::Cancelled, 10.0, 0.0);
        assert!(cancelled.is_terminal_without_fill());

        // Cancelled after a full fill is not "without fill"
        let cancelled_filled = order_state(ExchangeOrderStatus::Cancelled, 10.0, 10.0);
        assert!(!cancelled_filled.is_terminal_without_fill());

        let live = order_state(ExchangeOrderStatus::Live, 10.0, 0.0);
        assert!(!live.is_terminal_without_fill());
    }

    #[test]
    fn test_error_classification() {
        let rejected = classify_rejection(400, "not enough balance / allowance");
        assert_eq!(rejected.kind(), FailureKind::Rejection);
        assert!(rejected.is_insufficient_balance());

        let closed = classify_rejection(400, "market is closed");
        assert_eq!(closed.rejection_code(), Some(RejectionCode::MarketClosed));

        let server = ClobError::Server {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(server.kind(), FailureKind::Transient);
        assert_eq!(ClobError::RateLimited.kind(), FailureKind::Transient);
    }

    #[test]
    fn test_normalize_base_units() {
        // 6-decimal integer base units
        assert_eq!(normalize_base_units(Some("12500000")), Some(12.5));
        // Already in units
        assert_eq!(normalize_base_units(Some("12.5")), Some(12.5));
        // Small integer-like values kept raw to avoid false underflow
        assert_eq!(normalize_base_units(Some("900")), Some(900.0));
        assert_eq!(normalize_base_units(Some("")), None);
        assert_eq!(normalize_base_units(None), None);
    }

    #[tokio::test]
    async fn test_get_order_via_http() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/data/order/abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"abc","status":"LIVE","original_size":"10","size_matched":"4","price":"0.45"}"#,
            )
            .create_async()
            .await;

        let cfg = ExchangeConfig {
            clob_url: server.url(),
            ..ExchangeConfig::default()
        };
        let client = ClobClient::new(&cfg).unwrap();
        let state = client.get_order("abc").await.unwrap();

        mock.assert_async().await;
        assert_eq!(state.status, ExchangeOrderStatus::Live);
        assert!((state.size - 10.0).abs() < 1e-9);
        assert!((state.size_matched - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/order")
            .with_status(400)
            .with_body("not enough balance / allowance")
            .expect(1)
            .create_async()
            .await;

        let cfg = ExchangeConfig {
            clob_url: server.url(),
            ..ExchangeConfig::default()
        };
        let client = ClobClient::new(&cfg).unwrap();
        let result = client
            .place_order("tok", OrderSide::Buy, 0.5, 10.0, OrderType::Gtc)
            .await;

        mock.assert_async().await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Rejection);
        assert!(err.is_insufficient_balance());
    }
}
