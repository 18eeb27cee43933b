//! Order Retry Engine: places, monitors, re-prices and cancels limit
//! orders until an intent is filled or terminally failed.
//!
//! One intent may span several exchange orders (the lineage). Fills are
//! accumulated per order id, so a cancelled-then-resubmitted order never
//! double-counts, and a partially filled order is re-submitted only for
//! the remaining size.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::api::clob::{
    ClobResult, Exchange, ExchangeOrderStatus, OrderAck, OrderState, OrderType, RejectionCode,
};
use crate::api::FailureKind;
use crate::config::RetryPolicyConfig;
use crate::models::OrderSide;

/// What the caller wants executed
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub token_id: String,
    pub side: OrderSide,
    pub size: f64,
    pub reference_price: f64,
}

/// Accumulated result of one intent's order lineage
#[derive(Debug, Clone, PartialEq)]
pub struct FillReport {
    pub filled_size: f64,
    pub avg_price: f64,
    pub order_ids: Vec<String>,
    pub attempts: u32,
    /// Filled via the market-style fallback after limit retries ran out
    pub fallback: bool,
}

impl FillReport {
    fn empty() -> Self {
        Self {
            filled_size: 0.0,
            avg_price: 0.0,
            order_ids: Vec::new(),
            attempts: 0,
            fallback: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Exchange refused the order; terminal, never retried
    Rejected {
        code: RejectionCode,
        message: String,
    },
    /// Limit retries exhausted and no fallback configured (or it failed)
    RetriesExhausted,
    /// Intent size floored to zero
    InvalidSize,
}

/// Terminal outcome of `execute`
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled(FillReport),
    Failed {
        reason: FailureReason,
        /// Whatever did fill before the failure; may be zero
        partial: FillReport,
    },
}

/// Truncate an order size to the exchange's accepted precision
pub fn floor_order_size(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value.max(0.0) * factor).floor() / factor
}

fn clamp_price(price: f64) -> f64 {
    price.clamp(0.01, 0.99)
}

/// Running fill ledger keyed by order id; re-reads of the same order
/// overwrite rather than add
struct FillLedger {
    by_order: HashMap<String, (f64, f64)>,
}

impl FillLedger {
    fn new() -> Self {
        Self {
            by_order: HashMap::new(),
        }
    }

    fn record(&mut self, order_id: &str, state: &OrderState, limit_price: f64) {
        if state.size_matched <= 0.0 {
            return;
        }
        let price = if state.price > 0.0 {
            state.price
        } else {
            limit_price
        };
        self.by_order
            .insert(order_id.to_string(), (state.size_matched, price));
    }

    fn record_assumed(&mut self, order_id: &str, size: f64, price: f64) {
        self.by_order.insert(order_id.to_string(), (size, price));
    }

    fn total_filled(&self) -> f64 {
        self.by_order.values().map(|(size, _)| size).sum()
    }

    fn avg_price(&self) -> f64 {
        let total = self.total_filled();
        if total <= 0.0 {
            return 0.0;
        }
        let cost: f64 = self
            .by_order
            .values()
            .map(|(size, price)| size * price)
            .sum();
        cost / total
    }
}

pub struct OrderRetryEngine {
    exchange: Arc<dyn Exchange>,
}

impl OrderRetryEngine {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self { exchange }
    }

    /// Place a GTC order and return immediately; used for the resting
    /// target exit the monitor watches across ticks.
    pub async fn submit_resting(&self, intent: &OrderIntent) -> ClobResult<OrderAck> {
        self.exchange
            .place_order(
                &intent.token_id,
                intent.side,
                clamp_price(intent.reference_price),
                intent.size,
                OrderType::Gtc,
            )
            .await
    }

    /// Poll an order until it reaches a conclusive state or the timeout
    /// elapses; returns the last state seen.
    pub async fn probe_order(
        &self,
        order_id: &str,
        timeout: Duration,
        poll: Duration,
    ) -> ClobResult<OrderState> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last: Option<OrderState> = None;
        loop {
            match self.exchange.get_order(order_id).await {
                Ok(state) => {
                    let conclusive = state.is_filled() || state.is_terminal_without_fill();
                    last = Some(state);
                    if conclusive {
                        break;
                    }
                }
                Err(e) if e.kind() == FailureKind::Transient => {
                    tracing::debug!("order probe transient failure: {}", e);
                }
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }
        last.ok_or_else(|| {
            crate::api::ClobError::InvalidResponse(format!("no state for order {}", order_id))
        })
    }

    /// Execute an intent to a terminal outcome under the given policy.
    pub async fn execute(&self, intent: &OrderIntent, policy: &RetryPolicyConfig) -> OrderOutcome {
        let mut ledger = FillLedger::new();
        let mut order_ids: Vec<String> = Vec::new();
        let mut price = clamp_price(intent.reference_price);
        let mut remaining = floor_order_size(intent.size, policy.size_decimals);
        let target = intent.size * 0.999;
        let poll = Duration::from_millis(policy.poll_interval_ms);
        let attempt_timeout = Duration::from_secs(policy.attempt_timeout_seconds);
        let mut balance_shrunk = false;

        if remaining <= 0.0 {
            return OrderOutcome::Failed {
                reason: FailureReason::InvalidSize,
                partial: FillReport::empty(),
            };
        }

        let mut attempts = 0u32;
        while attempts < policy.max_retries {
            attempts += 1;

            let ack = match self
                .exchange
                .place_order(&intent.token_id, intent.side, price, remaining, OrderType::Gtc)
                .await
            {
                Ok(ack) => ack,
                Err(e) => match e.kind() {
                    FailureKind::Rejection => {
                        // One balance-shrink pass for sells: the wallet may
                        // hold slightly less than the recorded fill size
                        if intent.side == OrderSide::Sell
                            && e.is_insufficient_balance()
                            && !balance_shrunk
                        {
                            balance_shrunk = true;
                            if let Some(shrunk) = self
                                .shrunk_sell_size(&intent.token_id, remaining, policy)
                                .await
                            {
                                tracing::warn!(
                                    "sell size {} exceeds balance, shrinking to {}",
                                    remaining,
                                    shrunk
                                );
                                remaining = shrunk;
                                attempts -= 1;
                                continue;
                            }
                        }
                        let (code, message) = match e {
                            crate::api::ClobError::Rejected { code, message } => (code, message),
                            other => (RejectionCode::Other, other.to_string()),
                        };
                        return OrderOutcome::Failed {
                            reason: FailureReason::Rejected { code, message },
                            partial: self.report(&ledger, &order_ids, attempts, false),
                        };
                    }
                    FailureKind::Transient => {
                        tracing::warn!(
                            "order placement attempt {}/{} failed: {}",
                            attempts,
                            policy.max_retries,
                            e
                        );
                        self.pause_between_attempts(poll).await;
                        continue;
                    }
                },
            };
            order_ids.push(ack.order_id.clone());

            // Watch the order until filled, terminal, or attempt timeout
            let deadline = tokio::time::Instant::now() + attempt_timeout;
            let mut terminal_reject = false;
            loop {
                match self.exchange.get_order(&ack.order_id).await {
                    Ok(state) => {
                        ledger.record(&ack.order_id, &state, price);
                        if state.is_filled() {
                            // A filled status without a reported match size
                            // means the full remainder went through
                            if state.size_matched <= 0.0 {
                                ledger.record_assumed(&ack.order_id, remaining, price);
                            }
                            if ledger.total_filled() >= target {
                                return OrderOutcome::Filled(self.report(
                                    &ledger,
                                    &order_ids,
                                    attempts,
                                    false,
                                ));
                            }
                            break;
                        }
                        if state.status == ExchangeOrderStatus::Rejected {
                            terminal_reject = true;
                            break;
                        }
                        if state.is_terminal_without_fill() {
                            // Cancelled or expired out from under us; fall
                            // through to the next attempt
                            break;
                        }
                    }
                    Err(e) if e.kind() == FailureKind::Transient => {
                        tracing::debug!("status poll failed, keeping attempt alive: {}", e);
                    }
                    Err(e) => {
                        tracing::warn!("status poll rejected: {}", e);
                        break;
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    // Unfilled after the attempt budget: cancel, then read
                    // back the final matched size before re-pricing
                    if let Err(e) = self.exchange.cancel_order(&ack.order_id).await {
                        tracing::warn!("cancel of {} failed: {}", ack.order_id, e);
                    }
                    if let Ok(final_state) = self.exchange.get_order(&ack.order_id).await {
                        ledger.record(&ack.order_id, &final_state, price);
                    }
                    break;
                }
                tokio::time::sleep(poll).await;
            }

            if terminal_reject {
                return OrderOutcome::Failed {
                    reason: FailureReason::Rejected {
                        code: RejectionCode::Other,
                        message: format!("order {} rejected by exchange", ack.order_id),
                    },
                    partial: self.report(&ledger, &order_ids, attempts, false),
                };
            }

            if ledger.total_filled() >= target {
                return OrderOutcome::Filled(self.report(&ledger, &order_ids, attempts, false));
            }

            remaining = floor_order_size(intent.size - ledger.total_filled(), policy.size_decimals);
            if remaining <= 0.0 {
                return OrderOutcome::Filled(self.report(&ledger, &order_ids, attempts, false));
            }

            price = self.step_price(price, intent, policy);
            self.pause_between_attempts(poll).await;
        }

        if policy.market_fallback {
            if let Some(report) = self
                .market_fallback(intent, remaining, &mut ledger, &mut order_ids, attempts, poll)
                .await
            {
                return OrderOutcome::Filled(report);
            }
        }

        OrderOutcome::Failed {
            reason: FailureReason::RetriesExhausted,
            partial: self.report(&ledger, &order_ids, attempts, false),
        }
    }

    /// Step the limit price one notch toward fill probability, inside the
    /// slippage budget: buys pay up, sells come down.
    fn step_price(&self, current: f64, intent: &OrderIntent, policy: &RetryPolicyConfig) -> f64 {
        let stepped = match intent.side {
            OrderSide::Buy => current + policy.price_step,
            OrderSide::Sell => current - policy.price_step,
        };
        let (floor, ceil) = match intent.side {
            OrderSide::Buy => (
                intent.reference_price,
                intent.reference_price + policy.max_slippage,
            ),
            OrderSide::Sell => (
                intent.reference_price - policy.max_slippage,
                intent.reference_price,
            ),
        };
        clamp_price(stepped.clamp(floor, ceil))
    }

    async fn shrunk_sell_size(
        &self,
        token_id: &str,
        current: f64,
        policy: &RetryPolicyConfig,
    ) -> Option<f64> {
        let refreshed = match self.exchange.get_token_balance(token_id).await {
            Ok(balance) if balance > 0.0 => {
                floor_order_size(balance - 1e-6, policy.size_decimals)
            }
            _ => floor_order_size(current * 0.98, policy.size_decimals),
        };
        if refreshed > 0.0 && refreshed < current {
            Some(refreshed)
        } else {
            let fallback = floor_order_size(current * 0.98, policy.size_decimals);
            (fallback > 0.0 && fallback < current).then_some(fallback)
        }
    }

    async fn market_fallback(
        &self,
        intent: &OrderIntent,
        remaining: f64,
        ledger: &mut FillLedger,
        order_ids: &mut Vec<String>,
        attempts: u32,
        poll: Duration,
    ) -> Option<FillReport> {
        // Market orders quote an amount: USD spent for buys, shares for sells
        let amount = match intent.side {
            OrderSide::Buy => remaining * clamp_price(intent.reference_price + 0.05),
            OrderSide::Sell => remaining,
        };
        tracing::warn!(
            "limit retries exhausted for {}, falling back to market order",
            intent.token_id
        );
        let ack = match self
            .exchange
            .place_market_order(&intent.token_id, intent.side, amount)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!("market fallback failed: {}", e);
                return None;
            }
        };
        order_ids.push(ack.order_id.clone());

        match self
            .probe_order(&ack.order_id, Duration::from_secs(5), poll)
            .await
        {
            Ok(state) if state.is_filled() => {
                if state.size_matched > 0.0 {
                    ledger.record(&ack.order_id, &state, intent.reference_price);
                } else {
                    ledger.record_assumed(&ack.order_id, remaining, intent.reference_price);
                }
                Some(self.report(ledger, order_ids, attempts + 1, true))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::error!("market fallback probe failed: {}", e);
                None
            }
        }
    }

    async fn pause_between_attempts(&self, poll: Duration) {
        let jitter = rand::random::<u64>() % 250;
        tokio::time::sleep(poll + Duration::from_millis(jitter)).await;
    }

    fn report(
        &self,
        ledger: &FillLedger,
        order_ids: &[String],
        attempts: u32,
        fallback: bool,
    ) -> FillReport {
        FillReport {
            filled_size: ledger.total_filled(),
            avg_price: ledger.avg_price(),
            order_ids: order_ids.to_vec(),
            attempts,
            fallback,
        }
    }
}
