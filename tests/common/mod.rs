//! Shared test doubles: a scripted exchange, a static market feed and a
//! recording notifier.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use polybot::api::clob::{
    ClobError, ClobResult, Exchange, ExchangeOrderStatus, OrderAck, OrderState, OrderType,
    RejectionCode,
};
use polybot::api::gamma::{MarketFeed, MarketSnapshot};
use polybot::models::{Direction, OrderSide, WindowCandle};
use polybot::notify::{LifecycleEvent, Notifier};
use polybot::presets::MonitorPreset;

/// How a placed order behaves on the scripted book
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillPlan {
    /// Fills in full on the first status poll
    Immediate,
    /// Sits live until cancelled
    Never,
    /// Placement is refused with an insufficient-balance rejection
    RejectBalance,
}

#[derive(Debug, Clone)]
struct BookOrder {
    plan: FillPlan,
    price: f64,
    size: f64,
    matched: f64,
    cancelled: bool,
    status_override: Option<ExchangeOrderStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
}

/// Scripted exchange. Buys and sells each follow their configured plan;
/// individual orders can be overridden to simulate external fills.
pub struct MockExchange {
    pub buy_plan: Mutex<FillPlan>,
    pub sell_plan: Mutex<FillPlan>,
    pub collateral: Mutex<f64>,
    pub token_balance: Mutex<f64>,
    pub sell_price: Mutex<f64>,
    orders: Mutex<HashMap<String, BookOrder>>,
    placed: Mutex<Vec<PlacedOrder>>,
    next_id: Mutex<u32>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            buy_plan: Mutex::new(FillPlan::Immediate),
            sell_plan: Mutex::new(FillPlan::Immediate),
            collateral: Mutex::new(1000.0),
            token_balance: Mutex::new(0.0),
            sell_price: Mutex::new(0.5),
            orders: Mutex::new(HashMap::new()),
            placed: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    pub fn set_buy_plan(&self, plan: FillPlan) {
        *self.buy_plan.lock().unwrap() = plan;
    }

    pub fn set_sell_plan(&self, plan: FillPlan) {
        *self.sell_plan.lock().unwrap() = plan;
    }

    pub fn set_collateral(&self, value: f64) {
        *self.collateral.lock().unwrap() = value;
    }

    pub fn set_sell_price(&self, value: f64) {
        *self.sell_price.lock().unwrap() = value;
    }

    pub fn placements(&self) -> Vec<PlacedOrder> {
        self.placed.lock().unwrap().clone()
    }

    /// Seed an order the "previous process" left on the book
    pub fn seed_order(
        &self,
        order_id: &str,
        status: ExchangeOrderStatus,
        price: f64,
        size: f64,
        matched: f64,
    ) {
        self.orders.lock().unwrap().insert(
            order_id.to_string(),
            BookOrder {
                plan: FillPlan::Never,
                price,
                size,
                matched,
                cancelled: false,
                status_override: Some(status),
            },
        );
    }

    /// Flip an existing order to fully filled (e.g. a resting exit that
    /// the market took)
    pub fn fill_order(&self, order_id: &str) {
        if let Some(order) = self.orders.lock().unwrap().get_mut(order_id) {
            order.matched = order.size;
            order.status_override = Some(ExchangeOrderStatus::Matched);
        }
    }

    fn plan_for(&self, side: OrderSide) -> FillPlan {
        match side {
            OrderSide::Buy => *self.buy_plan.lock().unwrap(),
            OrderSide::Sell => *self.sell_plan.lock().unwrap(),
        }
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn place_order(
        &self,
        _token_id: &str,
        side: OrderSide,
        price: f64,
        size: f64,
        _order_type: OrderType,
    ) -> ClobResult<OrderAck> {
        let plan = self.plan_for(side);
        if plan == FillPlan::RejectBalance {
            return Err(ClobError::Rejected {
                code: RejectionCode::InsufficientBalance,
                message: "not enough balance / allowance".to_string(),
            });
        }
        self.placed
            .lock()
            .unwrap()
            .push(PlacedOrder { side, price, size });

        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let order_id = format!("mock-{}", next_id);
        self.orders.lock().unwrap().insert(
            order_id.clone(),
            BookOrder {
                plan,
                price,
                size,
                matched: 0.0,
                cancelled: false,
                status_override: None,
            },
        );
        Ok(OrderAck {
            order_id,
            tx_hash: None,
        })
    }

    async fn place_market_order(
        &self,
        token_id: &str,
        side: OrderSide,
        amount: f64,
    ) -> ClobResult<OrderAck> {
        let price = *self.sell_price.lock().unwrap();
        let ack = self
            .place_order(token_id, side, price, amount, OrderType::Fok)
            .await?;
        self.fill_order(&ack.order_id);
        Ok(ack)
    }

    async fn cancel_order(&self, order_id: &str) -> ClobResult<()> {
        if let Some(order) = self.orders.lock().unwrap().get_mut(order_id) {
            order.cancelled = true;
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> ClobResult<OrderState> {
        let orders = self.orders.lock().unwrap();
        let order = orders
            .get(order_id)
            .ok_or_else(|| ClobError::InvalidResponse(format!("unknown order {}", order_id)))?;

        let (status, matched) = if let Some(status) = &order.status_override {
            (status.clone(), order.matched.max(
                if *status == ExchangeOrderStatus::Matched {
                    order.size
                } else {
                    0.0
                },
            ))
        } else {
            match order.plan {
                FillPlan::Immediate => (ExchangeOrderStatus::Matched, order.size),
                FillPlan::Never | FillPlan::RejectBalance => {
                    if order.cancelled {
                        (ExchangeOrderStatus::Cancelled, order.matched)
                    } else {
                        (ExchangeOrderStatus::Live, order.matched)
                    }
                }
            }
        };

        Ok(OrderState {
            order_id: order_id.to_string(),
            status,
            size: order.size,
            size_matched: matched,
            price: order.price,
        })
    }

    async fn get_collateral_balance(&self) -> ClobResult<f64> {
        Ok(*self.collateral.lock().unwrap())
    }

    async fn get_token_balance(&self, _token_id: &str) -> ClobResult<f64> {
        Ok(*self.token_balance.lock().unwrap())
    }

    async fn get_sell_price(&self, _token_id: &str) -> ClobResult<f64> {
        Ok(*self.sell_price.lock().unwrap())
    }
}

/// Market feed returning canned snapshots by slug
pub struct StaticFeed {
    snapshots: Mutex<HashMap<String, MarketSnapshot>>,
}

impl StaticFeed {
    pub fn empty() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_market(slug: &str, up_price: f64, down_price: f64) -> Self {
        let feed = Self::empty();
        feed.add_market(slug, up_price, down_price);
        feed
    }

    pub fn add_market(&self, slug: &str, up_price: f64, down_price: f64) {
        self.snapshots.lock().unwrap().insert(
            slug.to_string(),
            MarketSnapshot {
                slug: slug.to_string(),
                up_price: Some(up_price),
                down_price: Some(down_price),
                up_token_id: Some(format!("{}-up", slug)),
                down_token_id: Some(format!("{}-down", slug)),
            },
        );
    }
}

#[async_trait]
impl MarketFeed for StaticFeed {
    async fn market_snapshot(&self, slug: &str) -> polybot::Result<Option<MarketSnapshot>> {
        Ok(self.snapshots.lock().unwrap().get(slug).cloned())
    }
}

/// Captures lifecycle events for assertions
pub struct RecordingNotifier {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: LifecycleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A contiguous run of official candles ending just before `current_start`
pub fn streak_candles(
    preset: &MonitorPreset,
    current_start: DateTime<Utc>,
    directions: &[Direction],
) -> Vec<WindowCandle> {
    let step = Duration::seconds(preset.window_seconds);
    directions
        .iter()
        .enumerate()
        .map(|(index, direction)| {
            let start = current_start - step * (index as i32 + 1);
            let (open, close) = match direction {
                Direction::Up => (100.0, 101.0),
                Direction::Down => (100.0, 99.0),
            };
            WindowCandle {
                series_slug: preset.series_slug.clone(),
                window_start: start,
                window_end: start + step,
                open: Some(open),
                close: Some(close),
                delta: Some(close - open),
                direction: Some(*direction),
                open_official: true,
                close_official: true,
                source: "polymarket".to_string(),
                updated_at: current_start,
            }
        })
        .collect()
}
