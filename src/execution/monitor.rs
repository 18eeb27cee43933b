//! Position Monitor: one per preset, driven by scheduler ticks.
//!
//! States run Idle → Entering → Open → Exiting → Idle, with Failed
//! reachable from the entry and exit legs. Each tick makes at most one
//! lifecycle decision; the engine call inside a tick is the only
//! suspension point that waits on the exchange. Terminal outcomes emit
//! exactly one notification; transient retries emit none.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

use crate::api::clob::Exchange;
use crate::api::gamma::MarketFeed;
use crate::config::TradingConfig;
use crate::db::TradeStore;
use crate::execution::order_engine::{
    floor_order_size, OrderIntent, OrderOutcome, OrderRetryEngine,
};
use crate::execution::position_manager::{EntryPlan, PositionManager};
use crate::market::{resolve_entry_token, Resolution};
use crate::models::{
    ExitReason, HistoryRecord, OrderSide, PositionStatus, RecordKind, RecordOrigin, TradeOutcome,
};
use crate::notify::{LifecycleEvent, Notifier};
use crate::presets::{MonitorPreset, Window};
use crate::risk::TradeLimits;
use crate::strategy::{current_streak, entry_signal};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Entering,
    Open,
    Exiting,
}

/// What a tick decided, for the loop's logs and for tests
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NoAction,
    /// Entry conditions not yet satisfiable (market unlisted, transient
    /// balance failure); retried next tick within the entry span
    Deferred(String),
    /// Entry refused as a decision outcome; window skipped
    EntrySkipped(String),
    Entered,
    EntryFailed(String),
    Exited(ExitReason),
    ExitFailed(String),
}

pub struct PositionMonitor {
    preset: MonitorPreset,
    trading: TradingConfig,
    limits: TradeLimits,
    engine: OrderRetryEngine,
    exchange: Arc<dyn Exchange>,
    feed: Arc<dyn MarketFeed>,
    store: Arc<dyn TradeStore>,
    notifier: Arc<dyn Notifier>,
    positions: PositionManager,
    state: MonitorState,
    exit_failure_notified: bool,
    close_requested: bool,
}

impl PositionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        preset: MonitorPreset,
        trading: TradingConfig,
        limits: TradeLimits,
        exchange: Arc<dyn Exchange>,
        feed: Arc<dyn MarketFeed>,
        store: Arc<dyn TradeStore>,
        notifier: Arc<dyn Notifier>,
        positions: PositionManager,
    ) -> Self {
        Self {
            preset,
            trading,
            limits,
            engine: OrderRetryEngine::new(exchange.clone()),
            exchange,
            feed,
            store,
            notifier,
            positions,
            state: MonitorState::Idle,
            exit_failure_notified: false,
            close_requested: false,
        }
    }

    pub fn preset(&self) -> &MonitorPreset {
        &self.preset
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    /// Operator-requested close; honored on the next tick
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// One scheduler tick. Never panics the loop; the caller logs errors.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        match self.positions.active_position().map(|p| (p.id, p.status)) {
            None => self.try_enter(now).await,
            Some((id, PositionStatus::Pending)) => self.recover_position(id, now).await,
            Some((id, _)) => self.manage_open(id, now).await,
        }
    }

    // ------------------------------------------------------------------
    // Entry leg
    // ------------------------------------------------------------------

    async fn try_enter(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.state = MonitorState::Idle;
        let window = self.preset.window_containing(now);

        if now - window.start > Duration::seconds(self.trading.entry_span_seconds) {
            return Ok(TickOutcome::NoAction);
        }
        if self.positions.window_attempted(&window) {
            return Ok(TickOutcome::NoAction);
        }

        // Streak signal from the contiguous closed windows before this one
        let candles = self
            .store
            .load_candles_before(
                &self.preset.series_slug,
                window.start,
                self.trading.pattern_max as i64 + 1,
            )
            .await?;
        let streak = current_streak(&candles, &window, self.preset.window_seconds);
        self.store
            .save_streak(&self.preset.series_slug, streak, window.start)
            .await?;

        let side = match entry_signal(streak, self.trading.pattern_trigger, self.trading.pattern_max)
        {
            Some(side) => side,
            None => return Ok(TickOutcome::NoAction),
        };

        self.state = MonitorState::Entering;

        let resolution = resolve_entry_token(
            self.feed.as_ref(),
            &self.preset,
            &window,
            side,
            StdDuration::from_secs(self.trading.resolve_wait_seconds),
            StdDuration::from_millis(self.trading.resolve_poll_ms),
        )
        .await;

        let (token_id, entry_price, market_slug) = match resolution {
            Resolution::Resolved {
                token_id,
                price: Some(price),
                slug,
            } if price > 0.0 => (token_id, price, slug),
            Resolution::Resolved { slug, .. } => {
                self.state = MonitorState::Idle;
                return Ok(TickOutcome::Deferred(format!(
                    "market {} listed without a quote yet",
                    slug
                )));
            }
            Resolution::Unresolved => {
                self.state = MonitorState::Idle;
                return Ok(TickOutcome::Deferred(
                    "market not resolvable yet".to_string(),
                ));
            }
        };

        let shares = self.trading.shares;
        if let Err(breach) = self.limits.check(shares, entry_price) {
            return self
                .skip_entry(&window, &market_slug, breach.to_string())
                .await;
        }

        // Balance shortfall is a decision outcome; a fetch failure is a
        // transient fault and defers instead
        let balance = match self.exchange.get_collateral_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                self.state = MonitorState::Idle;
                return Ok(TickOutcome::Deferred(format!(
                    "balance check unavailable: {}",
                    e
                )));
            }
        };
        let required = shares * entry_price;
        if balance < required {
            return self
                .skip_entry(
                    &window,
                    &market_slug,
                    format!("insufficient balance (${:.2} < ${:.2})", balance, required),
                )
                .await;
        }

        let target_exit_price =
            (entry_price + self.trading.target_spread).clamp(0.01, 0.99);
        let position_id = self.positions.begin_entry(EntryPlan {
            market_slug: market_slug.clone(),
            token_id: token_id.clone(),
            side,
            window,
            reference_price: entry_price,
            size: shares,
            target_exit_price,
            entry_time: now,
        })?;
        self.save_position(position_id).await?;

        let intent = OrderIntent {
            token_id,
            side: OrderSide::Buy,
            size: shares,
            reference_price: entry_price,
        };
        match self.engine.execute(&intent, &self.trading.entry_retry).await {
            OrderOutcome::Filled(report) => {
                self.finish_entry(position_id, report.avg_price, report.filled_size, &report.order_ids, now)
                    .await?;
                Ok(TickOutcome::Entered)
            }
            OrderOutcome::Failed { reason, partial } if partial.filled_size > 0.0 => {
                // Part of the entry is on the books; holding it beats
                // abandoning tokens we paid for
                tracing::warn!(
                    preset = %self.preset.series_slug,
                    "entry partially filled ({:.4} of {:.4}) before failure: {:?}",
                    partial.filled_size,
                    shares,
                    reason
                );
                self.finish_entry(
                    position_id,
                    partial.avg_price,
                    partial.filled_size,
                    &partial.order_ids,
                    now,
                )
                .await?;
                Ok(TickOutcome::Entered)
            }
            OrderOutcome::Failed { reason, .. } => {
                self.positions.mark_failed(position_id)?;
                self.save_position(position_id).await?;
                self.state = MonitorState::Idle;
                let detail = format!("{:?}", reason);
                self.notifier
                    .notify(LifecycleEvent::EntryFailed {
                        preset_slug: self.preset.series_slug.clone(),
                        market_slug,
                        reason: detail.clone(),
                    })
                    .await;
                Ok(TickOutcome::EntryFailed(detail))
            }
        }
    }

    async fn skip_entry(
        &mut self,
        window: &Window,
        market_slug: &str,
        reason: String,
    ) -> Result<TickOutcome> {
        let id = self.positions.record_failed_entry(window, market_slug);
        self.save_position(id).await?;
        self.state = MonitorState::Idle;
        self.notifier
            .notify(LifecycleEvent::EntrySkipped {
                preset_slug: self.preset.series_slug.clone(),
                reason: reason.clone(),
            })
            .await;
        Ok(TickOutcome::EntrySkipped(reason))
    }

    async fn finish_entry(
        &mut self,
        position_id: Uuid,
        entry_price: f64,
        size: f64,
        order_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.positions.confirm_entry(
            position_id,
            entry_price,
            size,
            order_ids.first().cloned(),
        )?;
        self.save_position(position_id).await?;

        let position = self
            .positions
            .get(position_id)
            .cloned()
            .ok_or("entry position vanished")?;

        self.append_record(
            RecordKind::Open,
            position.window_start,
            Some(position_id),
            entry_price,
            None,
            now,
        )
        .await?;

        self.notifier
            .notify(LifecycleEvent::EntryFilled {
                preset_slug: self.preset.series_slug.clone(),
                market_slug: position.market_slug.clone(),
                side: position.side,
                price: entry_price,
                size,
            })
            .await;

        // Rest the target exit on the book right away
        let resting = OrderIntent {
            token_id: position.token_id.clone(),
            side: OrderSide::Sell,
            size,
            reference_price: position.target_exit_price,
        };
        match self.engine.submit_resting(&resting).await {
            Ok(ack) => {
                self.positions
                    .set_exit_order(position_id, Some(ack.order_id))?;
                self.save_position(position_id).await?;
            }
            Err(e) => {
                // Window-end forced close still covers the position
                tracing::warn!(
                    preset = %self.preset.series_slug,
                    "resting exit order failed to place: {}",
                    e
                );
            }
        }

        self.state = MonitorState::Open;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Open position management
    // ------------------------------------------------------------------

    async fn manage_open(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.state = MonitorState::Open;
        let position = self
            .positions
            .get(id)
            .cloned()
            .ok_or("active position vanished")?;

        // Resting target exit first: capture a fill before forcing anything
        if let Some(exit_order_id) = &position.exit_order_id {
            match self.exchange.get_order(exit_order_id).await {
                Ok(state) if state.is_filled() => {
                    let price = if state.price > 0.0 {
                        state.price
                    } else {
                        position.target_exit_price
                    };
                    return self.complete_close(id, price, ExitReason::Target, now).await;
                }
                Ok(state) if state.is_terminal_without_fill() => {
                    // Died on the book; forced close will cover the window
                    self.positions.set_exit_order(id, None)?;
                    self.save_position(id).await?;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("resting exit probe failed: {}", e);
                }
            }
        }

        if self.close_requested {
            return self.force_exit(id, ExitReason::Manual, now).await;
        }

        // Urgency: the token's bid fell too far below entry
        if let Ok(sell_price) = self.exchange.get_sell_price(&position.token_id).await {
            if position.entry_price - sell_price >= self.trading.urgency_price_drop {
                return self.force_exit(id, ExitReason::Urgency, now).await;
            }
        }

        let close_at = position.window_end - Duration::seconds(self.trading.close_margin_seconds);
        if now >= close_at {
            return self.force_exit(id, ExitReason::WindowEnd, now).await;
        }

        Ok(TickOutcome::NoAction)
    }

    async fn force_exit(
        &mut self,
        id: Uuid,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        self.state = MonitorState::Exiting;
        self.positions.mark_closing(id)?;
        self.save_position(id).await?;

        let position = self
            .positions
            .get(id)
            .cloned()
            .ok_or("closing position vanished")?;

        // Pull the resting order off the book, folding in whatever filled
        let mut resting_filled = 0.0;
        let mut resting_price = position.target_exit_price;
        if let Some(exit_order_id) = &position.exit_order_id {
            if let Err(e) = self.exchange.cancel_order(exit_order_id).await {
                tracing::warn!("cancel of resting exit {} failed: {}", exit_order_id, e);
            }
            if let Ok(state) = self.exchange.get_order(exit_order_id).await {
                if state.size_matched > 0.0 {
                    resting_filled = state.size_matched;
                    if state.price > 0.0 {
                        resting_price = state.price;
                    }
                }
            }
            self.positions.set_exit_order(id, None)?;
            self.save_position(id).await?;
        }

        let remaining = floor_order_size(
            position.size - resting_filled,
            self.trading.exit_retry.size_decimals,
        );
        if remaining <= 0.0 {
            return self
                .complete_close(id, resting_price, ExitReason::Target, now)
                .await;
        }

        let reference_price = match self.exchange.get_sell_price(&position.token_id).await {
            Ok(price) if price > 0.0 => price,
            _ => position.entry_price,
        };

        let intent = OrderIntent {
            token_id: position.token_id.clone(),
            side: OrderSide::Sell,
            size: remaining,
            reference_price,
        };
        match self.engine.execute(&intent, &self.trading.exit_retry).await {
            OrderOutcome::Filled(report) => {
                // Blend the resting partial into the realized exit price
                let total = resting_filled + report.filled_size;
                let price = if total > 0.0 {
                    (resting_filled * resting_price + report.filled_size * report.avg_price)
                        / total
                } else {
                    report.avg_price
                };
                self.complete_close(id, price, reason, now).await
            }
            OrderOutcome::Failed { reason: fail, partial } => {
                if partial.filled_size > 0.0 {
                    tracing::warn!(
                        preset = %self.preset.series_slug,
                        "forced exit partially filled ({:.4}); retrying remainder next tick",
                        partial.filled_size
                    );
                }
                // Never abandon the position: back to Open, retried on the
                // next tick
                self.positions.mark_open(id)?;
                self.save_position(id).await?;
                self.state = MonitorState::Open;

                let detail = format!("{:?}", fail);
                if !self.exit_failure_notified {
                    self.exit_failure_notified = true;
                    self.notifier
                        .notify(LifecycleEvent::ExitFailed {
                            preset_slug: self.preset.series_slug.clone(),
                            market_slug: position.market_slug.clone(),
                            reason: detail.clone(),
                        })
                        .await;
                }
                Ok(TickOutcome::ExitFailed(detail))
            }
        }
    }

    async fn complete_close(
        &mut self,
        id: Uuid,
        price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let outcome = self.positions.close_position(id, price, reason, now)?;
        self.save_position(id).await?;

        let position = self
            .positions
            .get(id)
            .cloned()
            .ok_or("closed position vanished")?;

        self.append_record(
            RecordKind::Close,
            position.window_start,
            Some(id),
            price,
            Some(outcome),
            now,
        )
        .await?;

        self.notifier
            .notify(LifecycleEvent::ExitFilled {
                preset_slug: self.preset.series_slug.clone(),
                market_slug: position.market_slug.clone(),
                price,
                size: position.size,
                reason,
                outcome,
                pnl: position.realized_pnl.unwrap_or(0.0),
            })
            .await;

        self.exit_failure_notified = false;
        self.close_requested = false;
        self.state = MonitorState::Idle;
        Ok(TickOutcome::Exited(reason))
    }

    // ------------------------------------------------------------------
    // Restart recovery
    // ------------------------------------------------------------------

    /// Resolve positions the last process left in flight. Exchange truth
    /// decides; absence of a local record implies nothing.
    pub async fn recover(&mut self, now: DateTime<Utc>) -> Result<()> {
        let active_ids: Vec<Uuid> = self
            .positions
            .all_positions()
            .iter()
            .filter(|p| p.status.is_active())
            .map(|p| p.id)
            .collect();

        for id in active_ids {
            if let Err(e) = self.recover_position(id, now).await {
                tracing::error!(
                    preset = %self.preset.series_slug,
                    "recovery of position {} failed: {}",
                    id,
                    e
                );
            }
        }
        Ok(())
    }

    async fn recover_position(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<TickOutcome> {
        let position = self
            .positions
            .get(id)
            .cloned()
            .ok_or("recovering position vanished")?;

        match position.status {
            PositionStatus::Pending => self.recover_pending(id, now).await,
            PositionStatus::Open | PositionStatus::Closing => {
                if position.exit_order_id.is_some() {
                    self.recover_exit_order(id, now).await
                } else {
                    if position.status == PositionStatus::Closing {
                        self.positions.mark_open(id)?;
                        self.save_position(id).await?;
                    }
                    Ok(TickOutcome::NoAction)
                }
            }
            PositionStatus::Closed | PositionStatus::Failed => Ok(TickOutcome::NoAction),
        }
    }

    /// A crash mid-entry left a Pending row. The entry order's terminal
    /// state (or, failing that, the wallet's token balance) decides
    /// whether an OPEN record is warranted.
    async fn recover_pending(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<TickOutcome> {
        let position = self
            .positions
            .get(id)
            .cloned()
            .ok_or("pending position vanished")?;

        if let Some(order_id) = &position.entry_order_id {
            let state = self.exchange.get_order(order_id).await?;
            if state.is_filled() {
                let price = if state.price > 0.0 {
                    state.price
                } else {
                    position.entry_price
                };
                let size = if state.size_matched > 0.0 {
                    state.size_matched
                } else {
                    position.size
                };
                self.finish_entry(id, price, size, &[order_id.clone()], now)
                    .await?;
                return Ok(TickOutcome::Entered);
            }
            if state.is_terminal_without_fill() {
                return self.fail_pending(id, "entry order died unfilled").await;
            }
            // Still live on the book: take it down, then decide
            if let Err(e) = self.exchange.cancel_order(order_id).await {
                tracing::warn!("cancel of stale entry {} failed: {}", order_id, e);
            }
            let final_state = self.exchange.get_order(order_id).await?;
            if final_state.size_matched > 0.0 {
                let price = if final_state.price > 0.0 {
                    final_state.price
                } else {
                    position.entry_price
                };
                self.finish_entry(id, price, final_state.size_matched, &[order_id.clone()], now)
                    .await?;
                return Ok(TickOutcome::Entered);
            }
            return self.fail_pending(id, "stale entry order cancelled").await;
        }

        // No order id persisted: the wallet balance is the only evidence
        // of whether the order reached the book and filled
        let balance = self.exchange.get_token_balance(&position.token_id).await?;
        if balance > 0.0 {
            let size = floor_order_size(
                balance.min(position.size),
                self.trading.entry_retry.size_decimals,
            );
            self.finish_entry(id, position.entry_price, size, &[], now)
                .await?;
            return Ok(TickOutcome::Entered);
        }
        self.fail_pending(id, "no fill evidence on exchange").await
    }

    async fn fail_pending(&mut self, id: Uuid, reason: &str) -> Result<TickOutcome> {
        let market_slug = self
            .positions
            .get(id)
            .map(|p| p.market_slug.clone())
            .unwrap_or_default();
        self.positions.mark_failed(id)?;
        self.save_position(id).await?;
        self.notifier
            .notify(LifecycleEvent::EntryFailed {
                preset_slug: self.preset.series_slug.clone(),
                market_slug,
                reason: reason.to_string(),
            })
            .await;
        Ok(TickOutcome::EntryFailed(reason.to_string()))
    }

    /// An exit order was SUBMITTED when the process died. Query its real
    /// state: filled means exactly one CLOSE record, not a duplicate.
    async fn recover_exit_order(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<TickOutcome> {
        let position = self
            .positions
            .get(id)
            .cloned()
            .ok_or("recovering position vanished")?;
        let order_id = position
            .exit_order_id
            .clone()
            .ok_or("exit order id missing")?;

        let state = self.exchange.get_order(&order_id).await?;
        if state.is_filled() {
            let price = if state.price > 0.0 {
                state.price
            } else {
                position.target_exit_price
            };

            // The previous process may have written the CLOSE before dying
            let history = self.store.load_history(&self.preset.series_slug).await?;
            let close_recorded = history
                .iter()
                .any(|r| r.kind == RecordKind::Close && r.position_id == Some(id));
            if close_recorded {
                self.positions
                    .close_position(id, price, ExitReason::Recovered, now)?;
                self.save_position(id).await?;
                self.state = MonitorState::Idle;
                return Ok(TickOutcome::Exited(ExitReason::Recovered));
            }
            return self
                .complete_close(id, price, ExitReason::Recovered, now)
                .await;
        }

        if state.is_terminal_without_fill() {
            // Dead order; the regular tick path will force the close
            self.positions.set_exit_order(id, None)?;
            if position.status == PositionStatus::Closing {
                self.positions.mark_open(id)?;
            }
            self.save_position(id).await?;
            return Ok(TickOutcome::NoAction);
        }

        // Order still working; leave it on the book
        if position.status == PositionStatus::Closing {
            self.positions.mark_open(id)?;
            self.save_position(id).await?;
        }
        Ok(TickOutcome::NoAction)
    }

    // ------------------------------------------------------------------
    // Persistence helpers
    // ------------------------------------------------------------------

    async fn save_position(&self, id: Uuid) -> Result<()> {
        let position = self
            .positions
            .get(id)
            .ok_or("position to save not found")?;
        self.store.save_position(position).await
    }

    async fn append_record(
        &self,
        kind: RecordKind,
        window_start: DateTime<Utc>,
        position_id: Option<Uuid>,
        price: f64,
        outcome: Option<TradeOutcome>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sequence_id = self
            .store
            .next_sequence_id(&self.preset.series_slug)
            .await?;
        self.store
            .append_history(&HistoryRecord {
                preset_slug: self.preset.series_slug.clone(),
                sequence_id,
                kind,
                window_start,
                position_id,
                price,
                outcome,
                origin: RecordOrigin::Live,
                unresolved: false,
                recorded_at: now,
            })
            .await
    }
}
