//! End-to-end lifecycle scenarios for the position monitor, the order
//! retry engine and the history ledger, run against scripted doubles.

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use common::{FillPlan, MockExchange, RecordingNotifier, StaticFeed};
use polybot::config::{RetryPolicyConfig, TradeLimitsConfig, TradingConfig};
use polybot::db::{MemoryStore, TradeStore};
use polybot::execution::{PositionManager, PositionMonitor, TickOutcome};
use polybot::models::{
    Direction, ExitReason, OrderSide, OutcomeSide, Position, PositionStatus, RecordKind,
};
use polybot::notify::LifecycleEvent;
use polybot::presets::{get_preset, MonitorPreset, Window};
use polybot::risk::TradeLimits;

fn fast_retry(market_fallback: bool) -> RetryPolicyConfig {
    RetryPolicyConfig {
        max_retries: 3,
        attempt_timeout_seconds: 0,
        poll_interval_ms: 1,
        price_step: 0.01,
        max_slippage: 0.05,
        market_fallback,
        size_decimals: 4,
    }
}

fn fast_trading(exit_fallback: bool) -> TradingConfig {
    TradingConfig {
        shares: 10.0,
        target_spread: 0.05,
        urgency_price_drop: 0.15,
        entry_span_seconds: 120,
        close_margin_seconds: 30,
        resolve_wait_seconds: 0,
        resolve_poll_ms: 1,
        pattern_trigger: 3,
        pattern_max: 6,
        entry_retry: fast_retry(false),
        exit_retry: fast_retry(exit_fallback),
        ..TradingConfig::default()
    }
}

struct Harness {
    preset: MonitorPreset,
    window: Window,
    now: DateTime<Utc>,
    exchange: Arc<MockExchange>,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    monitor: PositionMonitor,
}

/// Monitor over scripted doubles, with a three-Up streak already on file
/// so the next tick wants to enter Down
async fn harness(exit_fallback: bool) -> Harness {
    let preset = get_preset("eth", "15m").unwrap();
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let window = preset.window_containing(base);
    let now = window.start + Duration::seconds(10);

    let store = Arc::new(MemoryStore::new());
    for candle in common::streak_candles(
        &preset,
        window.start,
        &[Direction::Up, Direction::Up, Direction::Up],
    ) {
        store.upsert_candle(&candle).await.unwrap();
    }

    let slug = preset.market_slug_for(&window);
    let feed = Arc::new(StaticFeed::with_market(&slug, 0.55, 0.45));
    let exchange = Arc::new(MockExchange::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let monitor = PositionMonitor::new(
        preset.clone(),
        fast_trading(exit_fallback),
        TradeLimits::from(&TradeLimitsConfig::default()),
        exchange.clone(),
        feed.clone(),
        store.clone(),
        notifier.clone(),
        PositionManager::new(&preset.series_slug),
    );

    Harness {
        preset,
        window,
        now,
        exchange,
        store,
        notifier,
        monitor,
    }
}

fn entry_filled_events(events: &[LifecycleEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::EntryFilled { .. }))
        .count()
}

// ---------------------------------------------------------------------
// First-attempt fill at the submitted price
// ---------------------------------------------------------------------

#[tokio::test]
async fn entry_fills_first_attempt() {
    let mut h = harness(true).await;

    let outcome = h.monitor.tick(h.now).await.unwrap();
    assert_eq!(outcome, TickOutcome::Entered);

    let position = h.monitor.positions().active_position().unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.side, OutcomeSide::Down);
    assert!((position.entry_price - 0.45).abs() < 1e-9);
    assert!((position.size - 10.0).abs() < 1e-9);

    // Exactly one OPEN row at the submitted price
    let records = h.store.load_history(&h.preset.series_slug).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, RecordKind::Open);
    assert_eq!(records[0].sequence_id, 1);
    assert!((records[0].price - 0.45).abs() < 1e-9);

    // Entry buy plus the resting target exit at entry + spread
    let placements = h.exchange.placements();
    assert_eq!(placements.len(), 2);
    assert_eq!(placements[0].side, OrderSide::Buy);
    assert!((placements[0].price - 0.45).abs() < 1e-9);
    assert_eq!(placements[1].side, OrderSide::Sell);
    assert!((placements[1].price - 0.50).abs() < 1e-9);

    let events = h.notifier.events();
    assert_eq!(entry_filled_events(&events), 1);

    // Streak snapshot persisted for the preset
    let streak = h.store.saved_streak(&h.preset.series_slug).unwrap();
    assert_eq!(streak.length, 3);
}

// ---------------------------------------------------------------------
// Order never fills within the retry budget, fallback disabled
// ---------------------------------------------------------------------

#[tokio::test]
async fn entry_exhausts_retries_and_fails() {
    let mut h = harness(false).await;
    h.exchange.set_buy_plan(FillPlan::Never);

    let outcome = h.monitor.tick(h.now).await.unwrap();
    assert!(matches!(outcome, TickOutcome::EntryFailed(_)));

    // Position bookkeeping shows the failed window; nothing is active
    assert!(h.monitor.positions().active_position().is_none());

    // Zero history rows, exactly one failure notification
    let records = h.store.load_history(&h.preset.series_slug).await.unwrap();
    assert!(records.is_empty());
    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], LifecycleEvent::EntryFailed { .. }));

    // Retry bound: three limit placements, stepped upward, nothing more
    let placements = h.exchange.placements();
    assert_eq!(placements.len(), 3);
    assert!((placements[2].price - 0.47).abs() < 1e-9);

    // The window is not re-attempted on the next tick
    let outcome = h.monitor.tick(h.now + Duration::seconds(5)).await.unwrap();
    assert_eq!(outcome, TickOutcome::NoAction);
    assert_eq!(h.notifier.events().len(), 1);
}

// ---------------------------------------------------------------------
// Restart while an exit order was submitted; the exchange reports it
// filled; exactly one CLOSE record may exist afterwards
// ---------------------------------------------------------------------

#[tokio::test]
async fn restart_resolves_submitted_exit_to_closed() {
    let preset = get_preset("eth", "15m").unwrap();
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let window = preset.window_containing(base);

    let store = Arc::new(MemoryStore::new());
    let exchange = Arc::new(MockExchange::new());
    let notifier = Arc::new(RecordingNotifier::new());

    // The previous process entered, rested an exit, wrote OPEN, and died
    let position = Position {
        id: Uuid::new_v4(),
        preset_slug: preset.series_slug.clone(),
        market_slug: preset.market_slug_for(&window),
        token_id: "0xdown".to_string(),
        side: OutcomeSide::Down,
        window_start: window.start,
        window_end: window.end,
        entry_price: 0.45,
        size: 10.0,
        status: PositionStatus::Open,
        entry_order_id: Some("entry-1".to_string()),
        exit_order_id: Some("exit-1".to_string()),
        target_exit_price: 0.50,
        entry_time: window.start,
        exit_price: None,
        exit_time: None,
        exit_reason: None,
        realized_pnl: None,
    };
    store.save_position(&position).await.unwrap();
    store
        .append_history(&polybot::models::HistoryRecord {
            preset_slug: preset.series_slug.clone(),
            sequence_id: 1,
            kind: RecordKind::Open,
            window_start: window.start,
            position_id: Some(position.id),
            price: 0.45,
            outcome: None,
            origin: polybot::models::RecordOrigin::Live,
            unresolved: false,
            recorded_at: window.start,
        })
        .await
        .unwrap();

    // On restart the exchange reports the exit filled at the target
    exchange.seed_order(
        "exit-1",
        polybot::api::clob::ExchangeOrderStatus::Matched,
        0.50,
        10.0,
        10.0,
    );

    let persisted = store.load_positions(&preset.series_slug).await.unwrap();
    let mut monitor = PositionMonitor::new(
        preset.clone(),
        fast_trading(true),
        TradeLimits::from(&TradeLimitsConfig::default()),
        exchange.clone(),
        Arc::new(StaticFeed::empty()),
        store.clone(),
        notifier.clone(),
        PositionManager::with_positions(&preset.series_slug, persisted),
    );

    let now = window.end + Duration::seconds(60);
    monitor.recover(now).await.unwrap();

    // Closed exactly once with exactly one CLOSE row
    let restored = monitor.positions().all_positions();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].status, PositionStatus::Closed);
    assert_eq!(restored[0].exit_price, Some(0.50));

    let records = store.load_history(&preset.series_slug).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].kind, RecordKind::Close);
    assert_eq!(records[1].sequence_id, 2);

    // Running recovery again changes nothing
    monitor.recover(now).await.unwrap();
    assert_eq!(store.load_history(&preset.series_slug).await.unwrap().len(), 2);
}

// ---------------------------------------------------------------------
// Insufficient balance refuses entry without submitting an order
// ---------------------------------------------------------------------

#[tokio::test]
async fn insufficient_balance_skips_entry() {
    let mut h = harness(false).await;
    h.exchange.set_collateral(1.0);

    let outcome = h.monitor.tick(h.now).await.unwrap();
    assert!(matches!(outcome, TickOutcome::EntrySkipped(_)));

    // No order submitted, no history, one skip notification
    assert!(h.exchange.placements().is_empty());
    assert!(h
        .store
        .load_history(&h.preset.series_slug)
        .await
        .unwrap()
        .is_empty());
    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], LifecycleEvent::EntrySkipped { .. }));

    // Still nothing on later ticks of the same window
    let outcome = h.monitor.tick(h.now + Duration::seconds(5)).await.unwrap();
    assert_eq!(outcome, TickOutcome::NoAction);
    assert_eq!(h.notifier.events().len(), 1);
}

// ---------------------------------------------------------------------
// Unresolvable market defers instead of failing the window
// ---------------------------------------------------------------------

#[tokio::test]
async fn unresolved_market_defers_entry() {
    let h = harness(false).await;
    // Same doubles, but the window's market has not listed yet
    let feed = Arc::new(StaticFeed::empty());
    let mut monitor = PositionMonitor::new(
        h.preset.clone(),
        fast_trading(false),
        TradeLimits::from(&TradeLimitsConfig::default()),
        h.exchange.clone(),
        feed.clone(),
        h.store.clone(),
        h.notifier.clone(),
        PositionManager::new(&h.preset.series_slug),
    );

    let outcome = monitor.tick(h.now).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Deferred(_)));
    assert!(h.exchange.placements().is_empty());
    assert!(h.notifier.events().is_empty());

    // The window stays eligible: the market lists, the next tick enters
    let slug = h.preset.market_slug_for(&h.window);
    feed.add_market(&slug, 0.55, 0.45);
    let outcome = monitor.tick(h.now + Duration::seconds(5)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Entered);
}

// ---------------------------------------------------------------------
// Resting target exit fills while the position is open
// ---------------------------------------------------------------------

#[tokio::test]
async fn resting_target_exit_closes_position() {
    let mut h = harness(true).await;
    h.exchange.set_sell_plan(FillPlan::Never);
    assert_eq!(h.monitor.tick(h.now).await.unwrap(), TickOutcome::Entered);

    // The market takes the resting sell between ticks
    h.exchange.fill_order("mock-2");

    let outcome = h.monitor.tick(h.now + Duration::seconds(5)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Exited(ExitReason::Target));

    let records = h.store.load_history(&h.preset.series_slug).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].kind, RecordKind::Close);
    assert!((records[1].price - 0.50).abs() < 1e-9);

    let position = &h.monitor.positions().all_positions()[0];
    assert_eq!(position.status, PositionStatus::Closed);
    assert_eq!(position.exit_reason, Some(ExitReason::Target));
    assert!((position.realized_pnl.unwrap() - 0.5).abs() < 1e-9);
}

// ---------------------------------------------------------------------
// Window end forces the close
// ---------------------------------------------------------------------

#[tokio::test]
async fn window_end_forces_close() {
    let mut h = harness(true).await;
    h.exchange.set_sell_plan(FillPlan::Never);
    assert_eq!(h.monitor.tick(h.now).await.unwrap(), TickOutcome::Entered);

    // Inside the close margin; the resting exit never filled
    h.exchange.set_sell_price(0.44);
    let late = h.window.end - Duration::seconds(10);
    let outcome = h.monitor.tick(late).await.unwrap();

    // Limit exits keep failing, so the engine falls back to market
    assert_eq!(outcome, TickOutcome::Exited(ExitReason::WindowEnd));
    let position = &h.monitor.positions().all_positions()[0];
    assert_eq!(position.status, PositionStatus::Closed);
    assert_eq!(position.exit_reason, Some(ExitReason::WindowEnd));

    let records = h.store.load_history(&h.preset.series_slug).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].kind, RecordKind::Close);
}

// ---------------------------------------------------------------------
// Urgency threshold forces an early exit
// ---------------------------------------------------------------------

#[tokio::test]
async fn urgency_forces_early_exit() {
    let mut h = harness(true).await;
    h.exchange.set_sell_plan(FillPlan::Never);
    assert_eq!(h.monitor.tick(h.now).await.unwrap(), TickOutcome::Entered);

    // Entry at 0.45; bid collapses to 0.25, past the 0.15 threshold,
    // well before the window end
    h.exchange.set_sell_plan(FillPlan::Immediate);
    h.exchange.set_sell_price(0.25);
    let outcome = h.monitor.tick(h.now + Duration::seconds(30)).await.unwrap();

    assert_eq!(outcome, TickOutcome::Exited(ExitReason::Urgency));
    let position = &h.monitor.positions().all_positions()[0];
    assert_eq!(position.exit_reason, Some(ExitReason::Urgency));
    assert!(position.realized_pnl.unwrap() < 0.0);
}

// ---------------------------------------------------------------------
// Exit failure is retried next tick and notified exactly once
// ---------------------------------------------------------------------

#[tokio::test]
async fn exit_failure_retries_without_abandoning() {
    let mut h = harness(false).await;
    h.exchange.set_sell_plan(FillPlan::Never);
    assert_eq!(h.monitor.tick(h.now).await.unwrap(), TickOutcome::Entered);

    let late = h.window.end - Duration::seconds(10);
    let outcome = h.monitor.tick(late).await.unwrap();
    assert!(matches!(outcome, TickOutcome::ExitFailed(_)));

    // Still monitored, still open
    let position = h.monitor.positions().active_position().unwrap();
    assert_eq!(position.status, PositionStatus::Open);

    // A second failing tick does not duplicate the notification
    let outcome = h.monitor.tick(late + Duration::seconds(5)).await.unwrap();
    assert!(matches!(outcome, TickOutcome::ExitFailed(_)));
    let exit_failures = h
        .notifier
        .events()
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::ExitFailed { .. }))
        .count();
    assert_eq!(exit_failures, 1);

    // Once the book accepts the sell, the close completes and is recorded
    h.exchange.set_sell_plan(FillPlan::Immediate);
    let outcome = h
        .monitor
        .tick(late + Duration::seconds(10))
        .await
        .unwrap();
    assert_eq!(outcome, TickOutcome::Exited(ExitReason::WindowEnd));
    let records = h.store.load_history(&h.preset.series_slug).await.unwrap();
    assert_eq!(records.len(), 2);
}

// ---------------------------------------------------------------------
// Manual close request
// ---------------------------------------------------------------------

#[tokio::test]
async fn manual_close_request_is_honored() {
    let mut h = harness(true).await;
    h.exchange.set_sell_plan(FillPlan::Never);
    assert_eq!(h.monitor.tick(h.now).await.unwrap(), TickOutcome::Entered);

    h.exchange.set_sell_plan(FillPlan::Immediate);
    h.monitor.request_close();
    let outcome = h.monitor.tick(h.now + Duration::seconds(20)).await.unwrap();

    assert_eq!(outcome, TickOutcome::Exited(ExitReason::Manual));
}

// ---------------------------------------------------------------------
// Single-active-position invariant across a full cycle
// ---------------------------------------------------------------------

#[tokio::test]
async fn at_most_one_active_position_per_preset() {
    let mut h = harness(true).await;
    h.exchange.set_sell_plan(FillPlan::Never);
    assert_eq!(h.monitor.tick(h.now).await.unwrap(), TickOutcome::Entered);

    let active = h
        .monitor
        .positions()
        .all_positions()
        .iter()
        .filter(|p| p.status.is_active())
        .count();
    assert_eq!(active, 1);

    // Further ticks while open never begin a second entry
    for offset in [20, 40, 60] {
        let _ = h.monitor.tick(h.now + Duration::seconds(offset)).await;
        let active = h
            .monitor
            .positions()
            .all_positions()
            .iter()
            .filter(|p| p.status.is_active())
            .count();
        assert!(active <= 1);
    }
}
