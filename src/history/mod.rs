//! History Integrity Pipeline.
//!
//! Reconciles the append-only lifecycle ledger against exchange and
//! price-history truth: verifies strict OPEN/CLOSE alternation, backfills
//! records lost to downtime, and surfaces what it cannot repair. Repairs
//! are append-only compensations at sequence ids never previously
//! assigned; raw history is never dropped, mutated or reordered. Runs at
//! startup and on a period; never blocks the trading loop.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::api::gamma::PriceHistory;
use crate::db::TradeStore;
use crate::models::{
    Direction, HistoryRecord, OutcomeSide, Position, PositionStatus, RecordKind, RecordOrigin,
    TradeOutcome, WindowCandle,
};
use crate::notify::{LifecycleEvent, Notifier};
use crate::presets::{MonitorPreset, Window};
use crate::Result;

/// Counts from one reconcile pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub records_seen: usize,
    pub violations: usize,
    pub backfilled: usize,
    pub unresolved: usize,
    /// Sequence-id gaps with correct alternation and no trade evidence;
    /// diagnostics, not errors
    pub artifacts: usize,
}

/// Alternation problems found in a ledger
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    /// First record is a CLOSE with no OPEN before it
    OrphanCloseAtHead,
    /// records[index] and records[index + 1] share a kind
    ConsecutiveKind { index: usize },
}

/// Pure alternation check over records already ordered by sequence id
pub fn verify_alternation(records: &[HistoryRecord]) -> Vec<Violation> {
    let mut violations = Vec::new();
    if let Some(first) = records.first() {
        if first.kind == RecordKind::Close {
            violations.push(Violation::OrphanCloseAtHead);
        }
    }
    for index in 0..records.len().saturating_sub(1) {
        if records[index].kind == records[index + 1].kind {
            violations.push(Violation::ConsecutiveKind { index });
        }
    }
    violations
}

/// Gaps in the sequence-id ladder: (first missing id, length, index of the
/// record after the gap)
pub fn sequence_gaps(records: &[HistoryRecord]) -> Vec<(i64, i64, usize)> {
    let mut gaps = Vec::new();
    for index in 1..records.len() {
        let previous = records[index - 1].sequence_id;
        let current = records[index].sequence_id;
        if current > previous + 1 {
            gaps.push((previous + 1, current - previous - 1, index));
        }
    }
    gaps
}

pub struct IntegrityPipeline {
    store: Arc<dyn TradeStore>,
    prices: Arc<dyn PriceHistory>,
    notifier: Arc<dyn Notifier>,
    /// Issues already surfaced this process lifetime; periodic re-runs do
    /// not repeat themselves
    reported: Mutex<HashSet<String>>,
}

impl IntegrityPipeline {
    pub fn new(
        store: Arc<dyn TradeStore>,
        prices: Arc<dyn PriceHistory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            prices,
            notifier,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Reconcile one preset's ledger. Errors are absorbed and reported;
    /// the trading loop never waits on or fails from reconciliation.
    pub async fn reconcile(&self, preset: &MonitorPreset, now: DateTime<Utc>) -> ReconcileReport {
        match self.reconcile_inner(preset, now).await {
            Ok(report) => {
                if report.violations > 0 || report.backfilled > 0 || report.artifacts > 0 {
                    tracing::info!(
                        preset = %preset.series_slug,
                        "reconcile: {} records, {} violations, {} backfilled, {} unresolved, {} artifacts",
                        report.records_seen,
                        report.violations,
                        report.backfilled,
                        report.unresolved,
                        report.artifacts
                    );
                }
                report
            }
            Err(e) => {
                tracing::error!(preset = %preset.series_slug, "reconcile failed: {}", e);
                ReconcileReport::default()
            }
        }
    }

    async fn reconcile_inner(
        &self,
        preset: &MonitorPreset,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport> {
        let records = self.store.load_history(&preset.series_slug).await?;
        let positions = self.store.load_positions(&preset.series_slug).await?;
        let mut report = ReconcileReport {
            records_seen: records.len(),
            ..ReconcileReport::default()
        };

        self.repair_alternation(preset, &records, &positions, now, &mut report)
            .await?;
        self.repair_sequence_gaps(preset, &records, &positions, now, &mut report)
            .await?;
        self.repair_dangling_open(preset, &records, &positions, now, &mut report)
            .await?;

        Ok(report)
    }

    // --------------------------------------------------------------
    // Alternation repairs
    // --------------------------------------------------------------

    async fn repair_alternation(
        &self,
        preset: &MonitorPreset,
        records: &[HistoryRecord],
        positions: &[Position],
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        for violation in verify_alternation(records) {
            report.violations += 1;
            match violation {
                Violation::OrphanCloseAtHead => {
                    let close = &records[0];
                    // The slot before the orphan, if one was never assigned
                    let slot = (close.sequence_id > 1).then(|| close.sequence_id - 1);
                    let entry_price = close
                        .position_id
                        .and_then(|id| positions.iter().find(|p| p.id == id))
                        .map(|p| p.entry_price);
                    match (slot, entry_price) {
                        (Some(slot), Some(price)) => {
                            self.append_backfill(
                                preset,
                                slot,
                                RecordKind::Open,
                                close.window_start,
                                close.position_id,
                                price,
                                None,
                                false,
                                now,
                            )
                            .await?;
                            report.backfilled += 1;
                            self.surface(
                                preset,
                                format!(
                                    "orphan CLOSE at sequence {} repaired with backfilled OPEN",
                                    close.sequence_id
                                ),
                            )
                            .await;
                        }
                        (Some(slot), None) => {
                            // No entry price anywhere; pair the orphan with
                            // an explicitly unresolved OPEN so the
                            // alternation invariant holds without
                            // pretending we know the price
                            self.append_backfill(
                                preset,
                                slot,
                                RecordKind::Open,
                                close.window_start,
                                close.position_id,
                                close.price,
                                None,
                                true,
                                now,
                            )
                            .await?;
                            report.unresolved += 1;
                            self.surface(
                                preset,
                                format!(
                                    "orphan CLOSE at sequence {} paired with unresolved OPEN",
                                    close.sequence_id
                                ),
                            )
                            .await;
                        }
                        (None, _) => {
                            report.unresolved += 1;
                            self.surface(
                                preset,
                                format!(
                                    "orphan CLOSE at sequence {} cannot be repaired",
                                    close.sequence_id
                                ),
                            )
                            .await;
                        }
                    }
                }
                Violation::ConsecutiveKind { index } => {
                    self.repair_consecutive(preset, records, positions, index, now, report)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn repair_consecutive(
        &self,
        preset: &MonitorPreset,
        records: &[HistoryRecord],
        positions: &[Position],
        index: usize,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let first = &records[index];
        let second = &records[index + 1];
        let slot_free = second.sequence_id > first.sequence_id + 1;
        if !slot_free {
            report.unresolved += 1;
            self.surface(
                preset,
                format!(
                    "consecutive {:?} records at sequences {} and {} with no free slot between",
                    first.kind, first.sequence_id, second.sequence_id
                ),
            )
            .await;
            return Ok(());
        }
        let slot = first.sequence_id + 1;

        match first.kind {
            // OPEN, OPEN: the first position's CLOSE went missing
            RecordKind::Open => {
                let position = first
                    .position_id
                    .and_then(|id| positions.iter().find(|p| p.id == id));
                let close = match self
                    .derive_close(preset, first, position, now)
                    .await?
                {
                    Some(close) => close,
                    None => {
                        report.unresolved += 1;
                        self.surface(
                            preset,
                            format!(
                                "missing CLOSE after OPEN {} is not derivable",
                                first.sequence_id
                            ),
                        )
                        .await;
                        return Ok(());
                    }
                };
                self.append_backfill(
                    preset,
                    slot,
                    RecordKind::Close,
                    first.window_start,
                    first.position_id,
                    close.0,
                    Some(close.1),
                    false,
                    now,
                )
                .await?;
                report.backfilled += 1;
                self.surface(
                    preset,
                    format!("backfilled CLOSE at sequence {} for OPEN {}", slot, first.sequence_id),
                )
                .await;
            }
            // CLOSE, CLOSE: the second position's OPEN went missing
            RecordKind::Close => {
                let entry_price = second
                    .position_id
                    .and_then(|id| positions.iter().find(|p| p.id == id))
                    .map(|p| p.entry_price);
                match entry_price {
                    Some(price) => {
                        self.append_backfill(
                            preset,
                            slot,
                            RecordKind::Open,
                            second.window_start,
                            second.position_id,
                            price,
                            None,
                            false,
                            now,
                        )
                        .await?;
                        report.backfilled += 1;
                        self.surface(
                            preset,
                            format!(
                                "backfilled OPEN at sequence {} for CLOSE {}",
                                slot, second.sequence_id
                            ),
                        )
                        .await;
                    }
                    None => {
                        report.unresolved += 1;
                        self.surface(
                            preset,
                            format!(
                                "missing OPEN before CLOSE {} is not derivable",
                                second.sequence_id
                            ),
                        )
                        .await;
                    }
                }
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // Sequence-id gaps (alternation already correct)
    // --------------------------------------------------------------

    async fn repair_sequence_gaps(
        &self,
        preset: &MonitorPreset,
        records: &[HistoryRecord],
        positions: &[Position],
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let referenced: HashSet<Uuid> =
            records.iter().filter_map(|r| r.position_id).collect();

        for (gap_start, gap_len, after_index) in sequence_gaps(records) {
            let before = &records[after_index - 1];
            let after = &records[after_index];

            // A gap inside an OPEN/CLOSE pair is an alternation problem,
            // handled above; only CLOSE→OPEN (or head) gaps are candidates
            if before.kind != RecordKind::Close || after.kind != RecordKind::Open {
                continue;
            }

            // Evidence: a closed position in an intervening window that no
            // ledger row references
            let evidence: Vec<&Position> = positions
                .iter()
                .filter(|p| {
                    p.status == PositionStatus::Closed
                        && !referenced.contains(&p.id)
                        && p.window_start > before.window_start
                        && p.window_start < after.window_start
                })
                .collect();

            if evidence.is_empty() {
                report.artifacts += 1;
                tracing::info!(
                    preset = %preset.series_slug,
                    "sequence ids {}..{} unassigned with no missed trade; id continuity artifact",
                    gap_start,
                    gap_start + gap_len - 1
                );
                continue;
            }

            // Each missed trade needs an OPEN and a CLOSE slot
            if (evidence.len() as i64) * 2 > gap_len {
                report.violations += 1;
                report.unresolved += 1;
                self.surface(
                    preset,
                    format!(
                        "{} untracked trade(s) but only {} free sequence id(s) between {} and {}",
                        evidence.len(),
                        gap_len,
                        before.sequence_id,
                        after.sequence_id
                    ),
                )
                .await;
                continue;
            }

            report.violations += 1;
            let mut slot = gap_start;
            for position in evidence {
                let exit_price = match position.exit_price {
                    Some(price) => price,
                    None => continue,
                };
                self.append_backfill(
                    preset,
                    slot,
                    RecordKind::Open,
                    position.window_start,
                    Some(position.id),
                    position.entry_price,
                    None,
                    false,
                    now,
                )
                .await?;
                self.append_backfill(
                    preset,
                    slot + 1,
                    RecordKind::Close,
                    position.window_start,
                    Some(position.id),
                    exit_price,
                    Some(TradeOutcome::from_pnl(
                        (exit_price - position.entry_price) * position.size,
                    )),
                    false,
                    now,
                )
                .await?;
                report.backfilled += 2;
                slot += 2;
                self.surface(
                    preset,
                    format!(
                        "backfilled missed trade {} into sequence gap at {}",
                        position.id,
                        slot - 2
                    ),
                )
                .await;
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // Dangling OPEN at the tail
    // --------------------------------------------------------------

    async fn repair_dangling_open(
        &self,
        preset: &MonitorPreset,
        records: &[HistoryRecord],
        positions: &[Position],
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let last = match records.last() {
            Some(last) if last.kind == RecordKind::Open => last,
            _ => return Ok(()),
        };

        let position = last
            .position_id
            .and_then(|id| positions.iter().find(|p| p.id == id));

        // A live position legitimately ends the ledger on OPEN
        if position.map(|p| p.status.is_active()).unwrap_or(false) {
            return Ok(());
        }
        // Give the monitor the window plus a grace period to close it
        let window_end = last.window_start + Duration::seconds(preset.window_seconds);
        if now < window_end + Duration::seconds(preset.window_seconds) {
            return Ok(());
        }

        report.violations += 1;
        match self.derive_close(preset, last, position, now).await? {
            Some((price, outcome)) => {
                let slot = self.store.next_sequence_id(&preset.series_slug).await?;
                self.append_backfill(
                    preset,
                    slot,
                    RecordKind::Close,
                    last.window_start,
                    last.position_id,
                    price,
                    Some(outcome),
                    false,
                    now,
                )
                .await?;
                report.backfilled += 1;
                self.surface(
                    preset,
                    format!(
                        "backfilled CLOSE at sequence {} for abandoned OPEN {}",
                        slot, last.sequence_id
                    ),
                )
                .await;
            }
            None => {
                report.unresolved += 1;
                self.surface(
                    preset,
                    format!(
                        "OPEN {} has no close evidence; left unresolved",
                        last.sequence_id
                    ),
                )
                .await;
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // Price derivation
    // --------------------------------------------------------------

    /// What the position's exit was worth. Prefer the persisted exit;
    /// otherwise settle the binary token from the window's direction:
    /// right side resolves to 1, wrong side to 0.
    async fn derive_close(
        &self,
        preset: &MonitorPreset,
        open_record: &HistoryRecord,
        position: Option<&Position>,
        now: DateTime<Utc>,
    ) -> Result<Option<(f64, TradeOutcome)>> {
        if let Some(position) = position {
            if let Some(exit_price) = position.exit_price {
                let pnl = (exit_price - position.entry_price) * position.size;
                return Ok(Some((exit_price, TradeOutcome::from_pnl(pnl))));
            }
        }

        let side = match position.map(|p| p.side) {
            Some(side) => side,
            None => return Ok(None),
        };
        let window = Window {
            start: open_record.window_start,
            end: open_record.window_start + Duration::seconds(preset.window_seconds),
        };
        let direction = match self.window_direction(preset, &window, now).await? {
            Some(direction) => direction,
            None => return Ok(None),
        };
        let won = matches!(
            (direction, side),
            (Direction::Up, OutcomeSide::Up) | (Direction::Down, OutcomeSide::Down)
        );
        let settlement = if won { 1.0 } else { 0.0 };
        let outcome = if won {
            TradeOutcome::Win
        } else {
            TradeOutcome::Loss
        };
        Ok(Some((settlement, outcome)))
    }

    /// Window direction from the stored candle, falling back to the
    /// official price-history source (and caching what it returns)
    async fn window_direction(
        &self,
        preset: &MonitorPreset,
        window: &Window,
        now: DateTime<Utc>,
    ) -> Result<Option<Direction>> {
        if let Some(candle) = self
            .store
            .get_candle(&preset.series_slug, window.start)
            .await?
        {
            if candle.is_official() {
                if let Some(direction) = candle
                    .direction
                    .or_else(|| Direction::from_values(candle.open, candle.close, candle.delta))
                {
                    return Ok(Some(direction));
                }
            }
        }

        let prices = match self
            .prices
            .window_open_close(&preset.symbol(), &preset.variant, window.start, window.end)
            .await
        {
            Ok(Some(prices)) if prices.completed => prices,
            Ok(_) => return Ok(None),
            Err(e) => {
                tracing::debug!("price history lookup failed: {}", e);
                return Ok(None);
            }
        };

        let direction = Direction::from_values(prices.open, prices.close, None);
        self.store
            .upsert_candle(&WindowCandle {
                series_slug: preset.series_slug.clone(),
                window_start: window.start,
                window_end: window.end,
                open: prices.open,
                close: prices.close,
                delta: match (prices.open, prices.close) {
                    (Some(open), Some(close)) => Some(close - open),
                    _ => None,
                },
                direction,
                open_official: prices.open.is_some(),
                close_official: prices.close.is_some(),
                source: prices.source.clone(),
                updated_at: now,
            })
            .await?;
        Ok(direction)
    }

    // --------------------------------------------------------------
    // Writes and diagnostics
    // --------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn append_backfill(
        &self,
        preset: &MonitorPreset,
        sequence_id: i64,
        kind: RecordKind,
        window_start: DateTime<Utc>,
        position_id: Option<Uuid>,
        price: f64,
        outcome: Option<TradeOutcome>,
        unresolved: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .append_history(&HistoryRecord {
                preset_slug: preset.series_slug.clone(),
                sequence_id,
                kind,
                window_start,
                position_id,
                price,
                outcome,
                origin: RecordOrigin::Backfill,
                unresolved,
                recorded_at: now,
            })
            .await
    }

    /// One notification per distinct issue per process lifetime
    async fn surface(&self, preset: &MonitorPreset, detail: String) {
        let key = format!("{}:{}", preset.series_slug, detail);
        if !self.reported.lock().unwrap().insert(key) {
            return;
        }
        self.notifier
            .notify(LifecycleEvent::IntegrityIssue {
                preset_slug: preset.series_slug.clone(),
                detail,
            })
            .await;
    }
}

/// Record official candles for the recent closed windows of a preset.
/// Feeds both the streak signal and integrity backfill evidence.
pub async fn record_recent_candles(
    store: &dyn TradeStore,
    prices: &dyn PriceHistory,
    preset: &MonitorPreset,
    now: DateTime<Utc>,
    lookback: u32,
) -> Result<u32> {
    let current = preset.window_containing(now);
    let mut window = current.previous(preset.window_seconds);
    let mut recorded = 0;

    for _ in 0..lookback {
        let have_official = store
            .get_candle(&preset.series_slug, window.start)
            .await?
            .map(|c| c.is_official())
            .unwrap_or(false);
        if !have_official {
            match prices
                .window_open_close(&preset.symbol(), &preset.variant, window.start, window.end)
                .await
            {
                Ok(Some(fetched)) if fetched.completed => {
                    store
                        .upsert_candle(&WindowCandle {
                            series_slug: preset.series_slug.clone(),
                            window_start: window.start,
                            window_end: window.end,
                            open: fetched.open,
                            close: fetched.close,
                            delta: match (fetched.open, fetched.close) {
                                (Some(open), Some(close)) => Some(close - open),
                                _ => None,
                            },
                            direction: Direction::from_values(fetched.open, fetched.close, None),
                            open_official: fetched.open.is_some(),
                            close_official: fetched.close.is_some(),
                            source: fetched.source.clone(),
                            updated_at: now,
                        })
                        .await?;
                    recorded += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        preset = %preset.series_slug,
                        "candle fetch failed for {}: {}",
                        window.start,
                        e
                    );
                }
            }
        }
        window = window.previous(preset.window_seconds);
    }
    Ok(recorded)
}
