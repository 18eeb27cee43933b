//! Per-preset position book. Owns every position the preset has traded
//! this process lifetime and enforces the single-active invariant.
//!
//! Entries are two-phase: `begin_entry` persists a Pending position
//! before any order reaches the exchange, so a crash mid-entry leaves a
//! row the recovery pass can resolve against exchange truth.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{ExitReason, OutcomeSide, Position, PositionStatus, TradeOutcome};
use crate::presets::Window;

pub struct PositionManager {
    preset_slug: String,
    positions: Vec<Position>,
    total_pnl: f64,
}

/// Everything known about an entry before the first order is placed
pub struct EntryPlan {
    pub market_slug: String,
    pub token_id: String,
    pub side: OutcomeSide,
    pub window: Window,
    pub reference_price: f64,
    pub size: f64,
    pub target_exit_price: f64,
    pub entry_time: DateTime<Utc>,
}

impl PositionManager {
    pub fn new(preset_slug: &str) -> Self {
        Self {
            preset_slug: preset_slug.to_string(),
            positions: Vec::new(),
            total_pnl: 0.0,
        }
    }

    /// Restore from persisted positions, recomputing realized P&L
    pub fn with_positions(preset_slug: &str, positions: Vec<Position>) -> Self {
        let total_pnl: f64 = positions
            .iter()
            .filter(|p| p.status == PositionStatus::Closed)
            .filter_map(|p| p.realized_pnl)
            .sum();

        tracing::info!(
            "Restored {} positions for {} (realized P&L: ${:.2})",
            positions.len(),
            preset_slug,
            total_pnl
        );

        Self {
            preset_slug: preset_slug.to_string(),
            positions,
            total_pnl,
        }
    }

    pub fn preset_slug(&self) -> &str {
        &self.preset_slug
    }

    pub fn total_pnl(&self) -> f64 {
        self.total_pnl
    }

    pub fn all_positions(&self) -> &[Position] {
        &self.positions
    }

    /// The one position currently Pending/Open/Closing, if any
    pub fn active_position(&self) -> Option<&Position> {
        self.positions.iter().find(|p| p.status.is_active())
    }

    pub fn has_active_position(&self) -> bool {
        self.active_position().is_some()
    }

    /// Entry is attempted at most once per window
    pub fn window_attempted(&self, window: &Window) -> bool {
        self.positions.iter().any(|p| p.window_start == window.start)
    }

    pub fn get(&self, id: Uuid) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> anyhow::Result<&mut Position> {
        self.positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow::anyhow!("position {} not found", id))
    }

    /// Phase one: a Pending position at the reference price
    pub fn begin_entry(&mut self, plan: EntryPlan) -> anyhow::Result<Uuid> {
        if let Some(active) = self.active_position() {
            anyhow::bail!(
                "preset {} already has active position {}",
                self.preset_slug,
                active.id
            );
        }

        let id = Uuid::new_v4();
        self.positions.push(Position {
            id,
            preset_slug: self.preset_slug.clone(),
            market_slug: plan.market_slug,
            token_id: plan.token_id,
            side: plan.side,
            window_start: plan.window.start,
            window_end: plan.window.end,
            entry_price: plan.reference_price,
            size: plan.size,
            status: PositionStatus::Pending,
            entry_order_id: None,
            exit_order_id: None,
            target_exit_price: plan.target_exit_price,
            entry_time: plan.entry_time,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: None,
        });
        Ok(id)
    }

    /// Phase two: the entry filled
    pub fn confirm_entry(
        &mut self,
        id: Uuid,
        entry_price: f64,
        size: f64,
        entry_order_id: Option<String>,
    ) -> anyhow::Result<()> {
        let position = self.get_mut(id)?;
        if position.status != PositionStatus::Pending {
            anyhow::bail!("position {} is not pending entry", id);
        }
        position.entry_price = entry_price;
        position.size = size;
        position.entry_order_id = entry_order_id;
        position.status = PositionStatus::Open;
        Ok(())
    }

    /// Record a skipped or failed entry so the window is not retried
    pub fn record_failed_entry(&mut self, window: &Window, market_slug: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.positions.push(Position {
            id,
            preset_slug: self.preset_slug.clone(),
            market_slug: market_slug.to_string(),
            token_id: String::new(),
            side: OutcomeSide::Up,
            window_start: window.start,
            window_end: window.end,
            entry_price: 0.0,
            size: 0.0,
            status: PositionStatus::Failed,
            entry_order_id: None,
            exit_order_id: None,
            target_exit_price: 0.0,
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: None,
        });
        id
    }

    pub fn set_exit_order(&mut self, id: Uuid, order_id: Option<String>) -> anyhow::Result<()> {
        self.get_mut(id)?.exit_order_id = order_id;
        Ok(())
    }

    pub fn mark_closing(&mut self, id: Uuid) -> anyhow::Result<()> {
        let position = self.get_mut(id)?;
        if !position.status.is_active() {
            anyhow::bail!("position {} is not active", id);
        }
        position.status = PositionStatus::Closing;
        Ok(())
    }

    /// Transition an exit failure back to Open so the next tick retries
    pub fn mark_open(&mut self, id: Uuid) -> anyhow::Result<()> {
        self.get_mut(id)?.status = PositionStatus::Open;
        Ok(())
    }

    /// Abandon a position whose entry never actually happened
    pub fn mark_failed(&mut self, id: Uuid) -> anyhow::Result<()> {
        self.get_mut(id)?.status = PositionStatus::Failed;
        Ok(())
    }

    pub fn close_position(
        &mut self,
        id: Uuid,
        exit_price: f64,
        reason: ExitReason,
        exit_time: DateTime<Utc>,
    ) -> anyhow::Result<TradeOutcome> {
        let position = self.get_mut(id)?;
        if position.status == PositionStatus::Closed {
            anyhow::bail!("position {} already closed", id);
        }

        let pnl = (exit_price - position.entry_price) * position.size;
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(exit_time);
        position.exit_reason = Some(reason);
        position.realized_pnl = Some(pnl);
        position.exit_order_id = None;

        self.total_pnl += pnl;
        Ok(TradeOutcome::from_pnl(pnl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::get_preset;
    use chrono::TimeZone;

    fn window() -> Window {
        let preset = get_preset("eth", "15m").unwrap();
        preset.window_containing(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
    }

    fn plan(window: Window) -> EntryPlan {
        EntryPlan {
            market_slug: "eth-updown-15m-x".to_string(),
            token_id: "0xup".to_string(),
            side: OutcomeSide::Up,
            window,
            reference_price: 0.45,
            size: 10.0,
            target_exit_price: 0.50,
            entry_time: window.start,
        }
    }

    fn open_position(pm: &mut PositionManager) -> Uuid {
        let id = pm.begin_entry(plan(window())).unwrap();
        pm.confirm_entry(id, 0.45, 10.0, Some("entry-1".to_string()))
            .unwrap();
        id
    }

    #[test]
    fn test_two_phase_entry() {
        let mut pm = PositionManager::new("eth-up-or-down-15m");
        let id = pm.begin_entry(plan(window())).unwrap();

        assert_eq!(pm.get(id).unwrap().status, PositionStatus::Pending);
        assert!(pm.has_active_position());
        assert!(pm.window_attempted(&window()));

        pm.confirm_entry(id, 0.46, 9.5, Some("entry-1".to_string()))
            .unwrap();
        let position = pm.get(id).unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.entry_price, 0.46);
        assert_eq!(position.size, 9.5);
    }

    #[test]
    fn test_confirm_requires_pending() {
        let mut pm = PositionManager::new("eth-up-or-down-15m");
        let id = open_position(&mut pm);
        assert!(pm.confirm_entry(id, 0.5, 10.0, None).is_err());
    }

    #[test]
    fn test_single_active_invariant() {
        let mut pm = PositionManager::new("eth-up-or-down-15m");
        pm.begin_entry(plan(window())).unwrap();

        let result = pm.begin_entry(plan(window()));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("already has active position"));
    }

    #[test]
    fn test_close_position() {
        let mut pm = PositionManager::new("eth-up-or-down-15m");
        let id = open_position(&mut pm);

        let outcome = pm
            .close_position(id, 0.50, ExitReason::Target, Utc::now())
            .unwrap();
        assert_eq!(outcome, TradeOutcome::Win);

        let position = pm.get(id).unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.exit_price, Some(0.50));
        assert_eq!(position.exit_reason, Some(ExitReason::Target));
        assert!((position.realized_pnl.unwrap() - 0.5).abs() < 1e-9);
        assert!((pm.total_pnl() - 0.5).abs() < 1e-9);
        assert!(!pm.has_active_position());
    }

    #[test]
    fn test_cannot_close_twice() {
        let mut pm = PositionManager::new("eth-up-or-down-15m");
        let id = open_position(&mut pm);
        pm.close_position(id, 0.50, ExitReason::Target, Utc::now())
            .unwrap();

        let result = pm.close_position(id, 0.55, ExitReason::Manual, Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_entry_blocks_window_retry() {
        let mut pm = PositionManager::new("eth-up-or-down-15m");
        let w = window();
        pm.record_failed_entry(&w, "eth-updown-15m-x");

        assert!(!pm.has_active_position());
        assert!(pm.window_attempted(&w));
    }

    #[test]
    fn test_closing_and_reopen_cycle() {
        let mut pm = PositionManager::new("eth-up-or-down-15m");
        let id = open_position(&mut pm);

        pm.mark_closing(id).unwrap();
        assert_eq!(pm.get(id).unwrap().status, PositionStatus::Closing);
        assert!(pm.has_active_position());

        // Exit failed; back to Open for the next tick
        pm.mark_open(id).unwrap();
        assert_eq!(pm.get(id).unwrap().status, PositionStatus::Open);
    }

    #[test]
    fn test_restore_recomputes_pnl() {
        let mut pm = PositionManager::new("eth-up-or-down-15m");
        let id = open_position(&mut pm);
        pm.close_position(id, 0.40, ExitReason::WindowEnd, Utc::now())
            .unwrap();

        let restored =
            PositionManager::with_positions("eth-up-or-down-15m", pm.all_positions().to_vec());
        assert!((restored.total_pnl() + 0.5).abs() < 1e-9);
    }
}
