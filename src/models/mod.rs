use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which outcome token of a binary up/down market
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutcomeSide {
    Up,
    Down,
}

impl OutcomeSide {
    pub fn opposite(self) -> Self {
        match self {
            OutcomeSide::Up => OutcomeSide::Down,
            OutcomeSide::Down => OutcomeSide::Up,
        }
    }
}

/// Order side on the exchange book
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Direction a window resolved (close vs open)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Derive direction from window open/close/delta, preferring the delta
    pub fn from_values(
        open: Option<f64>,
        close: Option<f64>,
        delta: Option<f64>,
    ) -> Option<Direction> {
        let delta = match delta {
            Some(d) => d,
            None => close? - open?,
        };
        if delta >= 0.0 {
            Some(Direction::Up)
        } else {
            Some(Direction::Down)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Pending,
    Open,
    Closing,
    Closed,
    Failed,
}

impl PositionStatus {
    /// Pending, Open and Closing positions all count against the
    /// one-active-position-per-preset invariant.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PositionStatus::Pending | PositionStatus::Open | PositionStatus::Closing
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    /// Resting target order filled
    Target,
    /// Forced close at the window boundary
    WindowEnd,
    /// Adverse price move beyond the configured threshold
    Urgency,
    /// Operator-requested close
    Manual,
    /// Resolved from exchange state after a restart
    Recovered,
}

/// One position per preset per trading window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub preset_slug: String,
    pub market_slug: String,
    pub token_id: String,
    pub side: OutcomeSide,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub entry_price: f64,
    pub size: f64,
    pub status: PositionStatus,
    pub entry_order_id: Option<String>,
    /// Resting target exit order, if one is live on the book
    pub exit_order_id: Option<String>,
    pub target_exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.size
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecordKind {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecordOrigin {
    /// Written by the live trading loop
    Live,
    /// Synthesized by the integrity pipeline from exchange/price history
    Backfill,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeOutcome {
    Win,
    Loss,
    Flat,
}

impl TradeOutcome {
    pub fn from_pnl(pnl: f64) -> TradeOutcome {
        if pnl > 0.0 {
            TradeOutcome::Win
        } else if pnl < 0.0 {
            TradeOutcome::Loss
        } else {
            TradeOutcome::Flat
        }
    }
}

/// Append-only ledger row for one lifecycle event.
///
/// Rows are immutable once written; the integrity pipeline corrects the
/// ledger by appending compensating rows, never by mutating in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub preset_slug: String,
    /// Monotonically increasing per preset; never reused
    pub sequence_id: i64,
    pub kind: RecordKind,
    pub window_start: DateTime<Utc>,
    pub position_id: Option<Uuid>,
    pub price: f64,
    pub outcome: Option<TradeOutcome>,
    pub origin: RecordOrigin,
    /// Violation that could not be repaired by backfill
    pub unresolved: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Per-window price snapshot recorded from the feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowCandle {
    pub series_slug: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub delta: Option<f64>,
    pub direction: Option<Direction>,
    pub open_official: bool,
    pub close_official: bool,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

impl WindowCandle {
    /// True when both ends of the window come from the official source
    pub fn is_official(&self) -> bool {
        self.open_official && self.close_official
    }
}
