pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{HistoryRecord, Position, WindowCandle};
use crate::strategy::Streak;
use crate::Result;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Durable state seam: position snapshots, the append-only history
/// ledger, per-window candles and the streak counter. The Postgres store
/// backs production; the in-memory store backs tests.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Upsert the position snapshot keyed by id
    async fn save_position(&self, position: &Position) -> Result<()>;

    /// All positions for a preset, oldest first
    async fn load_positions(&self, preset_slug: &str) -> Result<Vec<Position>>;

    /// Insert one ledger row. Fails if the (preset, sequence_id) slot is
    /// already taken; rows are never updated.
    async fn append_history(&self, record: &HistoryRecord) -> Result<()>;

    /// Ledger for a preset ordered by sequence id ascending
    async fn load_history(&self, preset_slug: &str) -> Result<Vec<HistoryRecord>>;

    /// Next unassigned sequence id (max + 1, starting at 1)
    async fn next_sequence_id(&self, preset_slug: &str) -> Result<i64>;

    /// Upsert a window candle; official open/close values are never
    /// overwritten by estimates
    async fn upsert_candle(&self, candle: &WindowCandle) -> Result<()>;

    /// Closed candles strictly before `before`, most recent first
    async fn load_candles_before(
        &self,
        series_slug: &str,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WindowCandle>>;

    /// One candle by exact window start
    async fn get_candle(
        &self,
        series_slug: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<WindowCandle>>;

    /// Current streak snapshot for a preset
    async fn save_streak(
        &self,
        preset_slug: &str,
        streak: Option<Streak>,
        as_of: DateTime<Utc>,
    ) -> Result<()>;
}
