//! In-memory `TradeStore` with the same semantics as the Postgres store.
//! Backs unit and scenario tests; production uses `PostgresStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::TradeStore;
use crate::models::{HistoryRecord, Position, WindowCandle};
use crate::strategy::Streak;
use crate::Result;

#[derive(Default)]
struct Inner {
    positions: HashMap<Uuid, Position>,
    history: Vec<HistoryRecord>,
    candles: HashMap<(String, i64), WindowCandle>,
    streaks: HashMap<String, (Option<Streak>, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger rows across all presets
    pub fn history_len(&self) -> usize {
        self.inner.lock().unwrap().history.len()
    }

    pub fn saved_streak(&self, preset_slug: &str) -> Option<Streak> {
        self.inner
            .lock()
            .unwrap()
            .streaks
            .get(preset_slug)
            .and_then(|(streak, _)| *streak)
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn save_position(&self, position: &Position) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .positions
            .insert(position.id, position.clone());
        Ok(())
    }

    async fn load_positions(&self, preset_slug: &str) -> Result<Vec<Position>> {
        let inner = self.inner.lock().unwrap();
        let mut positions: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.preset_slug == preset_slug)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.entry_time);
        Ok(positions)
    }

    async fn append_history(&self, record: &HistoryRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let taken = inner.history.iter().any(|r| {
            r.preset_slug == record.preset_slug && r.sequence_id == record.sequence_id
        });
        if taken {
            return Err(format!(
                "history sequence id {} already assigned for {}",
                record.sequence_id, record.preset_slug
            )
            .into());
        }
        inner.history.push(record.clone());
        Ok(())
    }

    async fn load_history(&self, preset_slug: &str) -> Result<Vec<HistoryRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<HistoryRecord> = inner
            .history
            .iter()
            .filter(|r| r.preset_slug == preset_slug)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.sequence_id);
        Ok(records)
    }

    async fn next_sequence_id(&self, preset_slug: &str) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        let max_id = inner
            .history
            .iter()
            .filter(|r| r.preset_slug == preset_slug)
            .map(|r| r.sequence_id)
            .max()
            .unwrap_or(0);
        Ok(max_id + 1)
    }

    async fn upsert_candle(&self, candle: &WindowCandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (candle.series_slug.clone(), candle.window_start.timestamp());
        match inner.candles.get_mut(&key) {
            Some(existing) => {
                // Mirror the Postgres merge: official values survive estimates
                let open_downgrade = existing.open_official && !candle.open_official;
                let close_downgrade = existing.close_official && !candle.close_official;
                if !open_downgrade {
                    if let Some(open) = candle.open {
                        existing.open = Some(open);
                    }
                    existing.open_official = existing.open_official || candle.open_official;
                }
                if !close_downgrade {
                    if let Some(close) = candle.close {
                        existing.close = Some(close);
                    }
                    existing.close_official = existing.close_official || candle.close_official;
                }
                if !open_downgrade && !close_downgrade {
                    if let Some(delta) = candle.delta {
                        existing.delta = Some(delta);
                    }
                    if let Some(direction) = candle.direction {
                        existing.direction = Some(direction);
                    }
                }
                existing.source = candle.source.clone();
                existing.updated_at = candle.updated_at;
            }
            None => {
                inner.candles.insert(key, candle.clone());
            }
        }
        Ok(())
    }

    async fn load_candles_before(
        &self,
        series_slug: &str,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WindowCandle>> {
        let inner = self.inner.lock().unwrap();
        let mut candles: Vec<WindowCandle> = inner
            .candles
            .values()
            .filter(|c| {
                c.series_slug == series_slug && c.window_start < before && c.close.is_some()
            })
            .cloned()
            .collect();
        candles.sort_by_key(|c| std::cmp::Reverse(c.window_start));
        candles.truncate(limit.max(0) as usize);
        Ok(candles)
    }

    async fn get_candle(
        &self,
        series_slug: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<WindowCandle>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .candles
            .get(&(series_slug.to_string(), window_start.timestamp()))
            .cloned())
    }

    async fn save_streak(
        &self,
        preset_slug: &str,
        streak: Option<Streak>,
        as_of: DateTime<Utc>,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .streaks
            .insert(preset_slug.to_string(), (streak, as_of));
        Ok(())
    }
}
