use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use super::TradeStore;
use crate::models::{
    Direction, ExitReason, HistoryRecord, OutcomeSide, Position, PositionStatus, RecordKind,
    RecordOrigin, TradeOutcome, WindowCandle,
};
use crate::strategy::Streak;
use crate::Result;
use async_trait::async_trait;

/// Postgres-backed state store
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run migrations. A migration failure is fatal.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }
}

fn side_str(side: OutcomeSide) -> &'static str {
    match side {
        OutcomeSide::Up => "Up",
        OutcomeSide::Down => "Down",
    }
}

fn parse_side(raw: &str) -> Result<OutcomeSide> {
    match raw {
        "Up" => Ok(OutcomeSide::Up),
        "Down" => Ok(OutcomeSide::Down),
        other => Err(format!("Invalid outcome side: {}", other).into()),
    }
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Pending => "Pending",
        PositionStatus::Open => "Open",
        PositionStatus::Closing => "Closing",
        PositionStatus::Closed => "Closed",
        PositionStatus::Failed => "Failed",
    }
}

fn parse_status(raw: &str) -> Result<PositionStatus> {
    match raw {
        "Pending" => Ok(PositionStatus::Pending),
        "Open" => Ok(PositionStatus::Open),
        "Closing" => Ok(PositionStatus::Closing),
        "Closed" => Ok(PositionStatus::Closed),
        "Failed" => Ok(PositionStatus::Failed),
        other => Err(format!("Invalid position status: {}", other).into()),
    }
}

fn exit_reason_str(reason: ExitReason) -> &'static str {
    match reason {
        ExitReason::Target => "Target",
        ExitReason::WindowEnd => "WindowEnd",
        ExitReason::Urgency => "Urgency",
        ExitReason::Manual => "Manual",
        ExitReason::Recovered => "Recovered",
    }
}

fn parse_exit_reason(raw: Option<&str>) -> Result<Option<ExitReason>> {
    match raw {
        None => Ok(None),
        Some("Target") => Ok(Some(ExitReason::Target)),
        Some("WindowEnd") => Ok(Some(ExitReason::WindowEnd)),
        Some("Urgency") => Ok(Some(ExitReason::Urgency)),
        Some("Manual") => Ok(Some(ExitReason::Manual)),
        Some("Recovered") => Ok(Some(ExitReason::Recovered)),
        Some(other) => Err(format!("Invalid exit reason: {}", other).into()),
    }
}

fn kind_str(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Open => "OPEN",
        RecordKind::Close => "CLOSE",
    }
}

fn parse_kind(raw: &str) -> Result<RecordKind> {
    match raw {
        "OPEN" => Ok(RecordKind::Open),
        "CLOSE" => Ok(RecordKind::Close),
        other => Err(format!("Invalid record kind: {}", other).into()),
    }
}

fn origin_str(origin: RecordOrigin) -> &'static str {
    match origin {
        RecordOrigin::Live => "live",
        RecordOrigin::Backfill => "backfill",
    }
}

fn parse_origin(raw: &str) -> Result<RecordOrigin> {
    match raw {
        "live" => Ok(RecordOrigin::Live),
        "backfill" => Ok(RecordOrigin::Backfill),
        other => Err(format!("Invalid record origin: {}", other).into()),
    }
}

fn outcome_str(outcome: TradeOutcome) -> &'static str {
    match outcome {
        TradeOutcome::Win => "Win",
        TradeOutcome::Loss => "Loss",
        TradeOutcome::Flat => "Flat",
    }
}

fn parse_outcome(raw: Option<&str>) -> Result<Option<TradeOutcome>> {
    match raw {
        None => Ok(None),
        Some("Win") => Ok(Some(TradeOutcome::Win)),
        Some("Loss") => Ok(Some(TradeOutcome::Loss)),
        Some("Flat") => Ok(Some(TradeOutcome::Flat)),
        Some(other) => Err(format!("Invalid trade outcome: {}", other).into()),
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "UP",
        Direction::Down => "DOWN",
    }
}

fn parse_direction(raw: Option<&str>) -> Result<Option<Direction>> {
    match raw {
        None => Ok(None),
        Some("UP") => Ok(Some(Direction::Up)),
        Some("DOWN") => Ok(Some(Direction::Down)),
        Some(other) => Err(format!("Invalid direction: {}", other).into()),
    }
}

fn decimal_to_f64(value: rust_decimal::Decimal) -> Result<f64> {
    Ok(value.to_string().parse()?)
}

fn opt_decimal_to_f64(value: Option<rust_decimal::Decimal>) -> Result<Option<f64>> {
    value.map(decimal_to_f64).transpose()
}

fn position_from_row(row: &sqlx::postgres::PgRow) -> Result<Position> {
    let id: Uuid = row.get("id");
    let side_raw: String = row.get("side");
    let status_raw: String = row.get("status");
    let exit_reason_raw: Option<String> = row.get("exit_reason");
    let entry_price: rust_decimal::Decimal = row.get("entry_price");
    let size: rust_decimal::Decimal = row.get("size");
    let target_exit_price: rust_decimal::Decimal = row.get("target_exit_price");
    let exit_price: Option<rust_decimal::Decimal> = row.get("exit_price");
    let realized_pnl: Option<rust_decimal::Decimal> = row.get("realized_pnl");

    Ok(Position {
        id,
        preset_slug: row.get("preset_slug"),
        market_slug: row.get("market_slug"),
        token_id: row.get("token_id"),
        side: parse_side(&side_raw)?,
        window_start: row.get("window_start"),
        window_end: row.get("window_end"),
        entry_price: decimal_to_f64(entry_price)?,
        size: decimal_to_f64(size)?,
        status: parse_status(&status_raw)?,
        entry_order_id: row.get("entry_order_id"),
        exit_order_id: row.get("exit_order_id"),
        target_exit_price: decimal_to_f64(target_exit_price)?,
        entry_time: row.get("entry_time"),
        exit_price: opt_decimal_to_f64(exit_price)?,
        exit_time: row.get("exit_time"),
        exit_reason: parse_exit_reason(exit_reason_raw.as_deref())?,
        realized_pnl: opt_decimal_to_f64(realized_pnl)?,
    })
}

fn candle_from_row(row: &sqlx::postgres::PgRow) -> Result<WindowCandle> {
    let open: Option<rust_decimal::Decimal> = row.get("open_usd");
    let close: Option<rust_decimal::Decimal> = row.get("close_usd");
    let delta: Option<rust_decimal::Decimal> = row.get("delta_usd");
    let direction_raw: Option<String> = row.get("direction");

    Ok(WindowCandle {
        series_slug: row.get("series_slug"),
        window_start: row.get("window_start"),
        window_end: row.get("window_end"),
        open: opt_decimal_to_f64(open)?,
        close: opt_decimal_to_f64(close)?,
        delta: opt_decimal_to_f64(delta)?,
        direction: parse_direction(direction_raw.as_deref())?,
        open_official: row.get("open_official"),
        close_official: row.get("close_official"),
        source: row.get("source"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl TradeStore for PostgresStore {
    async fn save_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, preset_slug, market_slug, token_id, side,
                window_start, window_end, entry_price, size, status,
                entry_order_id, exit_order_id, target_exit_price, entry_time,
                exit_price, exit_time, exit_reason, realized_pnl
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                entry_order_id = EXCLUDED.entry_order_id,
                exit_order_id = EXCLUDED.exit_order_id,
                exit_price = EXCLUDED.exit_price,
                exit_time = EXCLUDED.exit_time,
                exit_reason = EXCLUDED.exit_reason,
                realized_pnl = EXCLUDED.realized_pnl,
                updated_at = NOW()
            "#,
        )
        .bind(position.id)
        .bind(&position.preset_slug)
        .bind(&position.market_slug)
        .bind(&position.token_id)
        .bind(side_str(position.side))
        .bind(position.window_start)
        .bind(position.window_end)
        .bind(position.entry_price)
        .bind(position.size)
        .bind(status_str(position.status))
        .bind(&position.entry_order_id)
        .bind(&position.exit_order_id)
        .bind(position.target_exit_price)
        .bind(&position.entry_time)
        .bind(position.exit_price)
        .bind(position.exit_time)
        .bind(position.exit_reason.map(exit_reason_str))
        .bind(position.realized_pnl)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved position {} ({}) for {}",
            position.id,
            status_str(position.status),
            position.preset_slug
        );
        Ok(())
    }

    async fn load_positions(&self, preset_slug: &str) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, preset_slug, market_slug, token_id, side,
                   window_start, window_end, entry_price, size, status,
                   entry_order_id, exit_order_id, target_exit_price, entry_time,
                   exit_price, exit_time, exit_reason, realized_pnl
            FROM positions
            WHERE preset_slug = $1
            ORDER BY entry_time ASC
            "#,
        )
        .bind(preset_slug)
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in &rows {
            positions.push(position_from_row(row)?);
        }
        Ok(positions)
    }

    async fn append_history(&self, record: &HistoryRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO history_records (
                preset_slug, sequence_id, kind, window_start, position_id,
                price, outcome, origin, unresolved, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (preset_slug, sequence_id) DO NOTHING
            "#,
        )
        .bind(&record.preset_slug)
        .bind(record.sequence_id)
        .bind(kind_str(record.kind))
        .bind(record.window_start)
        .bind(record.position_id)
        .bind(record.price)
        .bind(record.outcome.map(outcome_str))
        .bind(origin_str(record.origin))
        .bind(record.unresolved)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(format!(
                "history sequence id {} already assigned for {}",
                record.sequence_id, record.preset_slug
            )
            .into());
        }
        Ok(())
    }

    async fn load_history(&self, preset_slug: &str) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT preset_slug, sequence_id, kind, window_start, position_id,
                   price, outcome, origin, unresolved, recorded_at
            FROM history_records
            WHERE preset_slug = $1
            ORDER BY sequence_id ASC
            "#,
        )
        .bind(preset_slug)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let kind_raw: String = row.get("kind");
            let outcome_raw: Option<String> = row.get("outcome");
            let origin_raw: String = row.get("origin");
            records.push(HistoryRecord {
                preset_slug: row.get("preset_slug"),
                sequence_id: row.get("sequence_id"),
                kind: parse_kind(&kind_raw)?,
                window_start: row.get("window_start"),
                position_id: row.get("position_id"),
                price: row.get("price"),
                outcome: parse_outcome(outcome_raw.as_deref())?,
                origin: parse_origin(&origin_raw)?,
                unresolved: row.get("unresolved"),
                recorded_at: row.get("recorded_at"),
            });
        }
        Ok(records)
    }

    async fn next_sequence_id(&self, preset_slug: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence_id), 0) AS max_id
            FROM history_records
            WHERE preset_slug = $1
            "#,
        )
        .bind(preset_slug)
        .fetch_one(&self.pool)
        .await?;

        let max_id: i64 = row.get("max_id");
        Ok(max_id + 1)
    }

    async fn upsert_candle(&self, candle: &WindowCandle) -> Result<()> {
        // Official values survive later estimates; estimates fill holes
        sqlx::query(
            r#"
            INSERT INTO window_candles (
                series_slug, window_start, window_end, open_usd, close_usd,
                delta_usd, direction, open_official, close_official, source,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (series_slug, window_start) DO UPDATE SET
                open_usd = CASE
                    WHEN window_candles.open_official AND NOT EXCLUDED.open_official
                        THEN window_candles.open_usd
                    ELSE COALESCE(EXCLUDED.open_usd, window_candles.open_usd)
                END,
                close_usd = CASE
                    WHEN window_candles.close_official AND NOT EXCLUDED.close_official
                        THEN window_candles.close_usd
                    ELSE COALESCE(EXCLUDED.close_usd, window_candles.close_usd)
                END,
                delta_usd = CASE
                    WHEN (window_candles.open_official AND NOT EXCLUDED.open_official)
                      OR (window_candles.close_official AND NOT EXCLUDED.close_official)
                        THEN window_candles.delta_usd
                    ELSE COALESCE(EXCLUDED.delta_usd, window_candles.delta_usd)
                END,
                direction = CASE
                    WHEN (window_candles.open_official AND NOT EXCLUDED.open_official)
                      OR (window_candles.close_official AND NOT EXCLUDED.close_official)
                        THEN window_candles.direction
                    ELSE COALESCE(EXCLUDED.direction, window_candles.direction)
                END,
                open_official = window_candles.open_official OR EXCLUDED.open_official,
                close_official = window_candles.close_official OR EXCLUDED.close_official,
                source = EXCLUDED.source,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&candle.series_slug)
        .bind(candle.window_start)
        .bind(candle.window_end)
        .bind(candle.open)
        .bind(candle.close)
        .bind(candle.delta)
        .bind(candle.direction.map(direction_str))
        .bind(candle.open_official)
        .bind(candle.close_official)
        .bind(&candle.source)
        .bind(candle.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_candles_before(
        &self,
        series_slug: &str,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WindowCandle>> {
        let rows = sqlx::query(
            r#"
            SELECT series_slug, window_start, window_end, open_usd, close_usd,
                   delta_usd, direction, open_official, close_official, source,
                   updated_at
            FROM window_candles
            WHERE series_slug = $1
              AND window_start < $2
              AND close_usd IS NOT NULL
            ORDER BY window_start DESC
            LIMIT $3
            "#,
        )
        .bind(series_slug)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            candles.push(candle_from_row(row)?);
        }
        Ok(candles)
    }

    async fn get_candle(
        &self,
        series_slug: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<WindowCandle>> {
        let row = sqlx::query(
            r#"
            SELECT series_slug, window_start, window_end, open_usd, close_usd,
                   delta_usd, direction, open_official, close_official, source,
                   updated_at
            FROM window_candles
            WHERE series_slug = $1
              AND window_start = $2
            LIMIT 1
            "#,
        )
        .bind(series_slug)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(candle_from_row).transpose()
    }

    async fn save_streak(
        &self,
        preset_slug: &str,
        streak: Option<Streak>,
        as_of: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO streaks (preset_slug, direction, length, as_of_window_start, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (preset_slug) DO UPDATE SET
                direction = EXCLUDED.direction,
                length = EXCLUDED.length,
                as_of_window_start = EXCLUDED.as_of_window_start,
                updated_at = NOW()
            "#,
        )
        .bind(preset_slug)
        .bind(streak.map(|s| direction_str(s.direction)))
        .bind(streak.map(|s| s.length as i32).unwrap_or(0))
        .bind(as_of)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
