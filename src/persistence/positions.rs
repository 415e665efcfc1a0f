//! Position ledger and closed-position history.
//!
//! Every write to a position row is guarded by its `version` column; the
//! caller passes the version it read and the update bumps it.

use super::{
    get_dec, get_opt_dec, get_opt_parsed, get_parsed, get_ts, opt_dec_to_sql, ts_to_sql, Store,
};
use crate::model::{ClosedPosition, ExitReason, Position};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

const POSITION_COLUMNS: &str = r#"
    id, strategy, market_id, outcome, quantity, avg_price, opened_at, entry_dislocation,
    entry_quantity, exit_quantity, exit_notional, realized_pnl, max_adverse, max_favourable,
    status, exit_reason, paper, version, updated_at
"#;

/// Aggregate statistics over closed positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClosedSummary {
    pub count: u64,
    pub wins: u64,
    pub realized_pnl: Decimal,
    pub by_reason: Vec<(ExitReason, u64, Decimal)>,
}

impl ClosedSummary {
    pub fn win_rate(&self) -> Decimal {
        if self.count == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(self.count)
    }
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: row.get("id")?,
        strategy: row.get("strategy")?,
        market_id: row.get("market_id")?,
        outcome: row.get("outcome")?,
        quantity: get_dec(row, "quantity")?,
        avg_price: get_dec(row, "avg_price")?,
        opened_at: get_ts(row, "opened_at")?,
        entry_dislocation: get_opt_dec(row, "entry_dislocation")?,
        entry_quantity: get_dec(row, "entry_quantity")?,
        exit_quantity: get_dec(row, "exit_quantity")?,
        exit_notional: get_dec(row, "exit_notional")?,
        realized_pnl: get_dec(row, "realized_pnl")?,
        max_adverse: get_dec(row, "max_adverse")?,
        max_favourable: get_dec(row, "max_favourable")?,
        status: get_parsed(row, "status")?,
        exit_reason: get_opt_parsed(row, "exit_reason")?,
        paper: row.get("paper")?,
        version: row.get("version")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

pub(crate) fn load_position(
    conn: &Connection,
    strategy: &str,
    market_id: &str,
    outcome: u32,
) -> Result<Option<Position>> {
    let position = conn
        .query_row(
            &format!(
                "SELECT {} FROM positions WHERE strategy = ?1 AND market_id = ?2 AND outcome = ?3",
                POSITION_COLUMNS
            ),
            params![strategy, market_id, outcome],
            position_from_row,
        )
        .optional()?;
    Ok(position)
}

/// Insert a new position row at version 1. Returns the row id.
pub(crate) fn insert_position(conn: &Connection, position: &Position) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO positions (strategy, market_id, outcome, quantity, avg_price, opened_at,
                               entry_dislocation, entry_quantity, exit_quantity, exit_notional,
                               realized_pnl, max_adverse, max_favourable, status, exit_reason,
                               paper, version, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 1, ?17)
        "#,
        params![
            position.strategy,
            position.market_id,
            position.outcome,
            position.quantity.to_string(),
            position.avg_price.to_string(),
            ts_to_sql(position.opened_at),
            opt_dec_to_sql(position.entry_dislocation),
            position.entry_quantity.to_string(),
            position.exit_quantity.to_string(),
            position.exit_notional.to_string(),
            position.realized_pnl.to_string(),
            position.max_adverse.to_string(),
            position.max_favourable.to_string(),
            position.status.as_str(),
            position.exit_reason.map(|r| r.as_str()),
            position.paper,
            ts_to_sql(position.updated_at),
        ],
    )
    .context("Failed to insert position")?;
    Ok(conn.last_insert_rowid())
}

/// Write back a position read at `position.version`. Returns false when the
/// row changed underneath the caller.
pub(crate) fn update_position(conn: &Connection, position: &Position) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE positions SET
            quantity = ?3, avg_price = ?4, opened_at = ?5, entry_dislocation = ?6,
            entry_quantity = ?7, exit_quantity = ?8, exit_notional = ?9, realized_pnl = ?10,
            max_adverse = ?11, max_favourable = ?12, status = ?13, exit_reason = ?14,
            updated_at = ?15, version = version + 1
        WHERE id = ?1 AND version = ?2
        "#,
        params![
            position.id,
            position.version,
            position.quantity.to_string(),
            position.avg_price.to_string(),
            ts_to_sql(position.opened_at),
            opt_dec_to_sql(position.entry_dislocation),
            position.entry_quantity.to_string(),
            position.exit_quantity.to_string(),
            position.exit_notional.to_string(),
            position.realized_pnl.to_string(),
            position.max_adverse.to_string(),
            position.max_favourable.to_string(),
            position.status.as_str(),
            position.exit_reason.map(|r| r.as_str()),
            ts_to_sql(position.updated_at),
        ],
    )?;
    Ok(updated == 1)
}

pub(crate) fn delete_position(conn: &Connection, id: i64, version: i64) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM positions WHERE id = ?1 AND version = ?2",
        params![id, version],
    )?;
    Ok(deleted == 1)
}

/// `open → closing(reason)`, guarded by version.
pub(crate) fn begin_closing(
    conn: &Connection,
    id: i64,
    version: i64,
    reason: ExitReason,
    now: DateTime<Utc>,
) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE positions SET status = 'closing', exit_reason = ?3, updated_at = ?4, version = version + 1
        WHERE id = ?1 AND version = ?2 AND status = 'open'
        "#,
        params![id, version, reason.as_str(), ts_to_sql(now)],
    )?;
    Ok(updated == 1)
}

/// `closing → open`, used when the unwind attempt died before any exit.
pub(crate) fn reopen_position(
    conn: &Connection,
    strategy: &str,
    market_id: &str,
    outcome: u32,
    now: DateTime<Utc>,
) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE positions SET status = 'open', exit_reason = NULL, updated_at = ?4, version = version + 1
        WHERE strategy = ?1 AND market_id = ?2 AND outcome = ?3 AND status = 'closing'
        "#,
        params![strategy, market_id, outcome, ts_to_sql(now)],
    )?;
    Ok(updated == 1)
}

pub(crate) fn insert_closed(conn: &Connection, closed: &ClosedPosition) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO closed_positions (strategy, market_id, outcome, direction, entry_price, entry_at,
                                      exit_price, exit_at, size, entry_dislocation, exit_reason,
                                      realized_pnl, paper)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            closed.strategy,
            closed.market_id,
            closed.outcome,
            closed.direction,
            closed.entry_price.to_string(),
            ts_to_sql(closed.entry_at),
            closed.exit_price.to_string(),
            ts_to_sql(closed.exit_at),
            closed.size.to_string(),
            opt_dec_to_sql(closed.entry_dislocation),
            closed.exit_reason.as_str(),
            closed.realized_pnl.to_string(),
            closed.paper,
        ],
    )
    .context("Failed to insert closed position")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn count_positions(conn: &Connection, strategy: &str) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM positions WHERE strategy = ?1",
        [strategy],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u32)
}

pub(crate) fn count_positions_in_market(
    conn: &Connection,
    strategy: &str,
    market_id: &str,
) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM positions WHERE strategy = ?1 AND market_id = ?2",
        params![strategy, market_id],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u32)
}

fn closed_from_row(row: &Row<'_>) -> rusqlite::Result<ClosedPosition> {
    Ok(ClosedPosition {
        strategy: row.get("strategy")?,
        market_id: row.get("market_id")?,
        outcome: row.get("outcome")?,
        direction: row.get("direction")?,
        entry_price: get_dec(row, "entry_price")?,
        entry_at: get_ts(row, "entry_at")?,
        exit_price: get_dec(row, "exit_price")?,
        exit_at: get_ts(row, "exit_at")?,
        size: get_dec(row, "size")?,
        entry_dislocation: get_opt_dec(row, "entry_dislocation")?,
        exit_reason: get_parsed(row, "exit_reason")?,
        realized_pnl: get_dec(row, "realized_pnl")?,
        paper: row.get("paper")?,
    })
}

impl Store {
    pub fn get_position(
        &self,
        strategy: &str,
        market_id: &str,
        outcome: u32,
    ) -> Result<Option<Position>> {
        load_position(&self.conn, strategy, market_id, outcome)
    }

    /// All ledger positions for a strategy, open and closing.
    pub fn positions(&self, strategy: &str) -> Result<Vec<Position>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM positions WHERE strategy = ?1 ORDER BY opened_at ASC, id ASC",
            POSITION_COLUMNS
        ))?;
        let positions = stmt
            .query_map([strategy], position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    pub fn count_positions(&self, strategy: &str) -> Result<u32> {
        count_positions(&self.conn, strategy)
    }

    pub fn count_positions_in_market(&self, strategy: &str, market_id: &str) -> Result<u32> {
        count_positions_in_market(&self.conn, strategy, market_id)
    }

    /// Update excursion extremes, guarded by version.
    pub fn update_excursions(&self, position: &Position, now: DateTime<Utc>) -> Result<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE positions SET max_adverse = ?3, max_favourable = ?4, updated_at = ?5, version = version + 1
            WHERE id = ?1 AND version = ?2
            "#,
            params![
                position.id,
                position.version,
                position.max_adverse.to_string(),
                position.max_favourable.to_string(),
                ts_to_sql(now),
            ],
        )?;
        Ok(updated == 1)
    }

    pub fn reopen_position(
        &self,
        strategy: &str,
        market_id: &str,
        outcome: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        reopen_position(&self.conn, strategy, market_id, outcome, now)
    }

    /// Closed positions for a strategy since `since`, newest first.
    pub fn closed_positions(
        &self,
        strategy: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClosedPosition>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT * FROM closed_positions
            WHERE strategy = ?1 AND exit_at >= ?2
            ORDER BY exit_at DESC, id DESC
            LIMIT ?3
            "#,
        )?;
        let closed = stmt
            .query_map(
                params![strategy, ts_to_sql(since), limit as i64],
                closed_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(closed)
    }

    /// Cumulative realized pnl of all closes in one market.
    pub fn market_realized_pnl(&self, strategy: &str, market_id: &str) -> Result<Decimal> {
        let mut stmt = self.conn.prepare(
            "SELECT realized_pnl FROM closed_positions WHERE strategy = ?1 AND market_id = ?2",
        )?;
        let total = stmt
            .query_map(params![strategy, market_id], |row| get_dec(row, "realized_pnl"))?
            .try_fold(Decimal::ZERO, |acc, pnl| pnl.map(|p| acc + p))?;
        Ok(total)
    }

    pub fn closed_summary(&self, strategy: &str, since: DateTime<Utc>) -> Result<ClosedSummary> {
        let closed = self.closed_positions(strategy, since, usize::MAX >> 1)?;
        let mut summary = ClosedSummary::default();
        for record in &closed {
            summary.count += 1;
            if record.realized_pnl > Decimal::ZERO {
                summary.wins += 1;
            }
            summary.realized_pnl += record.realized_pnl;
            match summary
                .by_reason
                .iter_mut()
                .find(|(reason, _, _)| *reason == record.exit_reason)
            {
                Some(entry) => {
                    entry.1 += 1;
                    entry.2 += record.realized_pnl;
                }
                None => summary
                    .by_reason
                    .push((record.exit_reason, 1, record.realized_pnl)),
            }
        }
        Ok(summary)
    }
}
