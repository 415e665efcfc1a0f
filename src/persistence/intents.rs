//! Trade intent queue.

use super::{
    get_opt_dec, get_opt_parsed, get_parsed, get_dec, get_ts, opt_dec_to_sql, ts_to_sql, Store,
};
use crate::model::{ExitReason, IntentAction, IntentKind, IntentStatus, NewIntent, TradeIntent};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const INTENT_COLUMNS: &str = r#"
    id, strategy, market_id, outcome, kind, side, size_usd, quantity, exit_reason,
    signal_price, avg_price, dislocation, reason, status, order_id, note, created_at, expires_at
"#;

/// Per-status intent counts for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentCounts {
    pub pending: u64,
    pub shadow: u64,
    pub ordered: u64,
    pub rejected: u64,
    pub expired: u64,
}

fn intent_from_row(row: &Row<'_>) -> rusqlite::Result<TradeIntent> {
    let kind: IntentKind = get_parsed(row, "kind")?;
    let action = match kind {
        IntentKind::Entry => IntentAction::Open {
            size_usd: get_opt_dec(row, "size_usd")?.unwrap_or_default(),
        },
        IntentKind::Exit => IntentAction::Close {
            quantity: get_opt_dec(row, "quantity")?.unwrap_or_default(),
            exit_reason: get_opt_parsed::<ExitReason>(row, "exit_reason")?
                .unwrap_or(ExitReason::Manual),
        },
    };

    Ok(TradeIntent {
        id: row.get("id")?,
        strategy: row.get("strategy")?,
        market_id: row.get("market_id")?,
        outcome: row.get("outcome")?,
        side: get_parsed(row, "side")?,
        action,
        signal_price: get_dec(row, "signal_price")?,
        avg_price: get_opt_dec(row, "avg_price")?,
        dislocation: get_opt_dec(row, "dislocation")?,
        reason: row.get("reason")?,
        status: get_parsed(row, "status")?,
        order_id: row.get("order_id")?,
        note: row.get("note")?,
        created_at: get_ts(row, "created_at")?,
        expires_at: get_ts(row, "expires_at")?,
    })
}

/// Insert an intent with the given initial status (`pending` or `shadow`).
pub(crate) fn insert_intent(
    conn: &Connection,
    intent: &NewIntent,
    status: IntentStatus,
) -> Result<i64> {
    let (size_usd, quantity, exit_reason) = match &intent.action {
        IntentAction::Open { size_usd } => (Some(*size_usd), None, None),
        IntentAction::Close {
            quantity,
            exit_reason,
        } => (None, Some(*quantity), Some(exit_reason.as_str())),
    };

    conn.execute(
        r#"
        INSERT INTO trade_intents (strategy, market_id, outcome, kind, side, size_usd, quantity,
                                   exit_reason, signal_price, avg_price, dislocation, reason,
                                   status, created_at, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
        params![
            intent.strategy,
            intent.market_id,
            intent.outcome,
            intent.action.kind().as_str(),
            intent.side.as_str(),
            opt_dec_to_sql(size_usd),
            opt_dec_to_sql(quantity),
            exit_reason,
            intent.signal_price.to_string(),
            opt_dec_to_sql(intent.avg_price),
            opt_dec_to_sql(intent.dislocation),
            intent.reason,
            status.as_str(),
            ts_to_sql(intent.created_at),
            ts_to_sql(intent.expires_at),
        ],
    )
    .context("Failed to insert trade intent")?;

    Ok(conn.last_insert_rowid())
}

/// Claim the oldest pending intent for `strategy`.
///
/// The claim is a compare-and-swap on `status = 'pending'`; a concurrent
/// translator that already claimed the row makes this return `None`.
pub(crate) fn claim_next_intent(
    conn: &Connection,
    strategy: &str,
    worker: &str,
    now: DateTime<Utc>,
) -> Result<Option<TradeIntent>> {
    let candidate: Option<TradeIntent> = conn
        .query_row(
            &format!(
                "SELECT {} FROM trade_intents WHERE strategy = ?1 AND status = 'pending' ORDER BY created_at ASC, id ASC LIMIT 1",
                INTENT_COLUMNS
            ),
            [strategy],
            intent_from_row,
        )
        .optional()?;

    let Some(mut intent) = candidate else {
        return Ok(None);
    };

    let claimed = conn.execute(
        r#"
        UPDATE trade_intents SET status = 'claimed', claimed_by = ?2, claimed_at = ?3
        WHERE id = ?1 AND status = 'pending'
        "#,
        params![intent.id, worker, ts_to_sql(now)],
    )?;

    if claimed == 0 {
        return Ok(None);
    }

    intent.status = IntentStatus::Claimed;
    Ok(Some(intent))
}

/// Move a claimed intent to its final status.
pub(crate) fn finish_intent(
    conn: &Connection,
    intent_id: i64,
    status: IntentStatus,
    order_id: Option<i64>,
    note: Option<&str>,
) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE trade_intents SET status = ?2, order_id = ?3, note = ?4
        WHERE id = ?1 AND status = 'claimed'
        "#,
        params![intent_id, status.as_str(), order_id, note],
    )?;
    Ok(updated == 1)
}

impl Store {
    pub fn insert_intent(&self, intent: &NewIntent, status: IntentStatus) -> Result<i64> {
        insert_intent(&self.conn, intent, status)
    }

    pub fn get_intent(&self, id: i64) -> Result<Option<TradeIntent>> {
        let intent = self
            .conn
            .query_row(
                &format!("SELECT {} FROM trade_intents WHERE id = ?1", INTENT_COLUMNS),
                [id],
                intent_from_row,
            )
            .optional()?;
        Ok(intent)
    }

    /// Whether an unconsumed intent of `kind` already exists for the outcome.
    pub fn has_pending_intent(
        &self,
        strategy: &str,
        market_id: &str,
        outcome: u32,
        kind: IntentKind,
    ) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*) FROM trade_intents
            WHERE strategy = ?1 AND market_id = ?2 AND outcome = ?3 AND kind = ?4
              AND status IN ('pending', 'claimed')
            "#,
            params![strategy, market_id, outcome, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether a shadow entry for the outcome is still within its ttl.
    pub fn has_live_shadow_intent(
        &self,
        strategy: &str,
        market_id: &str,
        outcome: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*) FROM trade_intents
            WHERE strategy = ?1 AND market_id = ?2 AND outcome = ?3
              AND status = 'shadow' AND expires_at > ?4
            "#,
            params![strategy, market_id, outcome, ts_to_sql(now)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn intent_counts(&self, strategy: &str) -> Result<IntentCounts> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM trade_intents WHERE strategy = ?1 GROUP BY status",
        )?;
        let mut counts = IntentCounts::default();
        let rows = stmt.query_map([strategy], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            let n = n.max(0) as u64;
            match status.as_str() {
                "pending" | "claimed" => counts.pending += n,
                "shadow" => counts.shadow += n,
                "ordered" => counts.ordered += n,
                "rejected" => counts.rejected += n,
                "expired" => counts.expired += n,
                _ => {}
            }
        }
        Ok(counts)
    }
}
