//! Book of the simulated exchange used for paper trading.
//!
//! Kept apart from the strategy ledger: the paper venue plays the role of
//! the exchange, so reconciliation compares two independent records.

use super::{get_dec, get_ts, ts_to_sql, Store};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrderRow {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub account: String,
    pub market_id: String,
    pub outcome: u32,
    pub token_id: String,
    /// Signed share quantity
    pub quantity: Decimal,
    pub limit_price: Decimal,
    /// `open`, `filled` or `cancelled`
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaperFillRow {
    pub fill_id: String,
    pub exchange_order_id: String,
    pub account: String,
    pub market_id: String,
    pub outcome: u32,
    /// Signed share quantity
    pub quantity: Decimal,
    pub price: Decimal,
    pub ts: DateTime<Utc>,
}

fn paper_order_from_row(row: &Row<'_>) -> rusqlite::Result<PaperOrderRow> {
    Ok(PaperOrderRow {
        exchange_order_id: row.get("exchange_order_id")?,
        client_order_id: row.get("client_order_id")?,
        account: row.get("account")?,
        market_id: row.get("market_id")?,
        outcome: row.get("outcome")?,
        token_id: row.get("token_id")?,
        quantity: get_dec(row, "quantity")?,
        limit_price: get_dec(row, "limit_price")?,
        status: row.get("status")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn paper_fill_from_row(row: &Row<'_>) -> rusqlite::Result<PaperFillRow> {
    Ok(PaperFillRow {
        fill_id: row.get("fill_id")?,
        exchange_order_id: row.get("exchange_order_id")?,
        account: row.get("account")?,
        market_id: row.get("market_id")?,
        outcome: row.get("outcome")?,
        quantity: get_dec(row, "quantity")?,
        price: get_dec(row, "price")?,
        ts: get_ts(row, "ts")?,
    })
}

pub(crate) fn insert_paper_fill(conn: &Connection, fill: &PaperFillRow) -> Result<bool> {
    let inserted = conn.execute(
        r#"
        INSERT INTO paper_fills (fill_id, exchange_order_id, account, market_id, outcome, quantity, price, ts)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(fill_id) DO NOTHING
        "#,
        params![
            fill.fill_id,
            fill.exchange_order_id,
            fill.account,
            fill.market_id,
            fill.outcome,
            fill.quantity.to_string(),
            fill.price.to_string(),
            ts_to_sql(fill.ts),
        ],
    )?;
    Ok(inserted == 1)
}

pub(crate) fn set_paper_order_status(
    conn: &Connection,
    exchange_order_id: &str,
    from: &str,
    to: &str,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE paper_orders SET status = ?3 WHERE exchange_order_id = ?1 AND status = ?2",
        params![exchange_order_id, from, to],
    )?;
    Ok(updated == 1)
}

impl Store {
    pub fn insert_paper_order(&self, order: &PaperOrderRow) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT INTO paper_orders (exchange_order_id, client_order_id, account, market_id, outcome,
                                      token_id, quantity, limit_price, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT DO NOTHING
            "#,
            params![
                order.exchange_order_id,
                order.client_order_id,
                order.account,
                order.market_id,
                order.outcome,
                order.token_id,
                order.quantity.to_string(),
                order.limit_price.to_string(),
                order.status,
                ts_to_sql(order.created_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn paper_order(&self, exchange_order_id: &str) -> Result<Option<PaperOrderRow>> {
        let order = self
            .conn
            .query_row(
                "SELECT * FROM paper_orders WHERE exchange_order_id = ?1",
                [exchange_order_id],
                paper_order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    pub fn paper_order_by_client_id(&self, client_order_id: &str) -> Result<Option<PaperOrderRow>> {
        let order = self
            .conn
            .query_row(
                "SELECT * FROM paper_orders WHERE client_order_id = ?1",
                [client_order_id],
                paper_order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    /// Fill an open paper order in full, atomically with its status change.
    pub fn fill_paper_order(&mut self, fill: &PaperFillRow) -> Result<bool> {
        let tx = self.write_tx()?;
        if !set_paper_order_status(&tx, &fill.exchange_order_id, "open", "filled")? {
            return Ok(false);
        }
        insert_paper_fill(&tx, fill)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn cancel_paper_order(&self, exchange_order_id: &str) -> Result<bool> {
        set_paper_order_status(&self.conn, exchange_order_id, "open", "cancelled")
    }

    pub fn paper_fills(
        &self,
        exchange_order_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PaperFillRow>> {
        let since = since.map(ts_to_sql).unwrap_or_default();
        let mut stmt = self.conn.prepare(
            r#"
            SELECT * FROM paper_fills
            WHERE exchange_order_id = ?1 AND ts >= ?2
            ORDER BY ts ASC, fill_id ASC
            "#,
        )?;
        let fills = stmt
            .query_map(params![exchange_order_id, since], paper_fill_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(fills)
    }

    /// Net paper holdings per outcome for an account.
    pub fn paper_positions(&self, account: &str) -> Result<Vec<(String, u32, Decimal)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT market_id, outcome, quantity FROM paper_fills
            WHERE account = ?1
            ORDER BY market_id, outcome
            "#,
        )?;
        let rows = stmt
            .query_map([account], |row| {
                Ok((
                    row.get::<_, String>("market_id")?,
                    row.get::<_, u32>("outcome")?,
                    get_dec(row, "quantity")?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut net: Vec<(String, u32, Decimal)> = Vec::new();
        for (market, outcome, qty) in rows {
            match net.last_mut() {
                Some(last) if last.0 == market && last.1 == outcome => last.2 += qty,
                _ => net.push((market, outcome, qty)),
            }
        }
        net.retain(|(_, _, qty)| !qty.is_zero());
        Ok(net)
    }
}
