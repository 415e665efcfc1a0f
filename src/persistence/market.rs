//! Market reference data and price observations.
//!
//! The write side (`upsert_market`, `record_price`) is the ingestion
//! contract; the trading workers only read.

use super::{get_dec, get_opt_ts, get_ts, opt_ts_to_sql, ts_to_sql, Store};
use crate::model::{Market, PriceObservation};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

impl Store {
    pub fn upsert_market(&self, market: &Market) -> Result<()> {
        let tags = serde_json::to_string(&market.tags)?;
        let tokens = serde_json::to_string(&market.outcome_tokens)?;
        self.conn.execute(
            r#"
            INSERT INTO markets (market_id, question, tags, outcome_tokens, resolves_at, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(market_id) DO UPDATE SET
                question = ?2,
                tags = ?3,
                outcome_tokens = ?4,
                resolves_at = ?5,
                active = ?6
            "#,
            params![
                market.market_id,
                market.question,
                tags,
                tokens,
                opt_ts_to_sql(market.resolves_at),
                market.active,
            ],
        )?;
        Ok(())
    }

    pub fn record_price(&self, obs: &PriceObservation) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO price_observations (market_id, outcome, ts, price, volume_usd)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                obs.market_id,
                obs.outcome,
                ts_to_sql(obs.ts),
                obs.price.to_string(),
                obs.volume_usd.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn get_market(&self, market_id: &str) -> Result<Option<Market>> {
        load_market(&self.conn, market_id)
    }

    /// Resolve an outcome token id to its market and outcome index.
    pub fn market_for_token(&self, token_id: &str) -> Result<Option<(String, u32)>> {
        let found = self
            .conn
            .query_row(
                r#"
                SELECT m.market_id, CAST(t.key AS INTEGER)
                FROM markets m, json_each(m.outcome_tokens) t
                WHERE t.value = ?1
                LIMIT 1
                "#,
                [token_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()?;
        Ok(found)
    }

    /// Markets ranked by observed volume since `since`, above `min_volume`.
    pub fn top_markets_by_volume(
        &self,
        since: DateTime<Utc>,
        min_volume: Decimal,
        limit: usize,
    ) -> Result<Vec<(String, Decimal)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT market_id, SUM(CAST(volume_usd AS REAL)) AS volume
            FROM price_observations
            WHERE ts >= ?1
            GROUP BY market_id
            HAVING volume >= ?2
            ORDER BY volume DESC
            LIMIT ?3
            "#,
        )?;

        let rows = stmt
            .query_map(
                params![
                    ts_to_sql(since),
                    min_volume.to_f64().unwrap_or(0.0),
                    limit as i64
                ],
                |row| {
                    let id: String = row.get(0)?;
                    let volume: f64 = row.get(1)?;
                    Ok((id, Decimal::from_f64(volume).unwrap_or_default().round_dp(2)))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// Outcome indices with observations since `since`.
    pub fn observed_outcomes(&self, market_id: &str, since: DateTime<Utc>) -> Result<Vec<u32>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT outcome FROM price_observations WHERE market_id = ?1 AND ts >= ?2 ORDER BY outcome",
        )?;
        let outcomes = stmt
            .query_map(params![market_id, ts_to_sql(since)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<u32>>>()?;
        Ok(outcomes)
    }

    /// Price samples for one outcome since `since`, oldest first.
    pub fn price_samples(
        &self,
        market_id: &str,
        outcome: u32,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, Decimal)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ts, price FROM price_observations
            WHERE market_id = ?1 AND outcome = ?2 AND ts >= ?3
            ORDER BY ts ASC, id ASC
            "#,
        )?;
        let samples = stmt
            .query_map(params![market_id, outcome, ts_to_sql(since)], |row| {
                Ok((get_ts(row, "ts")?, get_dec(row, "price")?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(samples)
    }

    /// Most recent observation for one outcome.
    pub fn latest_price(
        &self,
        market_id: &str,
        outcome: u32,
    ) -> Result<Option<(DateTime<Utc>, Decimal)>> {
        latest_price(&self.conn, market_id, outcome)
    }
}

pub(crate) fn load_market(conn: &Connection, market_id: &str) -> Result<Option<Market>> {
    let row = conn
        .query_row(
            r#"
            SELECT market_id, question, tags, outcome_tokens, resolves_at, active
            FROM markets WHERE market_id = ?1
            "#,
            [market_id],
            |row| {
                Ok((
                    row.get::<_, String>("market_id")?,
                    row.get::<_, String>("question")?,
                    row.get::<_, String>("tags")?,
                    row.get::<_, String>("outcome_tokens")?,
                    get_opt_ts(row, "resolves_at")?,
                    row.get::<_, bool>("active")?,
                ))
            },
        )
        .optional()?;

    let Some((market_id, question, tags, tokens, resolves_at, active)) = row else {
        return Ok(None);
    };

    Ok(Some(Market {
        tags: serde_json::from_str(&tags)
            .with_context(|| format!("Bad tags for market {}", market_id))?,
        outcome_tokens: serde_json::from_str(&tokens)
            .with_context(|| format!("Bad outcome tokens for market {}", market_id))?,
        market_id,
        question,
        resolves_at,
        active,
    }))
}

pub(crate) fn latest_price(
    conn: &Connection,
    market_id: &str,
    outcome: u32,
) -> Result<Option<(DateTime<Utc>, Decimal)>> {
    let latest = conn
        .query_row(
            r#"
            SELECT ts, price FROM price_observations
            WHERE market_id = ?1 AND outcome = ?2
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
            params![market_id, outcome],
            |row| Ok((get_ts(row, "ts")?, get_dec(row, "price")?)),
        )
        .optional()?;
    Ok(latest)
}
