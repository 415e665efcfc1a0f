//! Persisted risk state.
//!
//! Bans and the circuit breaker are stored as expiry timestamps and compared
//! against the caller's clock, so they lapse without any background job.

use super::{get_dec, get_opt_ts, opt_ts_to_sql, ts_to_sql, Store};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;

/// Per-strategy daily counters and circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyRiskState {
    pub strategy: String,
    /// UTC trading day the pnl counter belongs to
    pub day: NaiveDate,
    pub daily_realized_pnl: Decimal,
    pub breaker_until: Option<DateTime<Utc>>,
    pub breaker_reason: Option<String>,
}

impl StrategyRiskState {
    pub fn new(strategy: &str, day: NaiveDate) -> Self {
        Self {
            strategy: strategy.to_string(),
            day,
            daily_realized_pnl: Decimal::ZERO,
            breaker_until: None,
            breaker_reason: None,
        }
    }

    pub fn breaker_active(&self, now: DateTime<Utc>) -> bool {
        self.breaker_until.is_some_and(|until| until > now)
    }
}

/// Per-market loss streak, ban and cooldown.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketRiskState {
    pub strategy: String,
    pub market_id: String,
    pub loss_streak: u32,
    pub banned_until: Option<DateTime<Utc>>,
    pub ban_reason: Option<String>,
    pub last_close_at: Option<DateTime<Utc>>,
    pub cumulative_pnl: Decimal,
}

impl MarketRiskState {
    pub fn new(strategy: &str, market_id: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            market_id: market_id.to_string(),
            loss_streak: 0,
            banned_until: None,
            ban_reason: None,
            last_close_at: None,
            cumulative_pnl: Decimal::ZERO,
        }
    }

    pub fn ban_active(&self, now: DateTime<Utc>) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }
}

pub(crate) fn load_strategy_risk(
    conn: &Connection,
    strategy: &str,
) -> Result<Option<StrategyRiskState>> {
    let state = conn
        .query_row(
            r#"
            SELECT strategy, day, daily_realized_pnl, breaker_until, breaker_reason
            FROM risk_strategy WHERE strategy = ?1
            "#,
            [strategy],
            |row| {
                let day: String = row.get("day")?;
                Ok((
                    StrategyRiskState {
                        strategy: row.get("strategy")?,
                        day: NaiveDate::MIN,
                        daily_realized_pnl: get_dec(row, "daily_realized_pnl")?,
                        breaker_until: get_opt_ts(row, "breaker_until")?,
                        breaker_reason: row.get("breaker_reason")?,
                    },
                    day,
                ))
            },
        )
        .optional()?;

    let Some((mut state, day)) = state else {
        return Ok(None);
    };
    state.day = NaiveDate::parse_from_str(&day, "%Y-%m-%d")?;
    Ok(Some(state))
}

pub(crate) fn save_strategy_risk(
    conn: &Connection,
    state: &StrategyRiskState,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO risk_strategy (strategy, day, daily_realized_pnl, breaker_until, breaker_reason, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(strategy) DO UPDATE SET
            day = ?2,
            daily_realized_pnl = ?3,
            breaker_until = ?4,
            breaker_reason = ?5,
            updated_at = ?6
        "#,
        params![
            state.strategy,
            state.day.format("%Y-%m-%d").to_string(),
            state.daily_realized_pnl.to_string(),
            opt_ts_to_sql(state.breaker_until),
            state.breaker_reason,
            ts_to_sql(now),
        ],
    )?;
    Ok(())
}

pub(crate) fn load_market_risk(
    conn: &Connection,
    strategy: &str,
    market_id: &str,
) -> Result<Option<MarketRiskState>> {
    let state = conn
        .query_row(
            r#"
            SELECT strategy, market_id, loss_streak, banned_until, ban_reason, last_close_at, cumulative_pnl
            FROM risk_markets WHERE strategy = ?1 AND market_id = ?2
            "#,
            params![strategy, market_id],
            |row| {
                Ok(MarketRiskState {
                    strategy: row.get("strategy")?,
                    market_id: row.get("market_id")?,
                    loss_streak: row.get("loss_streak")?,
                    banned_until: get_opt_ts(row, "banned_until")?,
                    ban_reason: row.get("ban_reason")?,
                    last_close_at: get_opt_ts(row, "last_close_at")?,
                    cumulative_pnl: get_dec(row, "cumulative_pnl")?,
                })
            },
        )
        .optional()?;
    Ok(state)
}

pub(crate) fn save_market_risk(
    conn: &Connection,
    state: &MarketRiskState,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO risk_markets (strategy, market_id, loss_streak, banned_until, ban_reason,
                                  last_close_at, cumulative_pnl, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(strategy, market_id) DO UPDATE SET
            loss_streak = ?3,
            banned_until = ?4,
            ban_reason = ?5,
            last_close_at = ?6,
            cumulative_pnl = ?7,
            updated_at = ?8
        "#,
        params![
            state.strategy,
            state.market_id,
            state.loss_streak,
            opt_ts_to_sql(state.banned_until),
            state.ban_reason,
            opt_ts_to_sql(state.last_close_at),
            state.cumulative_pnl.to_string(),
            ts_to_sql(now),
        ],
    )?;
    Ok(())
}

impl Store {
    pub fn strategy_risk(&self, strategy: &str) -> Result<Option<StrategyRiskState>> {
        load_strategy_risk(&self.conn, strategy)
    }

    pub fn market_risk(&self, strategy: &str, market_id: &str) -> Result<Option<MarketRiskState>> {
        load_market_risk(&self.conn, strategy, market_id)
    }

    pub fn save_strategy_risk(&self, state: &StrategyRiskState, now: DateTime<Utc>) -> Result<()> {
        save_strategy_risk(&self.conn, state, now)
    }

    pub fn save_market_risk(&self, state: &MarketRiskState, now: DateTime<Utc>) -> Result<()> {
        save_market_risk(&self.conn, state, now)
    }

    /// Markets whose ban has not yet expired.
    pub fn active_bans(&self, strategy: &str, now: DateTime<Utc>) -> Result<Vec<MarketRiskState>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT market_id FROM risk_markets
            WHERE strategy = ?1 AND banned_until IS NOT NULL AND banned_until > ?2
            ORDER BY banned_until ASC
            "#,
        )?;
        let ids = stmt
            .query_map(params![strategy, ts_to_sql(now)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut bans = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(state) = load_market_risk(&self.conn, strategy, &id)? {
                bans.push(state);
            }
        }
        Ok(bans)
    }
}
