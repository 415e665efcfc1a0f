//! SQLite store shared by every worker process.
//!
//! The store is the only synchronization point between workers:
//! - Market reference data and price observations (written by ingestion)
//! - Trade intents, strategy orders and fills
//! - The position ledger and closed-position history
//! - Risk state (daily pnl, loss streaks, bans, circuit breaker)
//! - Audit trails: shadow fills, heartbeats, reconciliation discrepancies
//! - The simulated exchange's book for paper trading
//!
//! Each process opens its own connection. WAL mode plus a busy timeout lets
//! readers proceed while one writer holds the lock; multi-row state changes
//! run inside `BEGIN IMMEDIATE` transactions so they serialize across
//! processes.

mod audit;
mod intents;
mod market;
mod orders;
mod paper;
mod positions;
mod risk;

pub use audit::{Discrepancy, ShadowFill, WorkerHeartbeat};
pub use intents::IntentCounts;
pub use orders::OrderAttempt;
pub use paper::{PaperFillRow, PaperOrderRow};
pub use positions::ClosedSummary;
pub use risk::{MarketRiskState, StrategyRiskState};

pub(crate) use intents::{claim_next_intent, finish_intent, insert_intent};
pub(crate) use orders::{
    count_inflight_entries, count_inflight_entries_for_market, has_open_exit_order, insert_fill,
    insert_order, load_order, record_fill_progress, transition_order,
};
pub(crate) use positions::{
    begin_closing, count_positions, count_positions_in_market, delete_position, insert_closed,
    insert_position, load_position, reopen_position, update_position,
};
pub(crate) use market::{latest_price, load_market};
pub(crate) use risk::{load_market_risk, load_strategy_risk, save_market_risk, save_strategy_risk};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Handle to the shared store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the store at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let store = Self { conn };
        store.configure()?;
        store.init_schema()?;

        info!("Store opened at {:?}", path);
        Ok(store)
    }

    /// Private in-memory store, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn };
        store.configure()?;
        store.init_schema()?;
        Ok(store)
    }

    fn configure(&self) -> Result<()> {
        self.conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        self.conn.pragma_update(None, "foreign_keys", true)?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!(journal_mode = %mode, "Store connection configured");
        Ok(())
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Market reference data (ingestion-owned)
            CREATE TABLE IF NOT EXISTS markets (
                market_id TEXT PRIMARY KEY,
                question TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                outcome_tokens TEXT NOT NULL DEFAULT '[]',
                resolves_at TEXT,
                active INTEGER NOT NULL DEFAULT 1
            );

            -- Price observations (ingestion-owned, append-only)
            CREATE TABLE IF NOT EXISTS price_observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                market_id TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                ts TEXT NOT NULL,
                price TEXT NOT NULL,
                volume_usd TEXT NOT NULL DEFAULT '0'
            );
            CREATE INDEX IF NOT EXISTS idx_prices_outcome_ts ON price_observations(market_id, outcome, ts);
            CREATE INDEX IF NOT EXISTS idx_prices_ts ON price_observations(ts);

            -- Trade intents
            CREATE TABLE IF NOT EXISTS trade_intents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                kind TEXT NOT NULL,
                side TEXT NOT NULL,
                size_usd TEXT,
                quantity TEXT,
                exit_reason TEXT,
                signal_price TEXT NOT NULL,
                avg_price TEXT,
                dislocation TEXT,
                reason TEXT NOT NULL,
                status TEXT NOT NULL,
                order_id INTEGER,
                note TEXT,
                claimed_by TEXT,
                claimed_at TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_intents_queue ON trade_intents(strategy, status, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_intents_outcome ON trade_intents(strategy, market_id, outcome, status);

            -- Strategy orders
            CREATE TABLE IF NOT EXISTS strategy_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                token_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                quantity TEXT NOT NULL,
                limit_price TEXT NOT NULL,
                status TEXT NOT NULL,
                paper INTEGER NOT NULL,
                intent_id INTEGER NOT NULL UNIQUE REFERENCES trade_intents(id),
                client_order_id TEXT NOT NULL UNIQUE,
                exchange_order_id TEXT,
                filled_quantity TEXT NOT NULL DEFAULT '0',
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT,
                unknown_outcome INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_fill_at TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status ON strategy_orders(strategy, status, paper, id);
            CREATE INDEX IF NOT EXISTS idx_orders_outcome ON strategy_orders(strategy, market_id, outcome, status);

            -- Fills (append-only)
            CREATE TABLE IF NOT EXISTS fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id INTEGER NOT NULL REFERENCES strategy_orders(id) ON DELETE CASCADE,
                exchange_fill_id TEXT NOT NULL UNIQUE,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                ts TEXT NOT NULL,
                paper INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(order_id);

            -- Position ledger
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                quantity TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                entry_dislocation TEXT,
                entry_quantity TEXT NOT NULL,
                exit_quantity TEXT NOT NULL,
                exit_notional TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                max_adverse TEXT NOT NULL,
                max_favourable TEXT NOT NULL,
                status TEXT NOT NULL,
                exit_reason TEXT,
                paper INTEGER NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(strategy, market_id, outcome)
            );

            -- Closed position history (immutable)
            CREATE TABLE IF NOT EXISTS closed_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                direction INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                entry_at TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                exit_at TEXT NOT NULL,
                size TEXT NOT NULL,
                entry_dislocation TEXT,
                exit_reason TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                paper INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_closed_strategy ON closed_positions(strategy, exit_at);
            CREATE INDEX IF NOT EXISTS idx_closed_market ON closed_positions(strategy, market_id);

            -- Risk state
            CREATE TABLE IF NOT EXISTS risk_strategy (
                strategy TEXT PRIMARY KEY,
                day TEXT NOT NULL,
                daily_realized_pnl TEXT NOT NULL,
                breaker_until TEXT,
                breaker_reason TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS risk_markets (
                strategy TEXT NOT NULL,
                market_id TEXT NOT NULL,
                loss_streak INTEGER NOT NULL DEFAULT 0,
                banned_until TEXT,
                ban_reason TEXT,
                last_close_at TEXT,
                cumulative_pnl TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (strategy, market_id)
            );

            -- Shadow-mode hypothetical fills
            CREATE TABLE IF NOT EXISTS shadow_fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                side TEXT NOT NULL,
                ts TEXT NOT NULL,
                size TEXT NOT NULL,
                signal_price TEXT NOT NULL,
                sim_entry_price TEXT NOT NULL,
                avg_price TEXT,
                dislocation TEXT,
                intent_id INTEGER,
                notes TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_shadow_strategy ON shadow_fills(strategy, ts);

            -- Simulated exchange book (paper trading)
            CREATE TABLE IF NOT EXISTS paper_orders (
                exchange_order_id TEXT PRIMARY KEY,
                client_order_id TEXT NOT NULL UNIQUE,
                account TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                token_id TEXT NOT NULL,
                quantity TEXT NOT NULL,
                limit_price TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS paper_fills (
                fill_id TEXT PRIMARY KEY,
                exchange_order_id TEXT NOT NULL REFERENCES paper_orders(exchange_order_id),
                account TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_paper_fills_order ON paper_fills(exchange_order_id, ts);

            -- Worker liveness
            CREATE TABLE IF NOT EXISTS worker_heartbeats (
                worker TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                host TEXT NOT NULL,
                started_at TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                cycles INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );

            -- Ledger vs exchange mismatches awaiting review
            CREATE TABLE IF NOT EXISTS reconciliation_discrepancies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                market_id TEXT NOT NULL,
                outcome INTEGER NOT NULL,
                ledger_quantity TEXT NOT NULL,
                exchange_quantity TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                note TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_discrepancies_strategy ON reconciliation_discrepancies(strategy, detected_at);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start a write transaction that takes the database write lock up front.
    ///
    /// Every read inside it sees a state no other writer can change before
    /// commit, which is what the position merge and intent claim rely on.
    pub fn write_tx(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin write transaction")
    }
}

// ==================== Column codecs ====================

/// Timestamps are stored as fixed-precision RFC 3339 UTC so that string
/// order equals time order.
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts_to_sql(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(ts_to_sql)
}

pub(crate) fn opt_dec_to_sql(value: Option<Decimal>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn conversion_error<E>(row: &Row<'_>, column: &str, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let index = row.as_ref().column_index(column).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err.into())
}

pub(crate) fn get_dec(row: &Row<'_>, column: &str) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(column)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(row, column, e))
}

pub(crate) fn get_opt_dec(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_error(row, column, e)))
        .transpose()
}

pub(crate) fn get_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    parse_ts(&raw).map_err(|e| conversion_error(row, column, e))
}

pub(crate) fn get_opt_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| parse_ts(&s).map_err(|e| conversion_error(row, column, e)))
        .transpose()
}

/// Parse a column through the type's `FromStr` (status enums and the like).
pub(crate) fn get_parsed<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(column)?;
    raw.parse::<T>().map_err(|e| conversion_error(row, column, e))
}

pub(crate) fn get_opt_parsed<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| s.parse::<T>().map_err(|e| conversion_error(row, column, e)))
        .transpose()
}

pub(crate) fn get_json(row: &Row<'_>, column: &str) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(row, column, e))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}
