//! Strategy orders and fills.
//!
//! Status changes are compare-and-swap updates keyed on the current status,
//! checked against [`OrderStatus::can_transition_to`] first, so a stale
//! worker can never move an order backwards.

use super::{
    get_dec, get_json, get_opt_ts, get_parsed, get_ts, opt_ts_to_sql, ts_to_sql, Store,
};
use crate::model::{NewOrder, OrderStatus, StrategyOrder};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

const ORDER_COLUMNS: &str = r#"
    id, strategy, market_id, outcome, token_id, kind, quantity, limit_price, status, paper,
    intent_id, client_order_id, exchange_order_id, filled_quantity, attempts, next_attempt_at,
    unknown_outcome, last_error, last_fill_at, metadata, created_at, updated_at
"#;

const WORKING: &str = "('submitted', 'live', 'partially_filled')";

/// Outcome of one submission attempt that left the order in `submitted`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAttempt {
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub unknown_outcome: bool,
    pub last_error: Option<String>,
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<StrategyOrder> {
    Ok(StrategyOrder {
        id: row.get("id")?,
        strategy: row.get("strategy")?,
        market_id: row.get("market_id")?,
        outcome: row.get("outcome")?,
        token_id: row.get("token_id")?,
        kind: get_parsed(row, "kind")?,
        quantity: get_dec(row, "quantity")?,
        limit_price: get_dec(row, "limit_price")?,
        status: get_parsed(row, "status")?,
        paper: row.get("paper")?,
        intent_id: row.get("intent_id")?,
        client_order_id: row.get("client_order_id")?,
        exchange_order_id: row.get("exchange_order_id")?,
        filled_quantity: get_dec(row, "filled_quantity")?,
        attempts: row.get("attempts")?,
        next_attempt_at: get_opt_ts(row, "next_attempt_at")?,
        unknown_outcome: row.get("unknown_outcome")?,
        last_error: row.get("last_error")?,
        last_fill_at: get_opt_ts(row, "last_fill_at")?,
        metadata: get_json(row, "metadata")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

/// Insert an order for an intent. Returns `None` when the intent already has
/// an order.
pub(crate) fn insert_order(conn: &Connection, order: &NewOrder) -> Result<Option<i64>> {
    let inserted = conn
        .execute(
            r#"
            INSERT INTO strategy_orders (strategy, market_id, outcome, token_id, kind, quantity,
                                         limit_price, status, paper, intent_id, client_order_id,
                                         metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'submitted', ?8, ?9, ?10, ?11, ?12, ?12)
            ON CONFLICT DO NOTHING
            "#,
            params![
                order.strategy,
                order.market_id,
                order.outcome,
                order.token_id,
                order.kind.as_str(),
                order.quantity.to_string(),
                order.limit_price.to_string(),
                order.paper,
                order.intent_id,
                order.client_order_id(),
                order.metadata.to_string(),
                ts_to_sql(order.created_at),
            ],
        )
        .context("Failed to insert strategy order")?;

    if inserted == 0 {
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

pub(crate) fn load_order(conn: &Connection, id: i64) -> Result<Option<StrategyOrder>> {
    let order = conn
        .query_row(
            &format!("SELECT {} FROM strategy_orders WHERE id = ?1", ORDER_COLUMNS),
            [id],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

/// Compare-and-swap the order status from `from` to `to`.
pub(crate) fn transition_order(
    conn: &Connection,
    id: i64,
    from: OrderStatus,
    to: OrderStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    anyhow::ensure!(
        from.can_transition_to(to),
        "illegal order transition {} -> {} for order {}",
        from,
        to,
        id
    );

    let updated = conn.execute(
        r#"
        UPDATE strategy_orders
        SET status = ?3, last_error = COALESCE(?4, last_error), updated_at = ?5
        WHERE id = ?1 AND status = ?2
        "#,
        params![id, from.as_str(), to.as_str(), error, ts_to_sql(now)],
    )?;
    Ok(updated == 1)
}

/// Record fill progress, optionally moving the status forward.
pub(crate) fn record_fill_progress(
    conn: &Connection,
    id: i64,
    from: OrderStatus,
    to: OrderStatus,
    filled_quantity: Decimal,
    last_fill_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    anyhow::ensure!(
        from == to || from.can_transition_to(to),
        "illegal order transition {} -> {} for order {}",
        from,
        to,
        id
    );

    let updated = conn.execute(
        r#"
        UPDATE strategy_orders
        SET status = ?3, filled_quantity = ?4, last_fill_at = ?5, updated_at = ?6
        WHERE id = ?1 AND status = ?2
        "#,
        params![
            id,
            from.as_str(),
            to.as_str(),
            filled_quantity.to_string(),
            ts_to_sql(last_fill_at),
            ts_to_sql(now),
        ],
    )?;
    Ok(updated == 1)
}

/// Append a fill. Returns false when the exchange fill id was already recorded.
pub(crate) fn insert_fill(
    conn: &Connection,
    order_id: i64,
    exchange_fill_id: &str,
    quantity: Decimal,
    price: Decimal,
    ts: DateTime<Utc>,
    paper: bool,
) -> Result<bool> {
    let inserted = conn.execute(
        r#"
        INSERT INTO fills (order_id, exchange_fill_id, quantity, price, ts, paper)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(exchange_fill_id) DO NOTHING
        "#,
        params![
            order_id,
            exchange_fill_id,
            quantity.to_string(),
            price.to_string(),
            ts_to_sql(ts),
            paper,
        ],
    )?;
    Ok(inserted == 1)
}

/// Whether a non-terminal closing order exists for the outcome.
pub(crate) fn has_open_exit_order(
    conn: &Connection,
    strategy: &str,
    market_id: &str,
    outcome: u32,
) -> Result<bool> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM strategy_orders WHERE strategy = ?1 AND market_id = ?2 AND outcome = ?3 AND kind = 'exit' AND status IN {}",
            WORKING
        ),
        params![strategy, market_id, outcome],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Outcomes with a working entry order but no ledger position yet.
pub(crate) fn count_inflight_entries(conn: &Connection, strategy: &str) -> Result<u32> {
    let count: i64 = conn.query_row(
        &format!(
            r#"
            SELECT COUNT(DISTINCT o.market_id || '#' || o.outcome) FROM strategy_orders o
            WHERE o.strategy = ?1 AND o.kind = 'entry' AND o.status IN {}
              AND NOT EXISTS (
                  SELECT 1 FROM positions p
                  WHERE p.strategy = o.strategy AND p.market_id = o.market_id AND p.outcome = o.outcome
              )
            "#,
            WORKING
        ),
        [strategy],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u32)
}

pub(crate) fn count_inflight_entries_for_market(
    conn: &Connection,
    strategy: &str,
    market_id: &str,
) -> Result<u32> {
    let count: i64 = conn.query_row(
        &format!(
            r#"
            SELECT COUNT(DISTINCT o.outcome) FROM strategy_orders o
            WHERE o.strategy = ?1 AND o.market_id = ?2 AND o.kind = 'entry' AND o.status IN {}
              AND NOT EXISTS (
                  SELECT 1 FROM positions p
                  WHERE p.strategy = o.strategy AND p.market_id = o.market_id AND p.outcome = o.outcome
              )
            "#,
            WORKING
        ),
        params![strategy, market_id],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u32)
}

impl Store {
    pub fn get_order(&self, id: i64) -> Result<Option<StrategyOrder>> {
        load_order(&self.conn, id)
    }

    /// `submitted` orders due for a submission attempt, oldest first.
    pub fn submittable_orders(
        &self,
        strategy: &str,
        paper: bool,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StrategyOrder>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM strategy_orders
            WHERE strategy = ?1 AND paper = ?2 AND status = 'submitted'
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?3)
            ORDER BY id ASC
            LIMIT ?4
            "#,
            ORDER_COLUMNS
        ))?;
        let orders = stmt
            .query_map(
                params![strategy, paper, ts_to_sql(now), limit as i64],
                order_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// `live` and `partially_filled` orders, oldest first.
    pub fn working_orders(
        &self,
        strategy: &str,
        paper: bool,
        limit: usize,
    ) -> Result<Vec<StrategyOrder>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM strategy_orders
            WHERE strategy = ?1 AND paper = ?2 AND status IN ('live', 'partially_filled')
            ORDER BY id ASC
            LIMIT ?3
            "#,
            ORDER_COLUMNS
        ))?;
        let orders = stmt
            .query_map(params![strategy, paper, limit as i64], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    pub fn transition_order(
        &self,
        id: i64,
        from: OrderStatus,
        to: OrderStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        transition_order(&self.conn, id, from, to, error, now)
    }

    /// `submitted → live`, recording the exchange order id.
    pub fn mark_order_live(
        &self,
        id: i64,
        exchange_order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE strategy_orders
            SET status = 'live',
                exchange_order_id = ?2,
                unknown_outcome = 0,
                next_attempt_at = NULL,
                metadata = json_set(metadata, '$.exchange_order_id', ?2, '$.posted_at', ?3),
                updated_at = ?3
            WHERE id = ?1 AND status = 'submitted'
            "#,
            params![id, exchange_order_id, ts_to_sql(now)],
        )?;
        Ok(updated == 1)
    }

    /// Store retry bookkeeping for an order that stays `submitted`.
    pub fn record_submit_attempt(
        &self,
        id: i64,
        attempt: &OrderAttempt,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE strategy_orders
            SET attempts = ?2, next_attempt_at = ?3, unknown_outcome = ?4, last_error = ?5, updated_at = ?6
            WHERE id = ?1 AND status = 'submitted'
            "#,
            params![
                id,
                attempt.attempts,
                opt_ts_to_sql(attempt.next_attempt_at),
                attempt.unknown_outcome,
                attempt.last_error,
                ts_to_sql(now),
            ],
        )?;
        Ok(updated == 1)
    }

    /// Outcomes with an order that has not reached a terminal status.
    pub fn outcomes_with_working_orders(&self, strategy: &str) -> Result<Vec<(String, u32)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT market_id, outcome FROM strategy_orders WHERE strategy = ?1 AND status IN {} ORDER BY market_id, outcome",
            WORKING
        ))?;
        let rows = stmt
            .query_map([strategy], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Order counts by status for one strategy.
    pub fn order_status_counts(&self, strategy: &str) -> Result<Vec<(OrderStatus, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM strategy_orders WHERE strategy = ?1 GROUP BY status ORDER BY status",
        )?;
        let rows = stmt
            .query_map([strategy], |row| {
                Ok((get_parsed::<OrderStatus>(row, "status")?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(|(s, n)| (s, n.max(0) as u64)).collect())
    }

    /// Signed fill quantities recorded for an order.
    pub fn fills_for_order(&self, order_id: i64) -> Result<Vec<(String, Decimal, Decimal)>> {
        let mut stmt = self.conn.prepare(
            "SELECT exchange_fill_id, quantity, price FROM fills WHERE order_id = ?1 ORDER BY ts ASC, id ASC",
        )?;
        let fills = stmt
            .query_map([order_id], |row| {
                Ok((
                    row.get::<_, String>("exchange_fill_id")?,
                    get_dec(row, "quantity")?,
                    get_dec(row, "price")?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(fills)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{IntentAction, IntentKind, IntentStatus, NewIntent, Side};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    pub(crate) fn seed_order(store: &Store, market: &str, quantity: Decimal) -> i64 {
        let now = Utc::now();
        let intent_id = store
            .insert_intent(
                &NewIntent {
                    strategy: "mr".to_string(),
                    market_id: market.to_string(),
                    outcome: 1,
                    side: Side::from_signed(quantity),
                    action: IntentAction::Open {
                        size_usd: dec!(100),
                    },
                    signal_price: dec!(0.1),
                    avg_price: None,
                    dislocation: None,
                    reason: "test".to_string(),
                    created_at: now,
                    expires_at: now + Duration::minutes(2),
                },
                IntentStatus::Ordered,
            )
            .unwrap();
        insert_order(
            store.conn(),
            &NewOrder {
                strategy: "mr".to_string(),
                market_id: market.to_string(),
                outcome: 1,
                token_id: "tok".to_string(),
                kind: IntentKind::Entry,
                quantity,
                limit_price: dec!(0.101),
                paper: true,
                intent_id,
                metadata: serde_json::json!({ "source": "test" }),
                created_at: now,
            },
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_one_order_per_intent() {
        let store = Store::in_memory().unwrap();
        let id = seed_order(&store, "m1", dec!(1000));
        let order = store.get_order(id).unwrap().unwrap();

        let duplicate = NewOrder {
            strategy: order.strategy.clone(),
            market_id: order.market_id.clone(),
            outcome: order.outcome,
            token_id: order.token_id.clone(),
            kind: order.kind,
            quantity: order.quantity,
            limit_price: order.limit_price,
            paper: true,
            intent_id: order.intent_id,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert_eq!(insert_order(store.conn(), &duplicate).unwrap(), None);
        assert_eq!(order.client_order_id, format!("mr-{}", order.intent_id));
        assert_eq!(order.status, OrderStatus::Submitted);
    }

    #[test]
    fn test_status_cas_is_monotonic() {
        let store = Store::in_memory().unwrap();
        let id = seed_order(&store, "m1", dec!(1000));
        let now = Utc::now();

        assert!(store.mark_order_live(id, "ex-1", now).unwrap());
        // Second live transition loses the CAS
        assert!(!store.mark_order_live(id, "ex-2", now).unwrap());
        // Backwards is rejected outright
        assert!(store
            .transition_order(id, OrderStatus::Live, OrderStatus::Submitted, None, now)
            .is_err());

        let order = store.get_order(id).unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Live);
        assert_eq!(order.exchange_order_id.as_deref(), Some("ex-1"));
        assert_eq!(order.metadata["exchange_order_id"], "ex-1");
        assert_eq!(order.metadata["source"], "test");
    }

    #[test]
    fn test_fill_dedup_by_exchange_id() {
        let store = Store::in_memory().unwrap();
        let id = seed_order(&store, "m1", dec!(1000));
        let now = Utc::now();
        assert!(insert_fill(store.conn(), id, "f1", dec!(400), dec!(0.1), now, true).unwrap());
        assert!(!insert_fill(store.conn(), id, "f1", dec!(400), dec!(0.1), now, true).unwrap());
        assert_eq!(store.fills_for_order(id).unwrap().len(), 1);
    }

    #[test]
    fn test_submittable_respects_backoff() {
        let store = Store::in_memory().unwrap();
        let id = seed_order(&store, "m1", dec!(1000));
        let now = Utc::now();

        store
            .record_submit_attempt(
                id,
                &OrderAttempt {
                    attempts: 1,
                    next_attempt_at: Some(now + Duration::seconds(30)),
                    unknown_outcome: false,
                    last_error: Some("503".to_string()),
                },
                now,
            )
            .unwrap();

        assert!(store.submittable_orders("mr", true, now, 10).unwrap().is_empty());
        let due = store
            .submittable_orders("mr", true, now + Duration::seconds(31), 10)
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert!(store.submittable_orders("mr", false, now + Duration::hours(1), 10).unwrap().is_empty());
    }

    #[test]
    fn test_inflight_entries_counted_per_outcome() {
        let store = Store::in_memory().unwrap();
        seed_order(&store, "m1", dec!(100));
        seed_order(&store, "m2", dec!(100));
        assert_eq!(count_inflight_entries(store.conn(), "mr").unwrap(), 2);
        assert_eq!(count_inflight_entries_for_market(store.conn(), "mr", "m1").unwrap(), 1);
        assert!(!has_open_exit_order(store.conn(), "mr", "m1", 1).unwrap());
        assert_eq!(
            store.outcomes_with_working_orders("mr").unwrap(),
            vec![("m1".to_string(), 1), ("m2".to_string(), 1)]
        );
    }
}
