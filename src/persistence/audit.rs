//! Audit trails: shadow fills, worker heartbeats, reconciliation discrepancies.

use super::{get_dec, get_opt_dec, get_ts, opt_dec_to_sql, ts_to_sql, Store};
use crate::model::Side;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;

/// Hypothetical fill recorded instead of an order in shadow mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowFill {
    pub strategy: String,
    pub market_id: String,
    pub outcome: u32,
    pub side: Side,
    pub ts: DateTime<Utc>,
    pub size: Decimal,
    pub signal_price: Decimal,
    /// Signal price after configured slippage
    pub sim_entry_price: Decimal,
    pub avg_price: Option<Decimal>,
    pub dislocation: Option<Decimal>,
    pub intent_id: Option<i64>,
    pub notes: Option<String>,
}

/// Last recorded liveness of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHeartbeat {
    pub worker: String,
    pub pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub cycles: u64,
    pub last_error: Option<String>,
}

impl WorkerHeartbeat {
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.last_seen > max_age
    }
}

/// Ledger vs exchange quantity mismatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub strategy: String,
    pub market_id: String,
    pub outcome: u32,
    pub ledger_quantity: Decimal,
    pub exchange_quantity: Decimal,
    pub detected_at: DateTime<Utc>,
    pub note: Option<String>,
}

impl Store {
    pub fn record_shadow_fill(&self, fill: &ShadowFill) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO shadow_fills (strategy, market_id, outcome, side, ts, size, signal_price,
                                      sim_entry_price, avg_price, dislocation, intent_id, notes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                fill.strategy,
                fill.market_id,
                fill.outcome,
                fill.side.as_str(),
                ts_to_sql(fill.ts),
                fill.size.to_string(),
                fill.signal_price.to_string(),
                fill.sim_entry_price.to_string(),
                opt_dec_to_sql(fill.avg_price),
                opt_dec_to_sql(fill.dislocation),
                fill.intent_id,
                fill.notes,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn shadow_fills(&self, strategy: &str, limit: usize) -> Result<Vec<ShadowFill>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT * FROM shadow_fills WHERE strategy = ?1
            ORDER BY ts DESC, id DESC LIMIT ?2
            "#,
        )?;
        let fills = stmt
            .query_map(params![strategy, limit as i64], |row| {
                Ok(ShadowFill {
                    strategy: row.get("strategy")?,
                    market_id: row.get("market_id")?,
                    outcome: row.get("outcome")?,
                    side: super::get_parsed(row, "side")?,
                    ts: get_ts(row, "ts")?,
                    size: get_dec(row, "size")?,
                    signal_price: get_dec(row, "signal_price")?,
                    sim_entry_price: get_dec(row, "sim_entry_price")?,
                    avg_price: get_opt_dec(row, "avg_price")?,
                    dislocation: get_opt_dec(row, "dislocation")?,
                    intent_id: row.get("intent_id")?,
                    notes: row.get("notes")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(fills)
    }

    /// Upsert a heartbeat. `cycles` is incremented on every beat.
    pub fn beat(
        &self,
        worker: &str,
        pid: u32,
        host: &str,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO worker_heartbeats (worker, pid, host, started_at, last_seen, cycles, last_error)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
            ON CONFLICT(worker) DO UPDATE SET
                pid = ?2,
                host = ?3,
                started_at = ?4,
                last_seen = ?5,
                cycles = CASE WHEN worker_heartbeats.started_at = ?4 THEN worker_heartbeats.cycles + 1 ELSE 1 END,
                last_error = ?6
            "#,
            params![worker, pid, host, ts_to_sql(started_at), ts_to_sql(now), last_error],
        )?;
        Ok(())
    }

    pub fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM worker_heartbeats ORDER BY worker ASC")?;
        let beats = stmt
            .query_map([], |row| {
                Ok(WorkerHeartbeat {
                    worker: row.get("worker")?,
                    pid: row.get("pid")?,
                    host: row.get("host")?,
                    started_at: get_ts(row, "started_at")?,
                    last_seen: get_ts(row, "last_seen")?,
                    cycles: row.get::<_, i64>("cycles")?.max(0) as u64,
                    last_error: row.get("last_error")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(beats)
    }

    /// Insert a discrepancy unless the latest one for the same outcome
    /// already reports the same quantities. Returns the new row id.
    pub fn record_discrepancy(&self, discrepancy: &Discrepancy) -> Result<Option<i64>> {
        let latest = self
            .conn
            .query_row(
                r#"
                SELECT * FROM reconciliation_discrepancies
                WHERE strategy = ?1 AND market_id = ?2 AND outcome = ?3
                ORDER BY detected_at DESC, id DESC
                LIMIT 1
                "#,
                params![discrepancy.strategy, discrepancy.market_id, discrepancy.outcome],
                |row| Ok((get_dec(row, "ledger_quantity")?, get_dec(row, "exchange_quantity")?)),
            )
            .optional()?;
        if latest == Some((discrepancy.ledger_quantity, discrepancy.exchange_quantity)) {
            return Ok(None);
        }

        self.conn.execute(
            r#"
            INSERT INTO reconciliation_discrepancies (strategy, market_id, outcome, ledger_quantity,
                                                      exchange_quantity, detected_at, note)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                discrepancy.strategy,
                discrepancy.market_id,
                discrepancy.outcome,
                discrepancy.ledger_quantity.to_string(),
                discrepancy.exchange_quantity.to_string(),
                ts_to_sql(discrepancy.detected_at),
                discrepancy.note,
            ],
        )?;
        Ok(Some(self.conn.last_insert_rowid()))
    }

    pub fn discrepancies(&self, strategy: &str, since: DateTime<Utc>) -> Result<Vec<Discrepancy>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT * FROM reconciliation_discrepancies
            WHERE strategy = ?1 AND detected_at >= ?2
            ORDER BY detected_at DESC, id DESC
            "#,
        )?;
        let rows = stmt
            .query_map(params![strategy, ts_to_sql(since)], |row| {
                Ok(Discrepancy {
                    strategy: row.get("strategy")?,
                    market_id: row.get("market_id")?,
                    outcome: row.get("outcome")?,
                    ledger_quantity: get_dec(row, "ledger_quantity")?,
                    exchange_quantity: get_dec(row, "exchange_quantity")?,
                    detected_at: get_ts(row, "detected_at")?,
                    note: row.get("note")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_heartbeat_counts_cycles_per_run() {
        let store = Store::in_memory().unwrap();
        let started = Utc::now();
        store.beat("signals:mr", 42, "host", started, started, None).unwrap();
        store
            .beat("signals:mr", 42, "host", started, started + Duration::seconds(10), Some("boom"))
            .unwrap();

        let beats = store.heartbeats().unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].cycles, 2);
        assert_eq!(beats[0].last_error.as_deref(), Some("boom"));

        // A restart resets the cycle counter
        let restarted = started + Duration::minutes(5);
        store.beat("signals:mr", 43, "host", restarted, restarted, None).unwrap();
        let beats = store.heartbeats().unwrap();
        assert_eq!(beats[0].cycles, 1);
        assert_eq!(beats[0].pid, 43);
        assert!(beats[0].is_stale(restarted + Duration::minutes(3), Duration::minutes(2)));
    }

    #[test]
    fn test_shadow_fill_and_discrepancy_records() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        store
            .record_shadow_fill(&ShadowFill {
                strategy: "mr".to_string(),
                market_id: "m1".to_string(),
                outcome: 1,
                side: Side::Buy,
                ts: now,
                size: dec!(1333.33),
                signal_price: dec!(0.075),
                sim_entry_price: dec!(0.07575),
                avg_price: Some(dec!(0.10)),
                dislocation: Some(dec!(-0.25)),
                intent_id: None,
                notes: None,
            })
            .unwrap();
        assert_eq!(store.shadow_fills("mr", 10).unwrap()[0].sim_entry_price, dec!(0.07575));

        let mismatch = Discrepancy {
            strategy: "mr".to_string(),
            market_id: "m1".to_string(),
            outcome: 1,
            ledger_quantity: dec!(1000),
            exchange_quantity: dec!(0),
            detected_at: now,
            note: None,
        };
        assert!(store.record_discrepancy(&mismatch).unwrap().is_some());
        // Same quantities again: nothing new to record
        let repeat = Discrepancy {
            detected_at: now + Duration::seconds(30),
            ..mismatch.clone()
        };
        assert!(store.record_discrepancy(&repeat).unwrap().is_none());
        assert_eq!(store.discrepancies("mr", now - Duration::hours(1)).unwrap().len(), 1);
    }
}
