//! Position reconciler: compares the ledger against the exchange snapshot.
//!
//! Mismatches are persisted and alerted for human review. The ledger is
//! never corrected from here; the fill reconciler is its only writer.

use super::alert::{AlertSeverity, RiskAlert, RiskAlertType};
use crate::exchange::{with_timeout, ExchangeClient};
use crate::model::OutcomeKey;
use crate::persistence::{Discrepancy, Store};
use crate::runtime::{CycleReport, Worker};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PositionReconciler {
    store: Store,
    exchange: Arc<dyn ExchangeClient>,
    strategy: String,
    account: String,
    tolerance: Decimal,
    call_timeout: std::time::Duration,
    heartbeat_stale: Duration,
}

impl PositionReconciler {
    pub fn new(
        store: Store,
        exchange: Arc<dyn ExchangeClient>,
        strategy: impl Into<String>,
        account: impl Into<String>,
        tolerance: Decimal,
        call_timeout: std::time::Duration,
        heartbeat_stale: Duration,
    ) -> Self {
        Self {
            store,
            exchange,
            strategy: strategy.into(),
            account: account.into(),
            tolerance,
            call_timeout,
            heartbeat_stale,
        }
    }

    /// Alert on workers whose heartbeat went quiet.
    fn check_heartbeats(&self, now: DateTime<Utc>) -> Result<usize> {
        let me = self.name();
        let mut stale = 0;
        for beat in self.store.heartbeats()? {
            if beat.worker == me || !beat.is_stale(now, self.heartbeat_stale) {
                continue;
            }
            stale += 1;
            let age = (now - beat.last_seen).num_seconds();
            RiskAlert::new(
                &self.strategy,
                RiskAlertType::StaleWorker {
                    worker: beat.worker.clone(),
                    age_secs: age,
                },
                AlertSeverity::Warning,
                format!("worker {} silent for {}s", beat.worker, age),
                now,
            )
            .emit();
        }
        Ok(stale)
    }
}

#[async_trait(?Send)]
impl Worker for PositionReconciler {
    fn name(&self) -> String {
        format!("reconciler:{}", self.strategy)
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let snapshot = with_timeout(self.call_timeout, self.exchange.positions(&self.account))
            .await
            .with_context(|| format!("position snapshot from {}", self.exchange.name()))?;

        let mut ledger: BTreeMap<OutcomeKey, Decimal> = BTreeMap::new();
        for position in self.store.positions(&self.strategy)? {
            *ledger
                .entry(OutcomeKey::new(position.market_id, position.outcome))
                .or_default() += position.quantity;
        }

        let mut exchange: BTreeMap<OutcomeKey, Decimal> = BTreeMap::new();
        for held in snapshot {
            *exchange
                .entry(OutcomeKey::new(held.market_id, held.outcome))
                .or_default() += held.quantity;
        }

        // Fills for these may not be booked yet
        let in_flight: HashSet<OutcomeKey> = self
            .store
            .outcomes_with_working_orders(&self.strategy)?
            .into_iter()
            .map(|(market_id, outcome)| OutcomeKey::new(market_id, outcome))
            .collect();

        let keys: Vec<OutcomeKey> = ledger.keys().chain(exchange.keys()).cloned().collect();
        let mut seen = HashSet::new();

        for key in keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            if in_flight.contains(&key) {
                debug!(outcome = %key, "Skipping outcome with working orders");
                report.skipped += 1;
                continue;
            }

            let held = ledger.get(&key).copied().unwrap_or_default();
            let reported = exchange.get(&key).copied().unwrap_or_default();
            let diff = held - reported;
            if diff.abs() <= self.tolerance {
                report.processed += 1;
                continue;
            }

            warn!(
                strategy = %self.strategy,
                outcome = %key,
                ledger = %held,
                exchange = %reported,
                "⚠️ [RECONCILE] Ledger diverges from exchange"
            );
            let recorded = self.store.record_discrepancy(&Discrepancy {
                strategy: self.strategy.clone(),
                market_id: key.market_id.clone(),
                outcome: key.outcome,
                ledger_quantity: held,
                exchange_quantity: reported,
                detected_at: now,
                note: None,
            })?;
            if recorded.is_none() {
                debug!(outcome = %key, "Mismatch unchanged since last record");
            }
            RiskAlert::new(
                &self.strategy,
                RiskAlertType::PositionMismatch {
                    market_id: key.market_id.clone(),
                    outcome: key.outcome,
                    ledger: held,
                    exchange: reported,
                },
                AlertSeverity::Error,
                "ledger and exchange disagree, manual review required",
                now,
            )
            .with_metric("difference", diff)
            .emit();
            report.failed += 1;
        }

        let stale = self.check_heartbeats(now)?;
        if report.failed > 0 || stale > 0 {
            info!(
                strategy = %self.strategy,
                mismatches = report.failed,
                stale_workers = stale,
                "🔍 [RECONCILE] Pass finished with findings"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeError, MockExchange, MockExchangeClient, PositionSnapshot};
    use crate::model::Position;
    use crate::persistence::insert_position;
    use crate::runtime::{Clock, ManualClock};
    use rust_decimal_macros::dec;

    fn seed_position(store: &Store, market: &str, quantity: Decimal) {
        let now = Utc::now();
        let mut position = Position::flat("mr", market, 1, true, now);
        position.apply_fill(quantity, dec!(0.10), now);
        insert_position(store.conn(), &position).unwrap();
    }

    fn reconciler(store: Store, exchange: Arc<dyn ExchangeClient>) -> PositionReconciler {
        PositionReconciler::new(
            store,
            exchange,
            "mr",
            "paper",
            dec!(0.5),
            std::time::Duration::from_secs(1),
            Duration::seconds(120),
        )
    }

    #[tokio::test]
    async fn test_mismatch_is_recorded_not_corrected() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("recon.db");
        let store = Store::open(&db).unwrap();
        seed_position(&store, "m1", dec!(1000));
        seed_position(&store, "m2", dec!(500));

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let exchange = Arc::new(MockExchange::new(clock.clone()));
        exchange.set_position("m1", 1, dec!(1000.2)).await;
        exchange.set_position("m2", 1, dec!(0)).await;

        let mut worker = reconciler(store, exchange);
        let now = clock.now();
        let report = worker.run_cycle(now).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);

        let store = Store::open(&db).unwrap();
        let found = store.discrepancies("mr", now - Duration::minutes(1)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].market_id, "m2");
        assert_eq!(found[0].ledger_quantity, dec!(500));
        assert_eq!(found[0].exchange_quantity, dec!(0));
        // Ledger untouched
        assert_eq!(
            store.get_position("mr", "m2", 1).unwrap().unwrap().quantity,
            dec!(500)
        );
    }

    #[tokio::test]
    async fn test_persisting_mismatch_is_recorded_once() {
        let store = Store::in_memory().unwrap();
        seed_position(&store, "m1", dec!(1000));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let exchange = Arc::new(MockExchange::new(clock.clone()));
        exchange.set_position("m1", 1, dec!(600)).await;

        let mut worker = reconciler(store, exchange.clone());
        let started = clock.now();
        for _ in 0..3 {
            let report = worker.run_cycle(clock.now()).await.unwrap();
            assert_eq!(report.failed, 1);
            clock.advance(Duration::seconds(30));
        }
        assert_eq!(
            worker.store.discrepancies("mr", started - Duration::minutes(1)).unwrap().len(),
            1
        );

        // A different venue quantity is a new finding
        exchange.set_position("m1", 1, dec!(400)).await;
        worker.run_cycle(clock.now()).await.unwrap();
        let found = worker.store.discrepancies("mr", started - Duration::minutes(1)).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].exchange_quantity, dec!(400));
    }

    #[tokio::test]
    async fn test_exchange_only_holding_is_flagged() {
        let store = Store::in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let exchange = Arc::new(MockExchange::new(clock.clone()));
        exchange.set_position("m9", 0, dec!(42)).await;

        let mut worker = reconciler(store, exchange);
        let report = worker.run_cycle(clock.now()).await.unwrap();
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_snapshot_failure_fails_the_cycle() {
        let mut mock = MockExchangeClient::new();
        mock.expect_name().return_const("mock");
        mock.expect_positions()
            .returning(|_| Err(ExchangeError::Transient("503".to_string())));

        let mut worker = reconciler(Store::in_memory().unwrap(), Arc::new(mock));
        assert!(worker.run_cycle(Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_matching_snapshot_is_clean() {
        let store = Store::in_memory().unwrap();
        seed_position(&store, "m1", dec!(250));

        let mut mock = MockExchangeClient::new();
        mock.expect_name().return_const("mock");
        mock.expect_positions().returning(|_| {
            Ok(vec![PositionSnapshot {
                market_id: "m1".to_string(),
                outcome: 1,
                quantity: dec!(250),
            }])
        });

        let mut worker = reconciler(store, Arc::new(mock));
        let report = worker.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);
    }
}
