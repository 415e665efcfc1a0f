//! Exit monitor: moves open positions to `closing` and emits the closing
//! intent that unwinds them.

use crate::config::{Config, ExitConfig};
use crate::exchange::{with_timeout, ExchangeClient};
use crate::model::{ExitReason, IntentAction, IntentStatus, NewIntent, Position, PositionStatus, Side};
use crate::persistence::{begin_closing, insert_intent, Store};
use crate::risk::RiskGovernor;
use crate::runtime::{CycleReport, Worker};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// First matching exit rule for a position at `mark`.
///
/// Priority: hard loss cap on the slippage-adjusted exit price, then
/// stop-loss, take-profit and max hold.
pub fn evaluate_exit(
    position: &Position,
    mark: Decimal,
    exits: &ExitConfig,
    slippage: Decimal,
    now: DateTime<Utc>,
) -> Option<ExitReason> {
    if position.is_flat() || position.avg_price.is_zero() {
        return None;
    }

    let exit_price = if position.is_long() {
        mark * (Decimal::ONE - slippage)
    } else {
        mark * (Decimal::ONE + slippage)
    };
    if position.pnl_pct(exit_price) <= -exits.hard_stop_loss_pct {
        return Some(ExitReason::RiskCap);
    }

    let pct = position.pnl_pct(mark);
    if pct <= -exits.stop_loss_pct {
        return Some(ExitReason::StopLoss);
    }
    if pct >= exits.take_profit_pct {
        return Some(ExitReason::TakeProfit);
    }
    if now - position.opened_at >= Duration::hours(exits.max_hold_hours as i64) {
        return Some(ExitReason::MaxHold);
    }
    None
}

pub struct ExitMonitor {
    store: Store,
    exchange: Arc<dyn ExchangeClient>,
    config: Config,
    governor: RiskGovernor,
}

impl ExitMonitor {
    pub fn new(store: Store, exchange: Arc<dyn ExchangeClient>, config: Config) -> Self {
        let governor = RiskGovernor::new(config.strategy.id.clone(), config.risk.clone());
        Self {
            store,
            exchange,
            config,
            governor,
        }
    }

    fn strategy(&self) -> &str {
        &self.config.strategy.id
    }

    /// Exchange mark, falling back to a fresh stored observation.
    async fn mark_price(&self, position: &Position, now: DateTime<Utc>) -> Result<Option<Decimal>> {
        let token = self
            .store
            .get_market(&position.market_id)?
            .and_then(|m| m.token_for(position.outcome).map(str::to_string));

        if let Some(token) = token {
            let timeout = std::time::Duration::from_secs(self.config.execution.call_timeout_secs);
            match with_timeout(timeout, self.exchange.mark_price(&token)).await {
                Ok(Some(mark)) if mark > Decimal::ZERO => return Ok(Some(mark)),
                Ok(_) => {}
                Err(e) => {
                    debug!(market = %position.market_id, error = %e, "Mark query failed, using stored price")
                }
            }
        }

        let max_age = Duration::seconds(self.config.exits.max_mark_age_secs as i64);
        Ok(self
            .store
            .latest_price(&position.market_id, position.outcome)?
            .filter(|(ts, price)| now - *ts <= max_age && *price > Decimal::ZERO)
            .map(|(_, price)| price))
    }

    /// `open → closing(reason)` plus the closing intent, atomically.
    /// Returns the intent id, or `None` if the position moved underneath us.
    pub fn close(
        &mut self,
        position: &Position,
        reason: ExitReason,
        mark: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let intent = NewIntent {
            strategy: position.strategy.clone(),
            market_id: position.market_id.clone(),
            outcome: position.outcome,
            side: Side::from_signed(position.quantity).opposite(),
            action: IntentAction::Close {
                quantity: -position.quantity,
                exit_reason: reason,
            },
            signal_price: mark,
            avg_price: Some(position.avg_price),
            dislocation: position.entry_dislocation,
            reason: format!("{} pnl {}", reason, position.pnl_pct(mark).round_dp(4)),
            created_at: now,
            expires_at: now + self.config.intent_ttl(),
        };

        let tx = self.store.write_tx()?;
        if !begin_closing(&tx, position.id, position.version, reason, now)? {
            return Ok(None);
        }
        let intent_id = insert_intent(&tx, &intent, IntentStatus::Pending)?;
        tx.commit()?;
        Ok(Some(intent_id))
    }
}

#[async_trait(?Send)]
impl Worker for ExitMonitor {
    fn name(&self) -> String {
        format!("exits:{}", self.strategy())
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let positions = self.store.positions(self.strategy())?;
        let mut report = CycleReport::default();

        for mut position in positions {
            if position.status != PositionStatus::Open || position.is_flat() {
                continue;
            }

            let Some(mark) = self.mark_price(&position, now).await? else {
                debug!(market = %position.market_id, outcome = position.outcome, "No usable mark");
                report.skipped += 1;
                continue;
            };

            if position.observe_mark(mark) && self.store.update_excursions(&position, now)? {
                position.version += 1;
            }

            let mut reason = evaluate_exit(
                &position,
                mark,
                &self.config.exits,
                self.config.execution.slippage,
                now,
            );
            if reason.is_none()
                && self.governor.drawdown_breached(
                    self.store.conn(),
                    &position.market_id,
                    position.unrealized_pnl(mark),
                )?
            {
                reason = Some(ExitReason::RiskCap);
            }
            let Some(reason) = reason else {
                continue;
            };

            match self.close(&position, reason, mark, now)? {
                Some(intent_id) => {
                    info!(
                        intent_id,
                        market = %position.market_id,
                        outcome = position.outcome,
                        %reason,
                        avg = %position.avg_price,
                        %mark,
                        quantity = %position.quantity,
                        pnl_pct = %position.pnl_pct(mark).round_dp(4),
                        "🚪 [EXIT] Closing position"
                    );
                    report.processed += 1;
                }
                None => {
                    warn!(market = %position.market_id, "Position changed before closing, retrying next cycle");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use crate::model::{IntentKind, PriceObservation};
    use crate::persistence::claim_next_intent;
    use crate::runtime::ManualClock;
    use crate::test_support::{market, seed_position};
    use rust_decimal_macros::dec;

    fn exits() -> ExitConfig {
        ExitConfig {
            take_profit_pct: dec!(0.15),
            stop_loss_pct: dec!(0.15),
            hard_stop_loss_pct: dec!(0.20),
            max_hold_hours: 12,
            max_mark_age_secs: 300,
        }
    }

    fn long(now: DateTime<Utc>) -> Position {
        let mut position = Position::flat("mr", "m1", 1, true, now);
        position.apply_fill(dec!(1000), dec!(0.10), now);
        position
    }

    #[test]
    fn test_exit_rules_in_priority_order() {
        let now = Utc::now();
        let position = long(now);
        let slip = dec!(0.01);

        assert_eq!(evaluate_exit(&position, dec!(0.115), &exits(), slip, now), Some(ExitReason::TakeProfit));
        assert_eq!(evaluate_exit(&position, dec!(0.085), &exits(), slip, now), Some(ExitReason::StopLoss));
        // Raw move is -19.2% but the slipped exit price breaches the 20% cap
        assert_eq!(evaluate_exit(&position, dec!(0.0808), &exits(), slip, now), Some(ExitReason::RiskCap));
        assert_eq!(evaluate_exit(&position, dec!(0.105), &exits(), slip, now), None);

        let later = now + Duration::hours(12);
        assert_eq!(evaluate_exit(&position, dec!(0.105), &exits(), slip, later), Some(ExitReason::MaxHold));
        // A price rule still wins over max hold
        assert_eq!(evaluate_exit(&position, dec!(0.12), &exits(), slip, later), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_short_position_inverts_pnl() {
        let now = Utc::now();
        let mut position = Position::flat("mr", "m1", 1, true, now);
        position.apply_fill(dec!(-1000), dec!(0.10), now);

        assert_eq!(evaluate_exit(&position, dec!(0.085), &exits(), dec!(0), now), Some(ExitReason::TakeProfit));
        assert_eq!(evaluate_exit(&position, dec!(0.115), &exits(), dec!(0), now), Some(ExitReason::StopLoss));
    }

    fn monitor(store: Store, exchange: Arc<MockExchange>) -> ExitMonitor {
        let mut config = Config::default();
        config.strategy.id = "mr".to_string();
        config.exits = exits();
        ExitMonitor::new(store, exchange, config)
    }

    #[tokio::test]
    async fn test_take_profit_emits_one_full_size_close() {
        let now = Utc::now();
        let store = Store::in_memory().unwrap();
        store.upsert_market(&market("m1")).unwrap();
        seed_position(&store, "m1", dec!(1000), dec!(0.10), now);

        let exchange = Arc::new(MockExchange::new(Arc::new(ManualClock::new(now))));
        exchange.set_mark("m1-yes", dec!(0.115)).await;

        let mut worker = monitor(store, exchange);
        let report = worker.run_cycle(now).await.unwrap();
        assert_eq!(report.processed, 1);

        let position = worker.store.get_position("mr", "m1", 1).unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
        assert_eq!(position.exit_reason, Some(ExitReason::TakeProfit));
        assert_eq!(position.max_favourable, dec!(0.15));

        let intent = claim_next_intent(worker.store.conn(), "mr", "test", now)
            .unwrap()
            .unwrap();
        assert_eq!(intent.kind(), IntentKind::Exit);
        assert_eq!(intent.side, Side::Sell);
        assert_eq!(
            intent.action,
            IntentAction::Close {
                quantity: dec!(-1000),
                exit_reason: ExitReason::TakeProfit
            }
        );

        // Closing positions are left alone
        assert!(worker.run_cycle(now).await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_stale_stored_price_is_not_a_mark() {
        let now = Utc::now();
        let store = Store::in_memory().unwrap();
        store.upsert_market(&market("m1")).unwrap();
        seed_position(&store, "m1", dec!(1000), dec!(0.10), now);
        store
            .record_price(&PriceObservation {
                market_id: "m1".to_string(),
                outcome: 1,
                price: dec!(0.05),
                volume_usd: dec!(10),
                ts: now - Duration::minutes(30),
            })
            .unwrap();

        let exchange = Arc::new(MockExchange::new(Arc::new(ManualClock::new(now))));
        let mut worker = monitor(store, exchange);
        let report = worker.run_cycle(now).await.unwrap();
        assert_eq!(report.skipped, 1);
        let position = worker.store.get_position("mr", "m1", 1).unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_fresh_stored_price_drives_stop_loss() {
        let now = Utc::now();
        let store = Store::in_memory().unwrap();
        store.upsert_market(&market("m1")).unwrap();
        seed_position(&store, "m1", dec!(1000), dec!(0.10), now);
        store
            .record_price(&PriceObservation {
                market_id: "m1".to_string(),
                outcome: 1,
                price: dec!(0.085),
                volume_usd: dec!(10),
                ts: now - Duration::seconds(30),
            })
            .unwrap();

        let exchange = Arc::new(MockExchange::new(Arc::new(ManualClock::new(now))));
        let mut worker = monitor(store, exchange);
        assert_eq!(worker.run_cycle(now).await.unwrap().processed, 1);

        let position = worker.store.get_position("mr", "m1", 1).unwrap().unwrap();
        assert_eq!(position.exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(position.max_adverse, dec!(-0.15));
    }

    #[tokio::test]
    async fn test_stale_version_does_not_close() {
        let now = Utc::now();
        let store = Store::in_memory().unwrap();
        let mut position = seed_position(&store, "m1", dec!(1000), dec!(0.10), now);
        let exchange = Arc::new(MockExchange::new(Arc::new(ManualClock::new(now))));
        let mut worker = monitor(store, exchange);

        position.version = 7;
        let result = worker.close(&position, ExitReason::MaxHold, dec!(0.10), now).unwrap();
        assert!(result.is_none());
        assert_eq!(worker.store.intent_counts("mr").unwrap().pending, 0);
    }
}
