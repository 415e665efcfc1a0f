//! Fill reconciler: the only writer of the position ledger.
//!
//! Every exchange fill is applied in one immediate transaction that records
//! the fill, advances the order, merges the position (version-guarded) and,
//! when the position returns to flat, writes the closed record and books the
//! close with the risk governor.

use crate::config::{Config, ExecutionConfig};
use crate::exchange::{with_timeout, ExchangeClient, ExchangeError, ExchangeFill, ExchangeOrderStatus};
use crate::model::{IntentKind, OrderStatus, Position, PositionStatus, StrategyOrder};
use crate::persistence::{
    delete_position, insert_closed, insert_fill, insert_position, load_order, load_position,
    record_fill_progress, reopen_position, transition_order, update_position, Store,
};
use crate::risk::{RiskAlert, RiskGovernor};
use crate::runtime::{CycleReport, Worker};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one fill did to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedFill {
    pub order_status: OrderStatus,
    pub position_quantity: Decimal,
    pub realized_pnl: Decimal,
    pub closed: bool,
}

pub struct FillReconciler {
    store: Store,
    exchange: Arc<dyn ExchangeClient>,
    strategy: String,
    paper: bool,
    execution: ExecutionConfig,
    governor: RiskGovernor,
}

impl FillReconciler {
    pub fn new(store: Store, exchange: Arc<dyn ExchangeClient>, config: &Config) -> Self {
        Self {
            store,
            exchange,
            strategy: config.strategy.id.clone(),
            paper: config.is_paper(),
            execution: config.execution.clone(),
            governor: RiskGovernor::new(config.strategy.id.clone(), config.risk.clone()),
        }
    }

    fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution.call_timeout_secs)
    }

    /// Apply one exchange fill. Returns `None` for a fill already recorded.
    pub fn apply_fill(
        &mut self,
        order_id: i64,
        fill: &ExchangeFill,
        now: DateTime<Utc>,
    ) -> Result<Option<AppliedFill>> {
        let epsilon = self.execution.fill_epsilon;
        let tx = self.store.write_tx()?;

        let order = load_order(&tx, order_id)?
            .with_context(|| format!("order {} vanished", order_id))?;
        let signed = fill.signed_quantity();
        if !insert_fill(&tx, order.id, &fill.fill_id, signed, fill.price, fill.ts, order.paper)? {
            debug!(order_id, fill_id = %fill.fill_id, "Fill already recorded");
            return Ok(None);
        }

        // Order progress
        let filled = order.filled_quantity + signed;
        let to = if order.status.is_terminal() {
            order.status
        } else if filled.abs() >= order.quantity.abs() - epsilon {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        if !record_fill_progress(&tx, order.id, order.status, to, filled, fill.ts, now)? {
            bail!("order {} changed while applying fill {}", order.id, fill.fill_id);
        }

        // Position merge
        let mut position = match load_position(&tx, &order.strategy, &order.market_id, order.outcome)? {
            Some(position) => position,
            None => {
                let mut position =
                    Position::flat(&order.strategy, &order.market_id, order.outcome, order.paper, fill.ts);
                position.entry_dislocation = entry_dislocation(&order);
                position
            }
        };
        let effect = position.apply_fill(signed, fill.price, fill.ts);
        position.updated_at = now;
        // A finished exit that left shares behind hands them back to the exit monitor
        let reopened = order.kind == IntentKind::Exit
            && to.is_terminal()
            && !position.is_flat()
            && position.status == PositionStatus::Closing;
        if reopened {
            position.status = PositionStatus::Open;
            position.exit_reason = None;
        }

        if position.is_flat() {
            if position.id != 0 && !delete_position(&tx, position.id, position.version)? {
                bail!("position {} changed while applying fill {}", position.id, fill.fill_id);
            }
        } else if position.id == 0 {
            position.id = insert_position(&tx, &position)?;
        } else if !update_position(&tx, &position)? {
            bail!("position {} changed while applying fill {}", position.id, fill.fill_id);
        }

        let mut alerts: Vec<RiskAlert> = Vec::new();
        if let Some(closed) = &effect.closed {
            insert_closed(&tx, closed)?;
            alerts = self.governor.record_close(&tx, closed, now)?;
        }
        tx.commit()?;

        info!(
            order_id,
            fill_id = %fill.fill_id,
            market = %order.market_id,
            outcome = order.outcome,
            quantity = %signed,
            price = %fill.price,
            order_status = %to,
            position = %position.quantity,
            realized = %effect.realized_pnl,
            "💰 [FILL] Fill applied"
        );
        if reopened {
            info!(
                market = %order.market_id,
                outcome = order.outcome,
                remaining = %position.quantity,
                "🔄 [FILL] Exit finished short of flat, position reopened"
            );
        }
        if let Some(closed) = &effect.closed {
            info!(
                market = %closed.market_id,
                outcome = closed.outcome,
                entry = %closed.entry_price,
                exit = %closed.exit_price,
                size = %closed.size,
                pnl = %closed.realized_pnl,
                reason = %closed.exit_reason,
                "🏁 [FILL] Position closed"
            );
        }
        for alert in &alerts {
            alert.emit();
        }

        Ok(Some(AppliedFill {
            order_status: to,
            position_quantity: position.quantity,
            realized_pnl: effect.realized_pnl,
            closed: effect.closed.is_some(),
        }))
    }

    /// Move a working order to `cancelled`; a closing order hands its
    /// position back to the exit monitor.
    pub fn cancel_locally(
        &mut self,
        order: &StrategyOrder,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = self.store.write_tx()?;
        let Some(current) = load_order(&tx, order.id)? else {
            return Ok(false);
        };
        if !current.status.is_working() {
            return Ok(false);
        }
        let moved = transition_order(&tx, order.id, current.status, OrderStatus::Cancelled, Some(reason), now)?;
        let reopened = moved
            && current.kind == IntentKind::Exit
            && reopen_position(&tx, &current.strategy, &current.market_id, current.outcome, now)?;
        tx.commit()?;

        if moved {
            info!(
                order_id = order.id,
                market = %order.market_id,
                filled = %current.filled_quantity,
                %reason,
                reopened,
                "🚫 [FILL] Order cancelled"
            );
        }
        Ok(moved)
    }

    /// Pull fills and status for one working order.
    async fn reconcile_order(
        &mut self,
        order: &StrategyOrder,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            warn!(order_id = order.id, "Working order has no exchange id");
            report.skipped += 1;
            return Ok(());
        };

        let fills = match with_timeout(
            self.call_timeout(),
            self.exchange.fills(&exchange_order_id, order.last_fill_at),
        )
        .await
        {
            Ok(fills) => fills,
            Err(e) => {
                warn!(order_id = order.id, error = %e, "Fill query failed, retrying next poll");
                report.skipped += 1;
                return Ok(());
            }
        };
        for fill in &fills {
            if self.apply_fill(order.id, fill, now)?.is_some() {
                report.processed += 1;
            }
        }

        let state = match with_timeout(self.call_timeout(), self.exchange.order_state(&exchange_order_id)).await {
            Ok(state) => state,
            Err(e) => {
                warn!(order_id = order.id, error = %e, "Order state query failed, retrying next poll");
                report.skipped += 1;
                return Ok(());
            }
        };

        let Some(current) = self.store.get_order(order.id)? else {
            return Ok(());
        };
        if !current.status.is_working() {
            return Ok(());
        }
        // Fills we have not seen yet; settle them before any status change
        if state.filled_size.abs() > current.filled_quantity.abs() + self.execution.fill_epsilon {
            debug!(
                order_id = order.id,
                exchange_filled = %state.filled_size,
                ledger_filled = %current.filled_quantity,
                "Exchange ahead of ledger, waiting for fills"
            );
            return Ok(());
        }

        match state.status {
            ExchangeOrderStatus::Cancelled => {
                if self.cancel_locally(&current, "cancelled_by_exchange", now)? {
                    report.processed += 1;
                }
            }
            ExchangeOrderStatus::Open => {
                let ttl = Duration::seconds(self.execution.order_ttl_secs as i64);
                if now - current.created_at < ttl {
                    return Ok(());
                }
                match with_timeout(self.call_timeout(), self.exchange.cancel_order(&exchange_order_id)).await {
                    Ok(()) => {
                        if self.cancel_locally(&current, "order_ttl", now)? {
                            report.processed += 1;
                        }
                    }
                    Err(ExchangeError::Rejected(reason)) => {
                        debug!(order_id = order.id, %reason, "Expired order could not be cancelled");
                    }
                    Err(e) => {
                        warn!(order_id = order.id, error = %e, "Cancel failed, retrying next poll");
                        report.skipped += 1;
                    }
                }
            }
            ExchangeOrderStatus::Filled => {}
        }
        Ok(())
    }
}

fn entry_dislocation(order: &StrategyOrder) -> Option<Decimal> {
    if order.kind != IntentKind::Entry {
        return None;
    }
    order.metadata.get("dislocation")?.as_str()?.parse().ok()
}

#[async_trait(?Send)]
impl Worker for FillReconciler {
    fn name(&self) -> String {
        format!("fills:{}", self.strategy)
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let orders = self
            .store
            .working_orders(&self.strategy, self.paper, self.execution.batch_size)?;

        let mut report = CycleReport::default();
        for order in &orders {
            self.reconcile_order(order, now, &mut report).await?;
        }
        Ok(report)
    }
}
