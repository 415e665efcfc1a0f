//! Order submitter: places `submitted` orders on the exchange.
//!
//! The order id is the idempotency key. A submission whose outcome is
//! unknown (the call timed out) is resolved by a client-id lookup on the
//! next poll, never by blind resubmission.

use crate::config::ExecutionConfig;
use crate::exchange::{with_timeout, ExchangeClient, ExchangeError, OrderRequest};
use crate::model::{IntentKind, OrderStatus, StrategyOrder};
use crate::persistence::{reopen_position, transition_order, OrderAttempt, Store};
use crate::risk::{AlertSeverity, RiskAlert, RiskAlertType};
use crate::runtime::{CycleReport, Worker};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Delay before attempt `attempts + 1`: `min(base * 2^(attempts - 1), max)`.
pub fn backoff_delay(attempts: u32, base_secs: u64, max_secs: u64) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let secs = base_secs
        .checked_mul(1u64 << exponent)
        .unwrap_or(max_secs)
        .min(max_secs);
    Duration::seconds(secs as i64)
}

/// Result of handling one order.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Live { exchange_order_id: String },
    Rejected { error: String },
    Retry { attempts: u32, next_attempt_at: DateTime<Utc> },
    Unknown { attempts: u32 },
    Exhausted { attempts: u32 },
    /// Order changed underneath us; nothing done
    Skipped,
}

pub struct OrderSubmitter {
    store: Store,
    exchange: Arc<dyn ExchangeClient>,
    strategy: String,
    paper: bool,
    execution: ExecutionConfig,
}

impl OrderSubmitter {
    pub fn new(
        store: Store,
        exchange: Arc<dyn ExchangeClient>,
        strategy: impl Into<String>,
        paper: bool,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            store,
            exchange,
            strategy: strategy.into(),
            paper,
            execution,
        }
    }

    fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution.call_timeout_secs)
    }

    pub async fn submit_one(&mut self, order_id: i64, now: DateTime<Utc>) -> Result<SubmitOutcome> {
        // Re-read: another submitter may have placed it since the poll
        let Some(order) = self.store.get_order(order_id)? else {
            return Ok(SubmitOutcome::Skipped);
        };
        if order.status != OrderStatus::Submitted {
            debug!(order_id, status = %order.status, "Order no longer submitted, skipping");
            return Ok(SubmitOutcome::Skipped);
        }

        if order.unknown_outcome {
            let lookup = with_timeout(
                self.call_timeout(),
                self.exchange.find_order(&order.client_order_id),
            )
            .await;
            match lookup {
                Ok(Some(state)) => {
                    info!(
                        order_id,
                        exchange_order_id = %state.exchange_order_id,
                        "🔎 [SUBMIT] Resolved unknown submission, order exists"
                    );
                    return self.mark_live(&order, &state.exchange_order_id, now);
                }
                Ok(None) => {
                    debug!(order_id, "Unknown submission never reached the exchange, resubmitting");
                }
                Err(e) => return self.defer(&order, e, true, now),
            }
        }

        let request = OrderRequest {
            client_order_id: order.client_order_id.clone(),
            market_id: order.market_id.clone(),
            outcome: order.outcome,
            token_id: order.token_id.clone(),
            side: order.side(),
            size: order.quantity.abs(),
            limit_price: order.limit_price,
        };

        let result = with_timeout(self.call_timeout(), self.exchange.submit_order(&request)).await;
        match result {
            Ok(ack) => self.mark_live(&order, &ack.exchange_order_id, now),
            Err(ExchangeError::Rejected(reason)) => self.fail(&order, &reason, now),
            Err(ExchangeError::Timeout) => self.defer(&order, ExchangeError::Timeout, true, now),
            Err(e) => self.defer(&order, e, false, now),
        }
    }

    fn mark_live(
        &self,
        order: &StrategyOrder,
        exchange_order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        if !self.store.mark_order_live(order.id, exchange_order_id, now)? {
            warn!(order_id = order.id, "Order left submitted before it could go live");
            return Ok(SubmitOutcome::Skipped);
        }
        info!(
            order_id = order.id,
            %exchange_order_id,
            market = %order.market_id,
            side = %order.side(),
            quantity = %order.quantity,
            limit = %order.limit_price,
            venue = self.exchange.name(),
            "✅ [SUBMIT] Order live"
        );
        Ok(SubmitOutcome::Live {
            exchange_order_id: exchange_order_id.to_string(),
        })
    }

    /// Terminal `error`. A dead exit order hands its position back to the
    /// exit monitor.
    fn fail(&mut self, order: &StrategyOrder, reason: &str, now: DateTime<Utc>) -> Result<SubmitOutcome> {
        let tx = self.store.write_tx()?;
        let moved = transition_order(
            &tx,
            order.id,
            OrderStatus::Submitted,
            OrderStatus::Error,
            Some(reason),
            now,
        )?;
        if moved && order.kind == IntentKind::Exit {
            reopen_position(&tx, &order.strategy, &order.market_id, order.outcome, now)?;
        }
        tx.commit()?;

        if !moved {
            return Ok(SubmitOutcome::Skipped);
        }
        warn!(
            order_id = order.id,
            market = %order.market_id,
            %reason,
            "❌ [SUBMIT] Order rejected"
        );
        Ok(SubmitOutcome::Rejected {
            error: reason.to_string(),
        })
    }

    /// Stay `submitted` and retry after backoff. Known failures give up after
    /// `max_submit_attempts`; an unknown outcome keeps being looked up.
    fn defer(
        &mut self,
        order: &StrategyOrder,
        error: ExchangeError,
        unknown: bool,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let attempts = order.attempts.saturating_add(1);

        if !unknown && attempts >= self.execution.max_submit_attempts {
            let outcome = self.fail(order, "retries_exhausted", now)?;
            if outcome == SubmitOutcome::Skipped {
                return Ok(outcome);
            }
            RiskAlert::new(
                &self.strategy,
                RiskAlertType::SubmitExhausted {
                    order_id: order.id,
                    attempts,
                },
                AlertSeverity::Error,
                format!("order {} not placed after {} attempts: {}", order.id, attempts, error),
                now,
            )
            .emit();
            return Ok(SubmitOutcome::Exhausted { attempts });
        }

        let next_attempt_at = now
            + backoff_delay(
                attempts,
                self.execution.backoff_base_secs,
                self.execution.backoff_max_secs,
            );
        self.store.record_submit_attempt(
            order.id,
            &OrderAttempt {
                attempts,
                next_attempt_at: Some(next_attempt_at),
                unknown_outcome: unknown,
                last_error: Some(error.to_string()),
            },
            now,
        )?;

        warn!(
            order_id = order.id,
            attempts,
            %next_attempt_at,
            unknown_outcome = unknown,
            error = %error,
            "🔁 [SUBMIT] Submission deferred"
        );
        if unknown {
            Ok(SubmitOutcome::Unknown { attempts })
        } else {
            Ok(SubmitOutcome::Retry {
                attempts,
                next_attempt_at,
            })
        }
    }
}

#[async_trait(?Send)]
impl Worker for OrderSubmitter {
    fn name(&self) -> String {
        format!("submitter:{}", self.strategy)
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let due = self.store.submittable_orders(
            &self.strategy,
            self.paper,
            now,
            self.execution.batch_size,
        )?;

        let mut report = CycleReport::default();
        for order in due {
            match self.submit_one(order.id, now).await? {
                SubmitOutcome::Live { .. } => report.processed += 1,
                SubmitOutcome::Rejected { .. } | SubmitOutcome::Exhausted { .. } => {
                    report.failed += 1
                }
                SubmitOutcome::Retry { .. }
                | SubmitOutcome::Unknown { .. }
                | SubmitOutcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }
}
