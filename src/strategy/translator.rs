//! Intent-to-order translator.
//!
//! Each intent is claimed, checked and turned into at most one order inside
//! a single `BEGIN IMMEDIATE` transaction, so two translators racing on the
//! same queue can never both act on one intent.

use crate::config::Config;
use crate::model::{IntentAction, IntentKind, IntentStatus, NewOrder, Side, TradeIntent};
use crate::persistence::{
    claim_next_intent, finish_intent, has_open_exit_order, insert_order, latest_price,
    load_market, load_position, reopen_position, Store,
};
use crate::risk::RiskGovernor;
use crate::runtime::{CycleReport, Worker};
use crate::utils::round_down_to_lot;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tracing::{info, warn};

/// What happened to one claimed intent.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Ordered { intent_id: i64, order_id: i64 },
    Rejected { intent_id: i64, reason: String },
    Expired { intent_id: i64 },
}

enum Decision {
    Order(NewOrder),
    /// Reject; `reopen` returns a closing position to `open`
    Reject { reason: String, reopen: bool },
}

impl Decision {
    fn reject(reason: &str) -> Self {
        Decision::Reject {
            reason: reason.to_string(),
            reopen: true,
        }
    }
}

/// Limit price with slippage towards the far side of the book.
fn limit_price(price: Decimal, side: Side, slippage: Decimal) -> Decimal {
    let limit = match side {
        Side::Buy => price * (Decimal::ONE + slippage),
        Side::Sell => price * (Decimal::ONE - slippage),
    };
    limit.round_dp(6)
}

fn order_metadata(intent: &TradeIntent) -> serde_json::Value {
    json!({
        "intent_id": intent.id,
        "kind": intent.kind().as_str(),
        "signal_price": intent.signal_price.to_string(),
        "avg_price": intent.avg_price.map(|p| p.to_string()),
        "dislocation": intent.dislocation.map(|d| d.to_string()),
        "reason": intent.reason,
    })
}

fn decide_entry(
    conn: &Connection,
    config: &Config,
    governor: &RiskGovernor,
    intent: &TradeIntent,
    size_usd: Decimal,
    now: DateTime<Utc>,
) -> Result<Decision> {
    let price = intent.signal_price;
    if price <= Decimal::ZERO {
        return Ok(Decision::reject("bad_price"));
    }

    let Some(market) = load_market(conn, &intent.market_id)? else {
        return Ok(Decision::reject("market_unavailable"));
    };
    let Some(token_id) = market.token_for(intent.outcome).filter(|_| market.active) else {
        return Ok(Decision::reject("market_unavailable"));
    };

    match latest_price(conn, &intent.market_id, intent.outcome)? {
        Some((observed_at, _)) if now - observed_at <= config.max_price_age() => {}
        _ => return Ok(Decision::reject("stale_price")),
    }

    if let Some(block) = governor.entry_block(conn, &intent.market_id, now)? {
        return Ok(Decision::reject(block.as_str()));
    }

    let sizing = &config.sizing;
    let mut usd = size_usd.min(sizing.max_position_usd);
    if let Some(cap) = sizing.max_order_usd {
        usd = usd.min(cap);
    }
    let size = round_down_to_lot(usd / price, dec!(0.01));
    if size <= Decimal::ZERO {
        return Ok(Decision::reject("bad_size"));
    }

    let limit = limit_price(price, intent.side, config.execution.slippage);
    if limit >= Decimal::ONE {
        return Ok(Decision::reject("bad_price"));
    }

    let quantity = match intent.side {
        Side::Buy => size,
        Side::Sell => -size,
    };

    Ok(Decision::Order(NewOrder {
        strategy: intent.strategy.clone(),
        market_id: intent.market_id.clone(),
        outcome: intent.outcome,
        token_id: token_id.to_string(),
        kind: IntentKind::Entry,
        quantity,
        limit_price: limit,
        paper: config.is_paper(),
        intent_id: intent.id,
        metadata: {
            let mut meta = order_metadata(intent);
            meta["size_usd"] = json!(usd.to_string());
            meta
        },
        created_at: now,
    }))
}

/// Closing intents skip the entry risk checks; halting new risk must never
/// block an unwind.
fn decide_exit(
    conn: &Connection,
    config: &Config,
    intent: &TradeIntent,
    quantity: Decimal,
    now: DateTime<Utc>,
) -> Result<Decision> {
    let Some(position) = load_position(conn, &intent.strategy, &intent.market_id, intent.outcome)?
    else {
        return Ok(Decision::Reject {
            reason: "no_position".to_string(),
            reopen: false,
        });
    };

    // The working exit order still owns the closing position
    if has_open_exit_order(conn, &intent.strategy, &intent.market_id, intent.outcome)? {
        return Ok(Decision::Reject {
            reason: "duplicate_closing".to_string(),
            reopen: false,
        });
    }

    if quantity.is_zero() || quantity.is_sign_negative() == position.quantity.is_sign_negative() {
        return Ok(Decision::reject("wrong_side"));
    }
    // Never unwind more than is held
    let quantity = if quantity.abs() > position.quantity.abs() {
        -position.quantity
    } else {
        quantity
    };

    let price = intent.signal_price;
    if price <= Decimal::ZERO {
        return Ok(Decision::reject("bad_price"));
    }

    let Some(market) = load_market(conn, &intent.market_id)? else {
        return Ok(Decision::reject("market_unavailable"));
    };
    let Some(token_id) = market.token_for(intent.outcome) else {
        return Ok(Decision::reject("market_unavailable"));
    };

    let side = Side::from_signed(quantity);
    Ok(Decision::Order(NewOrder {
        strategy: intent.strategy.clone(),
        market_id: intent.market_id.clone(),
        outcome: intent.outcome,
        token_id: token_id.to_string(),
        kind: IntentKind::Exit,
        quantity,
        limit_price: limit_price(price, side, config.execution.slippage),
        paper: config.is_paper(),
        intent_id: intent.id,
        metadata: {
            let mut meta = order_metadata(intent);
            if let IntentAction::Close { exit_reason, .. } = &intent.action {
                meta["exit_reason"] = json!(exit_reason.as_str());
            }
            meta
        },
        created_at: now,
    }))
}

pub struct IntentTranslator {
    store: Store,
    config: Config,
    governor: RiskGovernor,
    worker_id: String,
}

impl IntentTranslator {
    pub fn new(store: Store, config: Config) -> Self {
        let governor = RiskGovernor::new(config.strategy.id.clone(), config.risk.clone());
        let worker_id = format!("translator:{}:{}", config.strategy.id, std::process::id());
        Self {
            store,
            config,
            governor,
            worker_id,
        }
    }

    /// Claim and settle the oldest pending intent. `None` when the queue is
    /// empty.
    pub fn translate_next(&mut self, now: DateTime<Utc>) -> Result<Option<Translation>> {
        let tx = self.store.write_tx()?;

        let Some(intent) = claim_next_intent(&tx, &self.config.strategy.id, &self.worker_id, now)?
        else {
            return Ok(None);
        };

        let is_exit = intent.kind() == IntentKind::Exit;

        if intent.is_expired(now) {
            finish_intent(&tx, intent.id, IntentStatus::Expired, None, Some("expired"))?;
            if is_exit {
                reopen_position(&tx, &intent.strategy, &intent.market_id, intent.outcome, now)?;
            }
            tx.commit()?;
            info!(
                intent_id = intent.id,
                market = %intent.market_id,
                kind = %intent.kind(),
                "⌛ [TRANSLATE] Intent expired"
            );
            return Ok(Some(Translation::Expired {
                intent_id: intent.id,
            }));
        }

        let decision = match &intent.action {
            IntentAction::Open { size_usd } => {
                decide_entry(&tx, &self.config, &self.governor, &intent, *size_usd, now)?
            }
            IntentAction::Close { quantity, .. } => {
                decide_exit(&tx, &self.config, &intent, *quantity, now)?
            }
        };

        let translation = match decision {
            Decision::Order(order) => match insert_order(&tx, &order)? {
                Some(order_id) => {
                    finish_intent(&tx, intent.id, IntentStatus::Ordered, Some(order_id), None)?;
                    info!(
                        intent_id = intent.id,
                        order_id,
                        market = %order.market_id,
                        outcome = order.outcome,
                        kind = %order.kind,
                        quantity = %order.quantity,
                        limit = %order.limit_price,
                        paper = order.paper,
                        "📝 [TRANSLATE] Order created"
                    );
                    Translation::Ordered {
                        intent_id: intent.id,
                        order_id,
                    }
                }
                None => {
                    // Another translator already created the order for this intent
                    warn!(intent_id = intent.id, "Order already exists for intent");
                    finish_intent(&tx, intent.id, IntentStatus::Rejected, None, Some("duplicate_order"))?;
                    Translation::Rejected {
                        intent_id: intent.id,
                        reason: "duplicate_order".to_string(),
                    }
                }
            },
            Decision::Reject { reason, reopen } => {
                finish_intent(&tx, intent.id, IntentStatus::Rejected, None, Some(&reason))?;
                if is_exit && reopen {
                    reopen_position(&tx, &intent.strategy, &intent.market_id, intent.outcome, now)?;
                }
                info!(
                    intent_id = intent.id,
                    market = %intent.market_id,
                    kind = %intent.kind(),
                    %reason,
                    "🚫 [TRANSLATE] Intent rejected"
                );
                Translation::Rejected {
                    intent_id: intent.id,
                    reason,
                }
            }
        };

        tx.commit()?;
        Ok(Some(translation))
    }
}

#[async_trait(?Send)]
impl Worker for IntentTranslator {
    fn name(&self) -> String {
        format!("translator:{}", self.config.strategy.id)
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        for _ in 0..self.config.execution.batch_size {
            match self.translate_next(now)? {
                Some(Translation::Ordered { .. }) => report.processed += 1,
                Some(_) => report.skipped += 1,
                None => break,
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ExitReason, Market, NewIntent, OrderStatus, Position, PriceObservation,
    };
    use crate::persistence::{begin_closing, insert_position, MarketRiskState};
    use chrono::Duration;

    fn config() -> Config {
        let mut config = Config::default();
        config.strategy.id = "mr".to_string();
        config
    }

    fn setup(now: DateTime<Utc>) -> Store {
        let store = Store::in_memory().unwrap();
        store
            .upsert_market(&Market {
                market_id: "m1".to_string(),
                question: "Will it rain in Lisbon on Friday?".to_string(),
                tags: vec![],
                outcome_tokens: vec!["tok-no".to_string(), "tok-yes".to_string()],
                resolves_at: None,
                active: true,
            })
            .unwrap();
        store
            .record_price(&PriceObservation {
                market_id: "m1".to_string(),
                outcome: 1,
                ts: now - Duration::minutes(1),
                price: dec!(0.075),
                volume_usd: dec!(500),
            })
            .unwrap();
        store
    }

    fn entry_intent(now: DateTime<Utc>) -> NewIntent {
        NewIntent {
            strategy: "mr".to_string(),
            market_id: "m1".to_string(),
            outcome: 1,
            side: Side::Buy,
            action: IntentAction::Open {
                size_usd: dec!(100),
            },
            signal_price: dec!(0.075),
            avg_price: Some(dec!(0.10)),
            dislocation: Some(dec!(-0.25)),
            reason: "dislocation -0.25".to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(2),
        }
    }

    fn close_intent(now: DateTime<Utc>, quantity: Decimal) -> NewIntent {
        NewIntent {
            side: Side::Sell,
            action: IntentAction::Close {
                quantity,
                exit_reason: ExitReason::TakeProfit,
            },
            signal_price: dec!(0.115),
            avg_price: None,
            dislocation: None,
            reason: "take_profit".to_string(),
            ..entry_intent(now)
        }
    }

    fn closing_position(store: &Store, now: DateTime<Utc>) -> Position {
        let mut position = Position::flat("mr", "m1", 1, true, now);
        position.apply_fill(dec!(1000), dec!(0.10), now);
        position.id = insert_position(store.conn(), &position).unwrap();
        position.version = 1;
        assert!(begin_closing(store.conn(), position.id, 1, ExitReason::TakeProfit, now).unwrap());
        position
    }

    #[test]
    fn test_entry_sizing_and_limit() {
        let now = Utc::now();
        let store = setup(now);
        let intent_id = store.insert_intent(&entry_intent(now), IntentStatus::Pending).unwrap();

        let mut translator = IntentTranslator::new(store, config());
        let result = translator.translate_next(now).unwrap().unwrap();
        let Translation::Ordered { order_id, .. } = result else {
            panic!("expected order, got {:?}", result);
        };

        let order = translator.store.get_order(order_id).unwrap().unwrap();
        // 100 / 0.075 = 1333.33..
        assert_eq!(order.quantity, dec!(1333.33));
        assert_eq!(order.limit_price, dec!(0.07575));
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.token_id, "tok-yes");
        assert_eq!(order.client_order_id, format!("mr-{}", intent_id));
        assert_eq!(order.metadata["dislocation"], "-0.25");

        let intent = translator.store.get_intent(intent_id).unwrap().unwrap();
        assert_eq!(intent.status, IntentStatus::Ordered);
        assert_eq!(intent.order_id, Some(order_id));
        assert!(translator.translate_next(now).unwrap().is_none());
    }

    #[test]
    fn test_expired_intent_never_ordered() {
        let now = Utc::now();
        let store = setup(now);
        let intent_id = store.insert_intent(&entry_intent(now), IntentStatus::Pending).unwrap();

        let mut translator = IntentTranslator::new(store, config());
        let later = now + Duration::minutes(5);
        assert_eq!(
            translator.translate_next(later).unwrap(),
            Some(Translation::Expired { intent_id })
        );
        assert_eq!(
            translator.store.get_intent(intent_id).unwrap().unwrap().status,
            IntentStatus::Expired
        );
    }

    #[test]
    fn test_stale_price_rejected() {
        let now = Utc::now();
        let store = setup(now - Duration::hours(2));
        let intent_id = store.insert_intent(&entry_intent(now), IntentStatus::Pending).unwrap();

        let mut translator = IntentTranslator::new(store, config());
        assert_eq!(
            translator.translate_next(now).unwrap(),
            Some(Translation::Rejected {
                intent_id,
                reason: "stale_price".to_string()
            })
        );
    }

    #[test]
    fn test_banned_market_rejected() {
        let now = Utc::now();
        let store = setup(now);
        let mut ban = MarketRiskState::new("mr", "m1");
        ban.banned_until = Some(now + Duration::hours(24));
        store.save_market_risk(&ban, now).unwrap();
        let intent_id = store.insert_intent(&entry_intent(now), IntentStatus::Pending).unwrap();

        let mut translator = IntentTranslator::new(store, config());
        let result = translator.translate_next(now).unwrap();
        assert_eq!(
            result,
            Some(Translation::Rejected {
                intent_id,
                reason: "loss_streak_ban".to_string()
            })
        );
        let intent = translator.store.get_intent(intent_id).unwrap().unwrap();
        assert_eq!(intent.note.as_deref(), Some("loss_streak_ban"));
        assert_eq!(intent.order_id, None);
    }

    #[test]
    fn test_close_bypasses_risk_and_dedups() {
        let now = Utc::now();
        let store = setup(now);
        // A market ban does not stop an unwind
        let mut ban = MarketRiskState::new("mr", "m1");
        ban.banned_until = Some(now + Duration::hours(24));
        store.save_market_risk(&ban, now).unwrap();
        closing_position(&store, now);

        store.insert_intent(&close_intent(now, dec!(-1000)), IntentStatus::Pending).unwrap();
        let dup = store
            .insert_intent(&close_intent(now + Duration::seconds(1), dec!(-1000)), IntentStatus::Pending)
            .unwrap();

        let mut translator = IntentTranslator::new(store, config());
        let first = translator.translate_next(now).unwrap().unwrap();
        let Translation::Ordered { order_id, .. } = first else {
            panic!("expected order, got {:?}", first);
        };
        let order = translator.store.get_order(order_id).unwrap().unwrap();
        assert_eq!(order.quantity, dec!(-1000));
        assert_eq!(order.kind, IntentKind::Exit);
        // 0.115 * 0.99
        assert_eq!(order.limit_price, dec!(0.11385));

        assert_eq!(
            translator.translate_next(now).unwrap(),
            Some(Translation::Rejected {
                intent_id: dup,
                reason: "duplicate_closing".to_string()
            })
        );
        // Still closing: the first exit order owns it
        let position = translator.store.get_position("mr", "m1", 1).unwrap().unwrap();
        assert_eq!(position.status, crate::model::PositionStatus::Closing);
    }

    #[test]
    fn test_expired_close_reopens_position() {
        let now = Utc::now();
        let store = setup(now);
        closing_position(&store, now);
        store.insert_intent(&close_intent(now, dec!(-1000)), IntentStatus::Pending).unwrap();

        let mut translator = IntentTranslator::new(store, config());
        let result = translator.translate_next(now + Duration::minutes(10)).unwrap();
        assert!(matches!(result, Some(Translation::Expired { .. })));

        let position = translator.store.get_position("mr", "m1", 1).unwrap().unwrap();
        assert_eq!(position.status, crate::model::PositionStatus::Open);
        assert_eq!(position.exit_reason, None);
    }

    #[test]
    fn test_two_translators_one_order() {
        let now = Utc::now();
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("race.db");
        {
            let store = Store::open(&db).unwrap();
            store
                .upsert_market(&Market {
                    market_id: "m1".to_string(),
                    question: "Will it rain in Lisbon on Friday?".to_string(),
                    tags: vec![],
                    outcome_tokens: vec!["tok-no".to_string(), "tok-yes".to_string()],
                    resolves_at: None,
                    active: true,
                })
                .unwrap();
            store
                .record_price(&PriceObservation {
                    market_id: "m1".to_string(),
                    outcome: 1,
                    ts: now,
                    price: dec!(0.075),
                    volume_usd: dec!(500),
                })
                .unwrap();
            store.insert_intent(&entry_intent(now), IntentStatus::Pending).unwrap();
        }

        let mut a = IntentTranslator::new(Store::open(&db).unwrap(), config());
        let mut b = IntentTranslator::new(Store::open(&db).unwrap(), config());
        let first = a.translate_next(now).unwrap();
        let second = b.translate_next(now).unwrap();
        assert!(matches!(first, Some(Translation::Ordered { .. })));
        assert_eq!(second, None);

        let counts = Store::open(&db).unwrap().order_status_counts("mr").unwrap();
        assert_eq!(counts, vec![(OrderStatus::Submitted, 1)]);
    }
}
