//! Store-backed simulated venue for paper trading.
//!
//! Orders and fills live in the `paper_orders`/`paper_fills` tables so the
//! submitter, fill reconciler and position reconciler (separate processes)
//! all see the same simulated book. Matching is deliberately simple:
//! - An order is marketable when the latest stored price is at or better
//!   than its limit (buy: price <= limit, sell: price >= limit)
//! - Marketable orders fill in full at the limit price
//! - Resting orders are re-checked lazily whenever they are queried

use super::traits::ExchangeClient;
use super::types::*;
use crate::model::Side;
use crate::persistence::{PaperFillRow, PaperOrderRow, Store};
use crate::runtime::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Simulated exchange over the shared store.
pub struct PaperExchange {
    store: Mutex<Store>,
    clock: Arc<dyn Clock>,
    account: String,
}

fn store_err(e: anyhow::Error) -> ExchangeError {
    ExchangeError::Transient(format!("paper store: {:#}", e))
}

fn to_state(order: &PaperOrderRow, filled: Decimal) -> OrderState {
    let status = match order.status.as_str() {
        "filled" => ExchangeOrderStatus::Filled,
        "cancelled" => ExchangeOrderStatus::Cancelled,
        _ => ExchangeOrderStatus::Open,
    };
    OrderState {
        exchange_order_id: order.exchange_order_id.clone(),
        client_order_id: Some(order.client_order_id.clone()),
        status,
        filled_size: filled,
    }
}

impl PaperExchange {
    pub fn new(store: Store, clock: Arc<dyn Clock>, account: impl Into<String>) -> Self {
        Self {
            store: Mutex::new(store),
            clock,
            account: account.into(),
        }
    }

    /// Fill `order` if the latest stored price crosses its limit.
    fn try_match(&self, store: &mut Store, order: &PaperOrderRow) -> anyhow::Result<bool> {
        if order.status != "open" {
            return Ok(false);
        }
        let Some((_, price)) = store.latest_price(&order.market_id, order.outcome)? else {
            return Ok(false);
        };
        let marketable = if order.quantity.is_sign_positive() {
            price <= order.limit_price
        } else {
            price >= order.limit_price
        };
        if !marketable {
            return Ok(false);
        }

        let fill = PaperFillRow {
            fill_id: format!("{}-f1", order.exchange_order_id),
            exchange_order_id: order.exchange_order_id.clone(),
            account: order.account.clone(),
            market_id: order.market_id.clone(),
            outcome: order.outcome,
            quantity: order.quantity,
            price: order.limit_price,
            ts: self.clock.now(),
        };
        let filled = store.fill_paper_order(&fill)?;
        if filled {
            info!(
                order = %order.exchange_order_id,
                market = %order.market_id,
                quantity = %order.quantity,
                price = %order.limit_price,
                "📝 [PAPER] Order filled"
            );
        }
        Ok(filled)
    }

    fn filled_size(store: &Store, exchange_order_id: &str) -> anyhow::Result<Decimal> {
        Ok(store
            .paper_fills(exchange_order_id, None)?
            .iter()
            .map(|f| f.quantity.abs())
            .sum())
    }

    /// Load an order by exchange id after giving it a chance to match.
    fn refreshed(&self, store: &mut Store, exchange_order_id: &str) -> Result<PaperOrderRow, ExchangeError> {
        let order = store
            .paper_order(exchange_order_id)
            .map_err(store_err)?
            .ok_or_else(|| ExchangeError::NotFound(exchange_order_id.to_string()))?;
        if self.try_match(store, &order).map_err(store_err)? {
            return store
                .paper_order(exchange_order_id)
                .map_err(store_err)?
                .ok_or_else(|| ExchangeError::NotFound(exchange_order_id.to_string()));
        }
        Ok(order)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut store = self.store.lock().await;

        if let Some(existing) = store
            .paper_order_by_client_id(&request.client_order_id)
            .map_err(store_err)?
        {
            debug!(client_order_id = %request.client_order_id, "Paper order already exists");
            let filled = Self::filled_size(&store, &existing.exchange_order_id).map_err(store_err)?;
            let state = to_state(&existing, filled);
            return Ok(OrderAck {
                exchange_order_id: existing.exchange_order_id,
                status: state.status,
            });
        }

        let market = store.get_market(&request.market_id).map_err(store_err)?;
        match market {
            Some(m) if m.active => {}
            _ => return Err(ExchangeError::Rejected("market closed".to_string())),
        }
        if request.size <= Decimal::ZERO {
            return Err(ExchangeError::Rejected("invalid size".to_string()));
        }
        if request.limit_price <= Decimal::ZERO || request.limit_price >= Decimal::ONE {
            return Err(ExchangeError::Rejected("invalid price".to_string()));
        }
        if store
            .latest_price(&request.market_id, request.outcome)
            .map_err(store_err)?
            .is_none()
        {
            return Err(ExchangeError::Rejected("no book".to_string()));
        }

        let quantity = match request.side {
            Side::Buy => request.size,
            Side::Sell => -request.size,
        };
        let order = PaperOrderRow {
            exchange_order_id: format!("paper-{}", request.client_order_id),
            client_order_id: request.client_order_id.clone(),
            account: self.account.clone(),
            market_id: request.market_id.clone(),
            outcome: request.outcome,
            token_id: request.token_id.clone(),
            quantity,
            limit_price: request.limit_price,
            status: "open".to_string(),
            created_at: self.clock.now(),
        };
        store.insert_paper_order(&order).map_err(store_err)?;
        let filled = self.try_match(&mut store, &order).map_err(store_err)?;

        Ok(OrderAck {
            exchange_order_id: order.exchange_order_id,
            status: if filled {
                ExchangeOrderStatus::Filled
            } else {
                ExchangeOrderStatus::Open
            },
        })
    }

    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderState>, ExchangeError> {
        let mut store = self.store.lock().await;
        let Some(order) = store
            .paper_order_by_client_id(client_order_id)
            .map_err(store_err)?
        else {
            return Ok(None);
        };
        let order = self.refreshed(&mut store, &order.exchange_order_id)?;
        let filled = Self::filled_size(&store, &order.exchange_order_id).map_err(store_err)?;
        Ok(Some(to_state(&order, filled)))
    }

    async fn order_state(&self, exchange_order_id: &str) -> Result<OrderState, ExchangeError> {
        let mut store = self.store.lock().await;
        let order = self.refreshed(&mut store, exchange_order_id)?;
        let filled = Self::filled_size(&store, exchange_order_id).map_err(store_err)?;
        Ok(to_state(&order, filled))
    }

    async fn fills(
        &self,
        exchange_order_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExchangeFill>, ExchangeError> {
        let mut store = self.store.lock().await;
        self.refreshed(&mut store, exchange_order_id)?;
        let fills = store
            .paper_fills(exchange_order_id, since)
            .map_err(store_err)?
            .into_iter()
            .map(|f| ExchangeFill {
                side: Side::from_signed(f.quantity),
                size: f.quantity.abs(),
                fill_id: f.fill_id,
                exchange_order_id: f.exchange_order_id,
                price: f.price,
                ts: f.ts,
            })
            .collect();
        Ok(fills)
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), ExchangeError> {
        let mut store = self.store.lock().await;
        let order = self.refreshed(&mut store, exchange_order_id)?;
        match order.status.as_str() {
            "open" => {
                store.cancel_paper_order(exchange_order_id).map_err(store_err)?;
                info!(order = %exchange_order_id, "📝 [PAPER] Order cancelled");
                Ok(())
            }
            "cancelled" => Ok(()),
            _ => Err(ExchangeError::Rejected("order already filled".to_string())),
        }
    }

    async fn positions(&self, account: &str) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        let store = self.store.lock().await;
        let rows = store.paper_positions(account).map_err(store_err)?;
        Ok(rows
            .into_iter()
            .map(|(market_id, outcome, quantity)| PositionSnapshot {
                market_id,
                outcome,
                quantity,
            })
            .collect())
    }

    async fn mark_price(&self, token_id: &str) -> Result<Option<Decimal>, ExchangeError> {
        let store = self.store.lock().await;
        let Some((market_id, outcome)) = store.market_for_token(token_id).map_err(store_err)? else {
            return Ok(None);
        };
        let latest = store.latest_price(&market_id, outcome).map_err(store_err)?;
        Ok(latest.map(|(_, price)| price))
    }
}
