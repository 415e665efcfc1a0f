//! In-memory scripted exchange for tests and dry runs.
//!
//! Unlike [`PaperExchange`](super::PaperExchange) nothing is persisted; the
//! test drives fills, cancels and failures explicitly.

use super::traits::ExchangeClient;
use super::types::*;
use crate::model::Side;
use crate::runtime::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One order resting on the mock venue.
#[derive(Debug, Clone)]
pub struct MockOrder {
    pub exchange_order_id: String,
    pub request: OrderRequest,
    pub status: ExchangeOrderStatus,
    pub filled: Decimal,
}

/// Scripted outcome for the next submission.
#[derive(Debug, Clone)]
pub enum SubmitScript {
    /// Fail with this error without touching the book.
    Fail(ExchangeError),
    /// Accept the order but report a timeout to the caller.
    AcceptThenTimeout,
}

#[derive(Debug, Default)]
pub struct MockExchangeState {
    pub orders: HashMap<String, MockOrder>,
    pub fills: HashMap<String, Vec<ExchangeFill>>,
    pub positions: HashMap<(String, u32), Decimal>,
    pub marks: HashMap<String, Decimal>,
    pub submit_script: VecDeque<SubmitScript>,
    pub submit_calls: u64,
    pub cancel_calls: u64,
}

/// Mock venue with manual or automatic fills.
pub struct MockExchange {
    state: Arc<RwLock<MockExchangeState>>,
    order_id_counter: AtomicU64,
    fill_id_counter: AtomicU64,
    clock: Arc<dyn Clock>,
    /// Fill marketable submissions in full at the limit price
    auto_fill: bool,
}

impl MockExchange {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(MockExchangeState::default())),
            order_id_counter: AtomicU64::new(1),
            fill_id_counter: AtomicU64::new(1),
            clock,
            auto_fill: false,
        }
    }

    pub fn with_auto_fill(mut self) -> Self {
        self.auto_fill = true;
        self
    }

    pub async fn set_mark(&self, token_id: &str, price: Decimal) {
        self.state.write().await.marks.insert(token_id.to_string(), price);
    }

    pub async fn script_submit(&self, script: SubmitScript) {
        self.state.write().await.submit_script.push_back(script);
    }

    pub async fn submit_calls(&self) -> u64 {
        self.state.read().await.submit_calls
    }

    pub async fn cancel_calls(&self) -> u64 {
        self.state.read().await.cancel_calls
    }

    pub async fn order(&self, exchange_order_id: &str) -> Option<MockOrder> {
        self.state.read().await.orders.get(exchange_order_id).cloned()
    }

    pub async fn order_by_client_id(&self, client_order_id: &str) -> Option<MockOrder> {
        self.state
            .read()
            .await
            .orders
            .values()
            .find(|o| o.request.client_order_id == client_order_id)
            .cloned()
    }

    /// Override the authoritative position, e.g. to simulate a manual trade.
    pub async fn set_position(&self, market_id: &str, outcome: u32, quantity: Decimal) {
        self.state
            .write()
            .await
            .positions
            .insert((market_id.to_string(), outcome), quantity);
    }

    /// Execute `size` (unsigned) of an order at `price`.
    pub async fn fill(
        &self,
        exchange_order_id: &str,
        size: Decimal,
        price: Decimal,
    ) -> Result<ExchangeFill, ExchangeError> {
        let ts = self.clock.now();
        let fill_id = format!("fill-{}", self.fill_id_counter.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.write().await;
        Self::apply_fill(&mut state, exchange_order_id, fill_id, size, price, ts)
    }

    /// Cancel from the venue side (expiry, market halt).
    pub async fn expire(&self, exchange_order_id: &str) {
        if let Some(order) = self.state.write().await.orders.get_mut(exchange_order_id) {
            if order.status == ExchangeOrderStatus::Open {
                order.status = ExchangeOrderStatus::Cancelled;
            }
        }
    }

    fn apply_fill(
        state: &mut MockExchangeState,
        exchange_order_id: &str,
        fill_id: String,
        size: Decimal,
        price: Decimal,
        ts: DateTime<Utc>,
    ) -> Result<ExchangeFill, ExchangeError> {
        let order = state
            .orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| ExchangeError::NotFound(exchange_order_id.to_string()))?;
        if order.status != ExchangeOrderStatus::Open {
            return Err(ExchangeError::Rejected(format!("order is {}", order.status)));
        }

        let size = size.min(order.request.size - order.filled);
        order.filled += size;
        if order.filled >= order.request.size {
            order.status = ExchangeOrderStatus::Filled;
        }

        let fill = ExchangeFill {
            fill_id,
            exchange_order_id: exchange_order_id.to_string(),
            side: order.request.side,
            size,
            price,
            ts,
        };
        let key = (order.request.market_id.clone(), order.request.outcome);
        *state.positions.entry(key).or_default() += fill.signed_quantity();
        state
            .fills
            .entry(exchange_order_id.to_string())
            .or_default()
            .push(fill.clone());

        debug!(
            order = %exchange_order_id,
            size = %size,
            price = %price,
            "Mock fill"
        );
        Ok(fill)
    }

    fn to_state(order: &MockOrder) -> OrderState {
        OrderState {
            exchange_order_id: order.exchange_order_id.clone(),
            client_order_id: Some(order.request.client_order_id.clone()),
            status: order.status,
            filled_size: order.filled,
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        state.submit_calls += 1;

        let script = state.submit_script.pop_front();
        if let Some(SubmitScript::Fail(err)) = script {
            return Err(err);
        }

        if let Some(existing) = state
            .orders
            .values()
            .find(|o| o.request.client_order_id == request.client_order_id)
        {
            return Ok(OrderAck {
                exchange_order_id: existing.exchange_order_id.clone(),
                status: existing.status,
            });
        }

        let exchange_order_id = format!(
            "mock-{}",
            self.order_id_counter.fetch_add(1, Ordering::SeqCst)
        );
        state.orders.insert(
            exchange_order_id.clone(),
            MockOrder {
                exchange_order_id: exchange_order_id.clone(),
                request: request.clone(),
                status: ExchangeOrderStatus::Open,
                filled: Decimal::ZERO,
            },
        );
        info!(
            order = %exchange_order_id,
            client_order_id = %request.client_order_id,
            side = %request.side,
            size = %request.size,
            limit = %request.limit_price,
            "Mock order accepted"
        );

        if self.auto_fill {
            let marketable = match (state.marks.get(&request.token_id), request.side) {
                (Some(mark), Side::Buy) => *mark <= request.limit_price,
                (Some(mark), Side::Sell) => *mark >= request.limit_price,
                (None, _) => true,
            };
            if marketable {
                let fill_id = format!("fill-{}", self.fill_id_counter.fetch_add(1, Ordering::SeqCst));
                Self::apply_fill(
                    &mut state,
                    &exchange_order_id,
                    fill_id,
                    request.size,
                    request.limit_price,
                    now,
                )?;
            }
        }

        if matches!(script, Some(SubmitScript::AcceptThenTimeout)) {
            return Err(ExchangeError::Timeout);
        }

        let status = state
            .orders
            .get(&exchange_order_id)
            .map(|o| o.status)
            .unwrap_or(ExchangeOrderStatus::Open);
        Ok(OrderAck {
            exchange_order_id,
            status,
        })
    }

    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderState>, ExchangeError> {
        Ok(self
            .order_by_client_id(client_order_id)
            .await
            .map(|o| Self::to_state(&o)))
    }

    async fn order_state(&self, exchange_order_id: &str) -> Result<OrderState, ExchangeError> {
        self.order(exchange_order_id)
            .await
            .map(|o| Self::to_state(&o))
            .ok_or_else(|| ExchangeError::NotFound(exchange_order_id.to_string()))
    }

    async fn fills(
        &self,
        exchange_order_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExchangeFill>, ExchangeError> {
        let state = self.state.read().await;
        if !state.orders.contains_key(exchange_order_id) {
            return Err(ExchangeError::NotFound(exchange_order_id.to_string()));
        }
        Ok(state
            .fills
            .get(exchange_order_id)
            .map(|fills| {
                fills
                    .iter()
                    .filter(|f| since.map_or(true, |s| f.ts >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        state.cancel_calls += 1;
        let order = state
            .orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| ExchangeError::NotFound(exchange_order_id.to_string()))?;
        match order.status {
            ExchangeOrderStatus::Open => {
                order.status = ExchangeOrderStatus::Cancelled;
                Ok(())
            }
            ExchangeOrderStatus::Cancelled => Ok(()),
            ExchangeOrderStatus::Filled => {
                Err(ExchangeError::Rejected("order already filled".to_string()))
            }
        }
    }

    async fn positions(&self, _account: &str) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        let state = self.state.read().await;
        let mut snapshot: Vec<_> = state
            .positions
            .iter()
            .filter(|(_, qty)| !qty.is_zero())
            .map(|((market_id, outcome), quantity)| PositionSnapshot {
                market_id: market_id.clone(),
                outcome: *outcome,
                quantity: *quantity,
            })
            .collect();
        snapshot.sort_by(|a, b| (&a.market_id, a.outcome).cmp(&(&b.market_id, b.outcome)));
        Ok(snapshot)
    }

    async fn mark_price(&self, token_id: &str) -> Result<Option<Decimal>, ExchangeError> {
        Ok(self.state.read().await.marks.get(token_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SystemClock;
    use rust_decimal_macros::dec;

    fn request(client_id: &str, side: Side, size: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: client_id.to_string(),
            market_id: "m1".to_string(),
            outcome: 1,
            token_id: "yes".to_string(),
            side,
            size,
            limit_price: dec!(0.10),
        }
    }

    #[tokio::test]
    async fn test_partial_then_full_fill() {
        let exchange = MockExchange::new(Arc::new(SystemClock));
        let ack = exchange
            .submit_order(&request("c1", Side::Buy, dec!(100)))
            .await
            .unwrap();
        assert_eq!(ack.status, ExchangeOrderStatus::Open);

        exchange.fill(&ack.exchange_order_id, dec!(40), dec!(0.10)).await.unwrap();
        let state = exchange.order_state(&ack.exchange_order_id).await.unwrap();
        assert_eq!(state.status, ExchangeOrderStatus::Open);
        assert_eq!(state.filled_size, dec!(40));

        // Overfill is clipped to the remaining size
        let fill = exchange.fill(&ack.exchange_order_id, dec!(100), dec!(0.10)).await.unwrap();
        assert_eq!(fill.size, dec!(60));
        let state = exchange.order_state(&ack.exchange_order_id).await.unwrap();
        assert_eq!(state.status, ExchangeOrderStatus::Filled);

        let positions = exchange.positions("any").await.unwrap();
        assert_eq!(positions[0].quantity, dec!(100));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let exchange = MockExchange::new(Arc::new(SystemClock));
        exchange
            .script_submit(SubmitScript::Fail(ExchangeError::Transient("503".into())))
            .await;
        exchange.script_submit(SubmitScript::AcceptThenTimeout).await;

        let req = request("c1", Side::Buy, dec!(10));
        assert!(matches!(
            exchange.submit_order(&req).await,
            Err(ExchangeError::Transient(_))
        ));
        assert_eq!(exchange.submit_order(&req).await, Err(ExchangeError::Timeout));

        // The timed-out submission did reach the book
        let found = exchange.find_order("c1").await.unwrap();
        assert!(found.is_some());
        assert_eq!(exchange.submit_calls().await, 2);
    }

    #[tokio::test]
    async fn test_auto_fill_respects_mark() {
        let exchange = MockExchange::new(Arc::new(SystemClock)).with_auto_fill();
        exchange.set_mark("yes", dec!(0.12)).await;

        let buy = exchange
            .submit_order(&request("c1", Side::Buy, dec!(10)))
            .await
            .unwrap();
        assert_eq!(buy.status, ExchangeOrderStatus::Open);

        let sell = exchange
            .submit_order(&request("c2", Side::Sell, dec!(10)))
            .await
            .unwrap();
        assert_eq!(sell.status, ExchangeOrderStatus::Filled);
        assert_eq!(exchange.fills(&sell.exchange_order_id, None).await.unwrap().len(), 1);
    }
}
