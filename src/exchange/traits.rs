//! Venue-agnostic exchange interface.
//!
//! Workers only talk to the exchange through [`ExchangeClient`], so the
//! REST client, the store-backed paper venue and test doubles are
//! interchangeable.

use super::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::time::Duration;

/// Order submission, order/fill queries and read-only account data.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Venue name for logs.
    fn name(&self) -> &'static str;

    /// Submit a limit order. Must be idempotent on `client_order_id`.
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    /// Look an order up by client id; used to resolve submissions whose
    /// outcome is unknown after a timeout.
    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderState>, ExchangeError>;

    async fn order_state(&self, exchange_order_id: &str) -> Result<OrderState, ExchangeError>;

    /// Fills for an order at or after `since`.
    async fn fills(
        &self,
        exchange_order_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExchangeFill>, ExchangeError>;

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), ExchangeError>;

    /// Authoritative position snapshot for an account.
    async fn positions(&self, account: &str) -> Result<Vec<PositionSnapshot>, ExchangeError>;

    /// Current mark (best exit) price for an outcome token, if quoted.
    async fn mark_price(&self, token_id: &str) -> Result<Option<Decimal>, ExchangeError>;
}

/// Bound an exchange call; an elapsed deadline becomes [`ExchangeError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ExchangeError>(1)
        };
        let result = with_timeout(Duration::from_millis(10), slow).await;
        assert_eq!(result, Err(ExchangeError::Timeout));

        let fast = async { Ok::<_, ExchangeError>(2) };
        assert_eq!(with_timeout(Duration::from_secs(1), fast).await, Ok(2));
    }
}
