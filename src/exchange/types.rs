//! Venue-neutral request and response types.

use crate::model::Side;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure categories callers branch on.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// Network failure, 5xx, rate limit. Safe to retry later.
    #[error("transient exchange error: {0}")]
    Transient(String),
    /// The exchange refused the request (bad price, no balance, market closed).
    #[error("exchange rejected request: {0}")]
    Rejected(String),
    /// No answer within the call deadline; the outcome is unknown.
    #[error("exchange call timed out")]
    Timeout,
    #[error("not found on exchange: {0}")]
    NotFound(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::Timeout)
    }
}

/// Limit order submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    /// Idempotency key; resubmitting the same id must not create a second order
    pub client_order_id: String,
    pub market_id: String,
    pub outcome: u32,
    pub token_id: String,
    pub side: Side,
    /// Unsigned share quantity
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub limit_price: Decimal,
}

/// Exchange-side order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeOrderStatus {
    /// Resting or partially matched
    Open,
    Filled,
    Cancelled,
}

impl fmt::Display for ExchangeOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeOrderStatus::Open => write!(f, "open"),
            ExchangeOrderStatus::Filled => write!(f, "filled"),
            ExchangeOrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub status: ExchangeOrderStatus,
}

/// Snapshot of one order on the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderState {
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    pub status: ExchangeOrderStatus,
    /// Unsigned matched quantity
    pub filled_size: Decimal,
}

/// One execution against an order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeFill {
    pub fill_id: String,
    pub exchange_order_id: String,
    pub side: Side,
    /// Unsigned quantity
    pub size: Decimal,
    pub price: Decimal,
    pub ts: DateTime<Utc>,
}

impl ExchangeFill {
    /// Quantity with buy positive and sell negative.
    pub fn signed_quantity(&self) -> Decimal {
        match self.side {
            Side::Buy => self.size,
            Side::Sell => -self.size,
        }
    }
}

/// Authoritative net holding for one outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub market_id: String,
    pub outcome: u32,
    /// Signed share quantity
    pub quantity: Decimal,
}
