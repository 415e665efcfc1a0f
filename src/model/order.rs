use super::{IntentKind, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Order lifecycle status.
///
/// ```text
/// submitted ──► live ──► partially_filled ──► filled
///     │           │               │
///     ├──► error  └──► cancelled ◄┘
///     └──► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Submitted,
    Live,
    PartiallyFilled,
    Filled,
    Cancelled,
    Error,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "submitted",
            OrderStatus::Live => "live",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Error
        )
    }

    /// Statuses the fill reconciler polls.
    pub fn is_working(&self) -> bool {
        matches!(self, OrderStatus::Live | OrderStatus::PartiallyFilled)
    }

    /// Whether moving from `self` to `next` is allowed. Status only moves
    /// forward; terminal statuses never change.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Submitted, Live | Error | Cancelled) => true,
            (Live, PartiallyFilled | Filled | Cancelled) => true,
            (PartiallyFilled, PartiallyFilled | Filled | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(OrderStatus::Submitted),
            "live" => Ok(OrderStatus::Live),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "error" => Ok(OrderStatus::Error),
            other => anyhow::bail!("unknown order status: {}", other),
        }
    }
}

/// Order to be inserted by the translator.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub strategy: String,
    pub market_id: String,
    pub outcome: u32,
    pub token_id: String,
    pub kind: IntentKind,
    /// Signed share quantity: positive buys, negative sells
    pub quantity: Decimal,
    pub limit_price: Decimal,
    pub paper: bool,
    pub intent_id: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NewOrder {
    /// Exchange idempotency key. Derived from the intent so a retried insert
    /// or resubmission maps to the same exchange order.
    pub fn client_order_id(&self) -> String {
        format!("{}-{}", self.strategy, self.intent_id)
    }
}

/// A persisted strategy order.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOrder {
    pub id: i64,
    pub strategy: String,
    pub market_id: String,
    pub outcome: u32,
    pub token_id: String,
    pub kind: IntentKind,
    pub quantity: Decimal,
    pub limit_price: Decimal,
    pub status: OrderStatus,
    pub paper: bool,
    pub intent_id: i64,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub filled_quantity: Decimal,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// A submission timed out and has not been resolved yet
    pub unknown_outcome: bool,
    pub last_error: Option<String>,
    pub last_fill_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyOrder {
    pub fn side(&self) -> Side {
        Side::from_signed(self.quantity)
    }

    /// Unsigned quantity still open on the exchange.
    pub fn remaining(&self) -> Decimal {
        (self.quantity.abs() - self.filled_quantity.abs()).max(Decimal::ZERO)
    }

    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.limit_price
    }
}
