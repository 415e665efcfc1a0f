//! Domain records shared by every worker.
//!
//! These are plain data types plus the pure state-machine rules
//! (order status transitions, position fill merging). Persistence lives in
//! [`crate::persistence`].

mod intent;
mod market;
mod order;
mod position;

pub use intent::{IntentAction, IntentKind, IntentStatus, NewIntent, TradeIntent};
pub use market::{Market, PriceObservation};
pub use order::{NewOrder, OrderStatus, StrategyOrder};
pub use position::{ClosedPosition, ExitReason, FillEffect, Position, PositionStatus};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order or intent direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Side implied by a signed quantity (positive buys, negative sells).
    pub fn from_signed(quantity: rust_decimal::Decimal) -> Self {
        if quantity.is_sign_negative() {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => anyhow::bail!("unknown side: {}", other),
        }
    }
}

/// Identifies one tradable outcome of one market.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutcomeKey {
    pub market_id: String,
    pub outcome: u32,
}

impl OutcomeKey {
    pub fn new(market_id: impl Into<String>, outcome: u32) -> Self {
        Self {
            market_id: market_id.into(),
            outcome,
        }
    }
}

impl fmt::Display for OutcomeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.market_id, self.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_from_signed_quantity() {
        assert_eq!(Side::from_signed(dec!(10)), Side::Buy);
        assert_eq!(Side::from_signed(dec!(-10)), Side::Sell);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
    }
}
