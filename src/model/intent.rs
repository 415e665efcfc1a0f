use super::{ExitReason, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Whether an intent opens or unwinds exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Entry,
    Exit,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Entry => "entry",
            IntentKind::Exit => "exit",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(IntentKind::Entry),
            "exit" => Ok(IntentKind::Exit),
            other => anyhow::bail!("unknown intent kind: {}", other),
        }
    }
}

/// Intent lifecycle: `pending → claimed → ordered | rejected | expired`.
///
/// `shadow` intents are recorded for analysis and never consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    Pending,
    Shadow,
    Claimed,
    Ordered,
    Rejected,
    Expired,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Shadow => "shadow",
            IntentStatus::Claimed => "claimed",
            IntentStatus::Ordered => "ordered",
            IntentStatus::Rejected => "rejected",
            IntentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "shadow" => Ok(IntentStatus::Shadow),
            "claimed" => Ok(IntentStatus::Claimed),
            "ordered" => Ok(IntentStatus::Ordered),
            "rejected" => Ok(IntentStatus::Rejected),
            "expired" => Ok(IntentStatus::Expired),
            other => anyhow::bail!("unknown intent status: {}", other),
        }
    }
}

/// What the intent asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentAction {
    /// Open a position worth roughly `size_usd`
    Open { size_usd: Decimal },
    /// Unwind `quantity` shares (signed opposite to the position)
    Close {
        quantity: Decimal,
        exit_reason: ExitReason,
    },
}

impl IntentAction {
    pub fn kind(&self) -> IntentKind {
        match self {
            IntentAction::Open { .. } => IntentKind::Entry,
            IntentAction::Close { .. } => IntentKind::Exit,
        }
    }
}

/// An intent as produced by the signal generator or exit monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIntent {
    pub strategy: String,
    pub market_id: String,
    pub outcome: u32,
    pub side: Side,
    pub action: IntentAction,
    pub signal_price: Decimal,
    pub avg_price: Option<Decimal>,
    pub dislocation: Option<Decimal>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A persisted intent.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeIntent {
    pub id: i64,
    pub strategy: String,
    pub market_id: String,
    pub outcome: u32,
    pub side: Side,
    pub action: IntentAction,
    pub signal_price: Decimal,
    pub avg_price: Option<Decimal>,
    pub dislocation: Option<Decimal>,
    pub reason: String,
    pub status: IntentStatus,
    pub order_id: Option<i64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TradeIntent {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn kind(&self) -> IntentKind {
        self.action.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            IntentStatus::Pending,
            IntentStatus::Shadow,
            IntentStatus::Claimed,
            IntentStatus::Ordered,
            IntentStatus::Rejected,
            IntentStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<IntentStatus>().unwrap(), status);
        }
        assert!("consumed".parse::<IntentStatus>().is_err());
    }
}
