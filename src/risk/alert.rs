//! Structured risk alerts.
//!
//! Alerts are emitted as one JSON line on the `risk_alert` tracing target so
//! log tooling can pick them out of the regular worker output.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// What tripped.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum RiskAlertType {
    /// Ledger and exchange disagree on a holding
    PositionMismatch {
        market_id: String,
        outcome: u32,
        ledger: Decimal,
        exchange: Decimal,
    },
    /// Daily realized loss reached the limit
    CircuitBreaker { daily_pnl: Decimal, limit: Decimal },
    /// Consecutive losing closes in one market
    LossStreakBan { market_id: String, streak: u32 },
    /// Cumulative loss in one market reached the cap
    MarketDrawdown { market_id: String, cumulative_pnl: Decimal },
    /// Order could not be placed after all retries
    SubmitExhausted { order_id: i64, attempts: u32 },
    /// Worker stopped reporting
    StaleWorker { worker: String, age_secs: i64 },
}

/// A risk alert.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub strategy: String,
    pub alert_type: RiskAlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub metrics: BTreeMap<String, Decimal>,
}

impl RiskAlert {
    pub fn new(
        strategy: &str,
        alert_type: RiskAlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let alert_id = format!(
            "risk-{}-{:08x}",
            timestamp.timestamp(),
            timestamp.timestamp_subsec_nanos()
        );

        Self {
            alert_id,
            timestamp,
            strategy: strategy.to_string(),
            alert_type,
            severity,
            message: message.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: &str, value: Decimal) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Emit as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Error => error!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Critical => error!(target: "risk_alert", "RISK_ALERT: {}", json),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_alert_serializes_tagged_type() {
        let alert = RiskAlert::new(
            "mr",
            RiskAlertType::PositionMismatch {
                market_id: "m1".to_string(),
                outcome: 1,
                ledger: dec!(1000),
                exchange: dec!(0),
            },
            AlertSeverity::Error,
            "ledger holds shares the exchange does not",
            Utc::now(),
        )
        .with_metric("difference", dec!(1000));

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["alert_type"]["type"], "PositionMismatch");
        assert_eq!(json["severity"], "Error");
        assert_eq!(json["metrics"]["difference"], "1000");
        assert!(alert.alert_id.starts_with("risk-"));
        assert!(AlertSeverity::Critical > AlertSeverity::Warning);
    }
}
