//! Risk management for the mean-reversion pipeline.
//!
//! - Daily loss circuit breaker and per-market loss-streak bans
//! - Per-market cooldowns, drawdown caps and exposure limits
//! - Ledger vs exchange position reconciliation
//! - Structured risk alerts

mod alert;
mod governor;
mod reconciler;

pub use alert::{AlertSeverity, RiskAlert, RiskAlertType};
pub use governor::{BlockReason, RiskGovernor};
pub use reconciler::PositionReconciler;
