//! Trading pipeline workers.
//!
//! - Signal generation from price dislocations
//! - Intent translation into sized, risk-checked orders
//! - Order submission with retry and idempotent resolution
//! - Fill reconciliation into the position ledger
//! - Exit monitoring and closing intents

mod exits;
mod fills;
mod signal;
mod submitter;
mod translator;

pub use exits::{evaluate_exit, ExitMonitor};
pub use fills::{AppliedFill, FillReconciler};
pub use signal::{evaluate_entry, volatility_collapsed, volume_spike, EntrySignal, SignalGenerator, SkipReason};
pub use submitter::{backoff_delay, OrderSubmitter, SubmitOutcome};
pub use translator::{IntentTranslator, Translation};
