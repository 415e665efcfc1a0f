//! # Mean-Reversion Trader
//!
//! Position lifecycle and order execution engine for a mean-reversion
//! strategy on a prediction-market exchange.
//!
//! ## Architecture
//!
//! Independent worker processes cooperate only through the shared store:
//! signal → intent → order → fills → position → exit → closing intent.
//!
//! - `config`: Layered configuration, validation and the hot-reloaded blacklist
//! - `model`: Intents, orders, positions and market reference data
//! - `persistence`: SQLite store with CAS-guarded state transitions
//! - `exchange`: Exchange trait, REST client, paper venue and test mock
//! - `strategy`: Signal, translator, submitter, fill and exit workers
//! - `risk`: Risk governor, alerts and ledger reconciliation
//! - `runtime`: Worker loop, clock, heartbeat and instance lock
//! - `utils`: Decimal helpers

pub mod config;
pub mod exchange;
pub mod model;
pub mod persistence;
pub mod risk;
pub mod runtime;
pub mod strategy;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
