//! Exchange integrations.
//!
//! - `ClobClient`: authenticated REST client for live trading
//! - `PaperExchange`: simulated venue kept in the shared store
//! - `MockExchange`: in-memory scripted venue for tests

mod client;
pub mod mock;
mod paper;
mod traits;
mod types;

pub use client::ClobClient;
pub use mock::{MockExchange, SubmitScript};
pub use paper::PaperExchange;
#[cfg(test)]
pub use traits::MockExchangeClient;
pub use traits::{with_timeout, ExchangeClient};
pub use types::*;
