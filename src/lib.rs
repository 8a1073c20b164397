//! AP Coins Ledger Library
//!
//! Wallet ledger, prediction-market settlement, shop purchases and reward
//! claims over a single transactional store. The binary in `main.rs` only
//! wires these modules to an HTTP server.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod market;
pub mod middleware;
pub mod rewards;
pub mod shop;

pub use error::{LedgerError, LedgerResult};
