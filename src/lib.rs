//! Custodial transaction signing and market settlement engine for binary
//! price-prediction markets.
//!
//! Users bet through custodial wallets whose keys live in a distributed
//! threshold signing network; the engine builds and signs their EIP-1559
//! transactions, sequences nonces, and settles markets against a read-only
//! price oracle once their settlement time passes. An off-chain ledger
//! mirrors the on-chain state; the chain stays authoritative.

pub mod blockchain;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod signing;

pub use config::AppConfig;
pub use error::EngineError;
