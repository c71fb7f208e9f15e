//! Blockchain access: RPC client, contract bindings and admin gateways.

pub mod client;
pub mod contracts;
pub mod gateways;
pub mod types;

pub use client::{AdminMiddleware, ChainClient, NonceTag, TxBroadcaster};
pub use gateways::{AdminChain, FactoryGateway, MarketGateway};
pub use types::{FeePolicy, OraclePrice, TxOutcome, TxStatus};
