//! Market creation: validate, deploy via the factory, mirror the row.
//!
//! All validation happens before any chain interaction so a rejected request
//! never consumes admin gas or a nonce.

use std::sync::Arc;

use ethers::types::Address;
use tracing::info;

use crate::blockchain::gateways::FactoryGateway;
use crate::blockchain::types::{decimal_to_u256, TxOutcome};
use crate::db::MarketStore;
use crate::error::EngineError;
use crate::models::NewMarket;

/// Result of a successful creation: ledger id plus the deployed contract.
#[derive(Debug, Clone)]
pub struct CreatedMarket {
    pub market_id: i64,
    pub contract_address: Address,
    pub outcome: TxOutcome,
}

pub struct MarketCreator<G, S> {
    gateway: Arc<G>,
    store: Arc<S>,
}

impl<G, S> MarketCreator<G, S>
where
    G: FactoryGateway,
    S: MarketStore,
{
    pub fn new(gateway: Arc<G>, store: Arc<S>) -> Self {
        Self { gateway, store }
    }

    async fn validate(&self, market: &NewMarket) -> Result<Address, EngineError> {
        if market.title.trim().is_empty() {
            return Err(EngineError::InvalidParameters("empty title".into()));
        }
        if market.target_price <= rust_decimal::Decimal::ZERO {
            return Err(EngineError::InvalidParameters(
                "target price must be positive".into(),
            ));
        }

        let feed: Address = market.oracle_address.parse().map_err(|_| {
            EngineError::InvalidParameters(format!(
                "bad oracle address: {}",
                market.oracle_address
            ))
        })?;
        if !self.gateway.is_contract(feed).await? {
            return Err(EngineError::InvalidParameters(format!(
                "oracle address has no code: {}",
                market.oracle_address
            )));
        }

        // Chain time, not wall clock: the contract constructor enforces the
        // same bound against block.timestamp.
        let chain_now = self.gateway.latest_block_timestamp().await?;
        if market.settlement_time <= chain_now {
            return Err(EngineError::InvalidParameters(format!(
                "settlement time {} is not after chain time {}",
                market.settlement_time, chain_now
            )));
        }
        Ok(feed)
    }

    /// Deploy a market contract and insert its mirror row.
    pub async fn create(&self, market: NewMarket) -> Result<CreatedMarket, EngineError> {
        let feed = self.validate(&market).await?;
        let target = decimal_to_u256(market.target_price)?;

        let (contract_address, outcome) = self
            .gateway
            .create_market(market.settlement_time as u64, target, feed)
            .await?;

        let market_id = self
            .store
            .insert_market(&market, &format!("{:?}", contract_address))
            .await?;
        info!(
            market_id,
            ?contract_address,
            settlement_time = market.settlement_time,
            "market created"
        );
        Ok(CreatedMarket {
            market_id,
            contract_address,
            outcome,
        })
    }
}
