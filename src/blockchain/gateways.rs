//! Admin-signed gateways to the factory and per-market contracts.
//!
//! The traits are the seams the services program against; [`AdminChain`] is
//! the production implementation over the shared chain client plus the admin
//! signing middleware.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::RawLog;
use ethers::contract::{ContractError, EthEvent};
use ethers::providers::{Middleware, MiddlewareError};
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Eip1559TransactionRequest, H256, I256, U256};
use tracing::info;

use crate::blockchain::client::{
    classify_rpc_message, AdminMiddleware, ChainClient, NonceTag, TxBroadcaster,
};
use crate::blockchain::contracts::{BettingMarket, MarketFactory, NewMarketCreatedFilter};
use crate::blockchain::types::{FeePolicy, TxOutcome};
use crate::error::EngineError;

/// On-chain operations the settlement orchestrator needs.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    /// Pending nonce for the admin signing address.
    async fn admin_pending_nonce(&self) -> Result<u64, EngineError>;

    /// Authoritative finalization flag from the market contract.
    async fn is_finalized(&self, market: Address) -> Result<bool, EngineError>;

    /// Submit the finalize transaction with an explicit nonce and wait for
    /// its receipt.
    async fn finalize(&self, market: Address, nonce: u64) -> Result<TxOutcome, EngineError>;

    /// Oracle-derived final price locked in by the contract (8-dp fixed point).
    async fn latest_price(&self, market: Address) -> Result<I256, EngineError>;

    /// The contract's target price (8-dp fixed point).
    async fn target_price(&self, market: Address) -> Result<U256, EngineError>;
}

/// On-chain operations market creation needs.
#[async_trait]
pub trait FactoryGateway: Send + Sync {
    async fn latest_block_timestamp(&self) -> Result<i64, EngineError>;

    async fn is_contract(&self, address: Address) -> Result<bool, EngineError>;

    /// Call `createMarket` and return the new market address parsed from the
    /// `NewMarketCreated` log, together with the receipt data.
    async fn create_market(
        &self,
        settlement_time: u64,
        target_price: U256,
        price_feed: Address,
    ) -> Result<(Address, TxOutcome), EngineError>;
}

/// Production gateway: shared chain client + admin signer middleware.
pub struct AdminChain {
    chain: Arc<ChainClient>,
    signer: Arc<AdminMiddleware>,
    factory_address: Address,
}

impl AdminChain {
    pub fn new(
        chain: Arc<ChainClient>,
        signer: Arc<AdminMiddleware>,
        factory_address: Address,
    ) -> Self {
        Self {
            chain,
            signer,
            factory_address,
        }
    }

    pub fn admin_address(&self) -> Address {
        self.signer.signer().address()
    }

    fn market(&self, address: Address) -> BettingMarket<ethers::providers::Provider<ethers::providers::Http>> {
        BettingMarket::new(address, self.chain.provider())
    }

    fn read_err<M: Middleware>(what: &str, e: ContractError<M>) -> EngineError {
        EngineError::Network(format!("{}: {}", what, e))
    }

    async fn send_admin_tx(
        &self,
        tx: Eip1559TransactionRequest,
        nonce: u64,
    ) -> Result<H256, EngineError> {
        let sender = self.admin_address();
        let pending = self
            .signer
            .send_transaction(TypedTransaction::Eip1559(tx), None)
            .await
            .map_err(|e| match e.as_error_response() {
                Some(rpc) => classify_rpc_message(&rpc.message, sender, nonce),
                None => EngineError::Network(e.to_string()),
            })?;
        Ok(pending.tx_hash())
    }
}

#[async_trait]
impl MarketGateway for AdminChain {
    async fn admin_pending_nonce(&self) -> Result<u64, EngineError> {
        self.chain
            .transaction_count(self.admin_address(), NonceTag::Pending)
            .await
    }

    async fn is_finalized(&self, market: Address) -> Result<bool, EngineError> {
        self.market(market)
            .is_finalized()
            .call()
            .await
            .map_err(|e| Self::read_err("isFinalized", e))
    }

    async fn finalize(&self, market: Address, nonce: u64) -> Result<TxOutcome, EngineError> {
        let calldata = self
            .market(market)
            .finalize()
            .calldata()
            .unwrap_or_default();
        let fees = FeePolicy::finalize();
        let tx = Eip1559TransactionRequest::new()
            .to(market)
            .data(calldata)
            .gas(fees.gas_limit)
            .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .max_fee_per_gas(fees.max_fee_per_gas)
            .nonce(nonce)
            .chain_id(self.chain.chain_id());

        let tx_hash = self.send_admin_tx(tx, nonce).await?;
        info!(?market, ?tx_hash, nonce, "finalize transaction broadcast");
        self.chain.await_receipt(tx_hash).await
    }

    async fn latest_price(&self, market: Address) -> Result<I256, EngineError> {
        self.market(market)
            .get_latest_price()
            .call()
            .await
            .map_err(|e| Self::read_err("getLatestPrice", e))
    }

    async fn target_price(&self, market: Address) -> Result<U256, EngineError> {
        self.market(market)
            .target_price()
            .call()
            .await
            .map_err(|e| Self::read_err("targetPrice", e))
    }
}

#[async_trait]
impl FactoryGateway for AdminChain {
    async fn latest_block_timestamp(&self) -> Result<i64, EngineError> {
        self.chain.latest_block_timestamp().await
    }

    async fn is_contract(&self, address: Address) -> Result<bool, EngineError> {
        self.chain.is_contract(address).await
    }

    async fn create_market(
        &self,
        settlement_time: u64,
        target_price: U256,
        price_feed: Address,
    ) -> Result<(Address, TxOutcome), EngineError> {
        let factory = MarketFactory::new(self.factory_address, self.chain.provider());
        let calldata = factory
            .create_market(settlement_time.into(), target_price, price_feed)
            .calldata()
            .unwrap_or_default();

        // Mined-state nonce: the factory is only ever driven by this signer
        // and creations are not batched.
        let nonce = self
            .chain
            .transaction_count(self.admin_address(), NonceTag::Latest)
            .await?;
        let fees = FeePolicy::create_market();
        let tx = Eip1559TransactionRequest::new()
            .to(self.factory_address)
            .data(calldata)
            .gas(fees.gas_limit)
            .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .max_fee_per_gas(fees.max_fee_per_gas)
            .nonce(nonce)
            .chain_id(self.chain.chain_id());

        let tx_hash = self.send_admin_tx(tx, nonce).await?;
        info!(?tx_hash, nonce, "createMarket transaction broadcast");

        let receipt = self.chain.await_receipt_full(tx_hash).await?;
        let outcome = crate::blockchain::client::outcome_from_receipt(&receipt);
        if !outcome.is_confirmed() {
            return Err(EngineError::TransactionReverted { tx_hash });
        }

        for log in &receipt.logs {
            let raw = RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            };
            if let Ok(event) = <NewMarketCreatedFilter as EthEvent>::decode_log(&raw) {
                info!(market = ?event.new_market_address, "new market deployed");
                return Ok((event.new_market_address, outcome));
            }
        }
        Err(EngineError::Network(
            "NewMarketCreated event missing from receipt".into(),
        ))
    }
}
