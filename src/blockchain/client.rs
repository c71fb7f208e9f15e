//! Chain client: the only component that talks to the RPC endpoint.
//!
//! Every method is a single bounded call with no implicit retry; retry policy
//! belongs to the callers. Broadcast rejections are classified here, at the
//! point the node raises them, into the closed [`EngineError`] taxonomy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use tracing::{debug, warn};

use crate::blockchain::contracts::PriceFeedAggregator;
use crate::blockchain::types::{OraclePrice, TxOutcome, TxStatus};
use crate::error::EngineError;

/// Admin signing middleware used for factory and finalize transactions.
pub type AdminMiddleware = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Which nonce view to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    /// Includes transactions still in the mempool.
    Pending,
    /// Mined state only.
    Latest,
}

/// Seam between transaction producers and the RPC endpoint, so the custodial
/// signer can be exercised against an in-memory chain in tests.
#[async_trait]
pub trait TxBroadcaster: Send + Sync {
    async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError>;

    /// Broadcast a raw signed transaction. `sender` and `nonce` give the
    /// classification context for nonce races.
    async fn broadcast(&self, raw: Bytes, sender: Address, nonce: u64)
        -> Result<H256, EngineError>;

    /// Block until the transaction is mined or the waiting ceiling elapses.
    async fn await_receipt(&self, tx_hash: H256) -> Result<TxOutcome, EngineError>;
}

/// JSON-RPC connection wrapper.
#[derive(Clone)]
pub struct ChainClient {
    provider: Arc<Provider<Http>>,
    chain_id: u64,
    rpc_timeout: Duration,
    receipt_timeout: Duration,
    receipt_poll_interval: Duration,
}

impl ChainClient {
    pub fn new(rpc_url: &str, chain_id: u64) -> Result<Self, EngineError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| EngineError::Network(format!("bad rpc url: {}", e)))?;
        Ok(Self {
            provider: Arc::new(provider),
            chain_id,
            rpc_timeout: Duration::from_secs(15),
            receipt_timeout: Duration::from_secs(120),
            receipt_poll_interval: Duration::from_secs(2),
        })
    }

    pub fn with_timeouts(mut self, rpc_timeout: Duration, receipt_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self.receipt_timeout = receipt_timeout;
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn provider(&self) -> Arc<Provider<Http>> {
        self.provider.clone()
    }

    /// Build the admin signing middleware from a raw private key.
    pub fn admin_middleware(&self, private_key: &str) -> Result<Arc<AdminMiddleware>, EngineError> {
        let wallet: LocalWallet = private_key
            .parse::<LocalWallet>()
            .map_err(|_| EngineError::InvalidParameters("bad admin private key".into()))?
            .with_chain_id(self.chain_id);
        Ok(Arc::new(SignerMiddleware::new(
            (*self.provider).clone(),
            wallet,
        )))
    }

    async fn rpc<T, F>(&self, what: &str, fut: F) -> Result<T, EngineError>
    where
        F: std::future::Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(EngineError::Network(format!("{}: {}", what, e))),
            Err(_) => Err(EngineError::Network(format!(
                "{} timed out after {:?}",
                what, self.rpc_timeout
            ))),
        }
    }

    /// Timestamp of the latest block, used to validate settlement times.
    pub async fn latest_block_timestamp(&self) -> Result<i64, EngineError> {
        let block = self
            .rpc("eth_getBlockByNumber", self.provider.get_block(BlockNumber::Latest))
            .await?
            .ok_or_else(|| EngineError::Network("latest block unavailable".into()))?;
        Ok(block.timestamp.as_u64() as i64)
    }

    pub async fn transaction_count(
        &self,
        address: Address,
        tag: NonceTag,
    ) -> Result<u64, EngineError> {
        let block = match tag {
            NonceTag::Pending => BlockNumber::Pending,
            NonceTag::Latest => BlockNumber::Latest,
        };
        let count = self
            .rpc(
                "eth_getTransactionCount",
                self.provider.get_transaction_count(address, Some(block.into())),
            )
            .await?;
        Ok(count.as_u64())
    }

    /// Current (max_fee, priority_fee) estimate. Informational: submissions
    /// use the fixed [`FeePolicy`](crate::blockchain::types::FeePolicy).
    pub async fn fee_estimate(&self) -> Result<(U256, U256), EngineError> {
        self.rpc(
            "eth_feeHistory",
            self.provider.estimate_eip1559_fees(None),
        )
        .await
    }

    pub async fn is_contract(&self, address: Address) -> Result<bool, EngineError> {
        let code = self
            .rpc("eth_getCode", self.provider.get_code(address, None))
            .await?;
        Ok(!code.0.is_empty())
    }

    pub async fn native_balance(&self, address: Address) -> Result<U256, EngineError> {
        self.rpc("eth_getBalance", self.provider.get_balance(address, None))
            .await
    }

    /// Wait for a receipt, returning the raw receipt for callers that need
    /// event logs. Bounded by the receipt ceiling.
    pub async fn await_receipt_full(
        &self,
        tx_hash: H256,
    ) -> Result<TransactionReceipt, EngineError> {
        let started = tokio::time::Instant::now();
        loop {
            // The transaction is already broadcast: a transport failure here
            // leaves its state unknown, so surface it as unconfirmed with
            // the hash instead of a bare network error. The nonce is
            // consumed either way.
            let receipt = match self
                .rpc(
                    "eth_getTransactionReceipt",
                    self.provider.get_transaction_receipt(tx_hash),
                )
                .await
            {
                Ok(receipt) => receipt,
                Err(EngineError::Network(msg)) => {
                    warn!(?tx_hash, error = %msg, "receipt poll failed, transaction state unknown");
                    return Err(EngineError::SubmittedUnconfirmed {
                        tx_hash,
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
                Err(e) => return Err(e),
            };
            if let Some(receipt) = receipt {
                return Ok(receipt);
            }
            if started.elapsed() >= self.receipt_timeout {
                warn!(?tx_hash, "receipt wait ceiling reached, transaction unconfirmed");
                return Err(EngineError::SubmittedUnconfirmed {
                    tx_hash,
                    waited_secs: self.receipt_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }

    /// Read the latest round from a price-feed aggregator.
    pub async fn read_oracle(&self, feed: Address) -> Result<OraclePrice, EngineError> {
        let aggregator = PriceFeedAggregator::new(feed, self.provider.clone());
        let call = aggregator.latest_round_data();
        let fut = call.call();
        let (_round_id, answer, _started_at, updated_at, _answered_in_round) =
            match tokio::time::timeout(self.rpc_timeout, fut).await {
                Ok(Ok(round)) => round,
                Ok(Err(e)) => {
                    return Err(EngineError::Network(format!("latestRoundData: {}", e)))
                }
                Err(_) => {
                    return Err(EngineError::Network(format!(
                        "latestRoundData timed out after {:?}",
                        self.rpc_timeout
                    )))
                }
            };
        debug!(?feed, %answer, "oracle round read");
        Ok(OraclePrice {
            price: answer,
            updated_at: updated_at.as_u64(),
        })
    }
}

#[async_trait]
impl TxBroadcaster for ChainClient {
    async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError> {
        self.transaction_count(address, NonceTag::Pending).await
    }

    async fn broadcast(
        &self,
        raw: Bytes,
        sender: Address,
        nonce: u64,
    ) -> Result<H256, EngineError> {
        let fut = self.provider.send_raw_transaction(raw);
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(Ok(pending)) => {
                let tx_hash = pending.tx_hash();
                debug!(?tx_hash, ?sender, nonce, "transaction broadcast");
                Ok(tx_hash)
            }
            Ok(Err(e)) => Err(classify_provider_error(&e, sender, nonce)),
            Err(_) => Err(EngineError::Network(format!(
                "eth_sendRawTransaction timed out after {:?}",
                self.rpc_timeout
            ))),
        }
    }

    async fn await_receipt(&self, tx_hash: H256) -> Result<TxOutcome, EngineError> {
        let receipt = self.await_receipt_full(tx_hash).await?;
        Ok(outcome_from_receipt(&receipt))
    }
}

/// Map a mined receipt into the engine's outcome type.
pub fn outcome_from_receipt(receipt: &TransactionReceipt) -> TxOutcome {
    TxOutcome {
        tx_hash: receipt.transaction_hash,
        status: if receipt.status == Some(1.into()) {
            TxStatus::Confirmed
        } else {
            TxStatus::Failed
        },
        block_number: receipt.block_number.map(|b| b.as_u64()),
        gas_used: receipt.gas_used,
    }
}

fn classify_provider_error(err: &ProviderError, sender: Address, nonce: u64) -> EngineError {
    match err.as_error_response() {
        Some(rpc) => classify_rpc_message(&rpc.message, sender, nonce),
        None => EngineError::Network(err.to_string()),
    }
}

/// Classify a node rejection message at the point it is raised. Upper layers
/// only ever see the closed enum, never message text.
pub(crate) fn classify_rpc_message(message: &str, sender: Address, nonce: u64) -> EngineError {
    let msg = message.to_lowercase();
    if msg.contains("nonce too low")
        || msg.contains("already known")
        || msg.contains("replacement transaction underpriced")
    {
        return EngineError::NonceConflict {
            owner: sender,
            nonce,
        };
    }
    if msg.contains("insufficient funds") {
        return EngineError::InsufficientFunds;
    }
    if msg.contains("underpriced") || msg.contains("fee cap") || msg.contains("tip cap") {
        return EngineError::Underpriced;
    }
    EngineError::Network(message.to_string())
}
