//! Custodial transaction construction and signing.
//!
//! Nonce discipline: the pending nonce is read immediately before signing,
//! under a per-owner lock held across read-nonce, sign and broadcast. The
//! lock is released before the receipt wait so slow confirmations never
//! serialize unrelated submissions for the same owner.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, U256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::blockchain::client::TxBroadcaster;
use crate::blockchain::types::{FeePolicy, TxOutcome};
use crate::db::WalletDirectory;
use crate::error::EngineError;
use crate::models::CustodialWallet;
use crate::signing::session::ThresholdSigner;

/// Raw signed transaction plus the construction context callers may log.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw: Bytes,
    pub sender: Address,
    pub nonce: u64,
}

/// One lock per owner address; created lazily and never removed, the owner
/// set is bounded by the wallet directory.
#[derive(Default)]
struct OwnerLocks {
    inner: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl OwnerLocks {
    async fn acquire(&self, owner: Address) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(owner)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Builds, signs and submits EIP-1559 transactions for custodial wallets.
pub struct CustodialTxSigner<B, S, D> {
    chain: Arc<B>,
    signer: Arc<S>,
    directory: Arc<D>,
    admin_id: String,
    chain_id: u64,
    fees: FeePolicy,
    locks: OwnerLocks,
}

impl<B, S, D> CustodialTxSigner<B, S, D>
where
    B: TxBroadcaster,
    S: ThresholdSigner,
    D: WalletDirectory,
{
    pub fn new(
        chain: Arc<B>,
        signer: Arc<S>,
        directory: Arc<D>,
        admin_id: impl Into<String>,
        chain_id: u64,
    ) -> Self {
        Self {
            chain,
            signer,
            directory,
            admin_id: admin_id.into(),
            chain_id,
            fees: FeePolicy::custodial(),
            locks: OwnerLocks::default(),
        }
    }

    /// Deterministic transaction construction: same inputs and nonce, same
    /// signing digest.
    pub fn build_transaction(
        to: Address,
        data: Bytes,
        value: U256,
        nonce: u64,
        chain_id: u64,
        fees: FeePolicy,
    ) -> Eip1559TransactionRequest {
        Eip1559TransactionRequest::new()
            .to(to)
            .data(data)
            .value(value)
            .nonce(nonce)
            .gas(fees.gas_limit)
            .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .max_fee_per_gas(fees.max_fee_per_gas)
            .chain_id(chain_id)
    }

    async fn sign_built(
        &self,
        wallet: &CustodialWallet,
        tx: Eip1559TransactionRequest,
    ) -> Result<Bytes, EngineError> {
        let typed = TypedTransaction::Eip1559(tx);
        let digest = typed.sighash();

        let credential = self.signer.authorize(&self.admin_id).await?;
        let share = self
            .signer
            .co_sign(&credential, &wallet.public_key, digest)
            .await?;
        let signature = share.to_eth_signature();

        // A signature that recovers elsewhere would burn the nonce on an
        // unbroadcastable transaction; reject it here.
        let expected = wallet.eth_address()?;
        let recovered = signature
            .recover(digest)
            .map_err(|e| EngineError::SigningUnavailable(format!("recovery failed: {}", e)))?;
        if recovered != expected {
            return Err(EngineError::SigningUnavailable(format!(
                "signature recovers to {:?}, wallet address is {:?}",
                recovered, expected
            )));
        }

        Ok(typed.rlp_signed(&signature))
    }

    /// Sign a transaction for `owner_id` without broadcasting it. The nonce
    /// is read under the owner lock immediately before signing.
    pub async fn sign_transaction(
        &self,
        owner_id: &str,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<SignedTx, EngineError> {
        let wallet = self.directory.wallet_for(owner_id).await?;
        let sender = wallet.eth_address()?;

        let _guard = self.locks.acquire(sender).await;
        let nonce = self.chain.pending_nonce(sender).await?;
        let tx = Self::build_transaction(to, data, value, nonce, self.chain_id, self.fees);
        let raw = self.sign_built(&wallet, tx).await?;
        debug!(owner_id, ?sender, nonce, "custodial transaction signed");
        Ok(SignedTx { raw, sender, nonce })
    }

    /// Sign, broadcast and wait for the receipt. A mined-but-reverted
    /// transaction is an error: its nonce is consumed.
    pub async fn sign_and_send(
        &self,
        owner_id: &str,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<TxOutcome, EngineError> {
        let wallet = self.directory.wallet_for(owner_id).await?;
        let sender = wallet.eth_address()?;

        let guard = self.locks.acquire(sender).await;
        let nonce = self.chain.pending_nonce(sender).await?;
        let tx = Self::build_transaction(to, data, value, nonce, self.chain_id, self.fees);
        let raw = self.sign_built(&wallet, tx).await?;
        let tx_hash = self.chain.broadcast(raw, sender, nonce).await?;
        drop(guard);

        info!(owner_id, ?tx_hash, nonce, "custodial transaction broadcast");
        let outcome = self.chain.await_receipt(tx_hash).await?;
        if !outcome.is_confirmed() {
            return Err(EngineError::TransactionReverted { tx_hash });
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::H256;
    use ethers::utils::keccak256;

    use crate::blockchain::types::TxStatus;
    use crate::db::InMemoryWalletDirectory;
    use crate::signing::local::SingleKeySigner;

    /// In-memory chain: tracks the next expected nonce per sender and
    /// rejects replays the way a node would.
    #[derive(Default)]
    struct FakeChain {
        next_nonce: Mutex<HashMap<Address, u64>>,
        submitted: Mutex<Vec<(Address, u64)>>,
        stale_nonce_view: AtomicBool,
    }

    #[async_trait]
    impl TxBroadcaster for FakeChain {
        async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError> {
            let current = *self.next_nonce.lock().await.entry(address).or_insert(0);
            // Widen the read-to-broadcast window so unserialized callers
            // would observe the same nonce.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if self.stale_nonce_view.load(Ordering::SeqCst) {
                return Ok(current.saturating_sub(1));
            }
            Ok(current)
        }

        async fn broadcast(
            &self,
            raw: Bytes,
            sender: Address,
            nonce: u64,
        ) -> Result<H256, EngineError> {
            assert!(!raw.is_empty());
            let mut nonces = self.next_nonce.lock().await;
            let expected = nonces.entry(sender).or_insert(0);
            if nonce != *expected {
                return Err(EngineError::NonceConflict {
                    owner: sender,
                    nonce,
                });
            }
            *expected += 1;
            self.submitted.lock().await.push((sender, nonce));
            Ok(H256::from(keccak256(&raw)))
        }

        async fn await_receipt(&self, tx_hash: H256) -> Result<TxOutcome, EngineError> {
            Ok(TxOutcome {
                tx_hash,
                status: TxStatus::Confirmed,
                block_number: Some(1),
                gas_used: None,
            })
        }
    }

    async fn signer_fixture() -> (
        Arc<FakeChain>,
        CustodialTxSigner<FakeChain, SingleKeySigner, InMemoryWalletDirectory>,
        Address,
    ) {
        let chain = Arc::new(FakeChain::default());
        let threshold = Arc::new(SingleKeySigner::new());
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let address = wallet.address();
        let public_key = threshold.register(wallet).await;

        let directory = Arc::new(InMemoryWalletDirectory::default());
        directory.insert(CustodialWallet {
            owner_id: "user-1".into(),
            public_key,
            key_id: "key-1".into(),
            address: format!("{:?}", address),
        });

        let signer = CustodialTxSigner::new(
            chain.clone(),
            threshold,
            directory,
            "admin",
            137,
        );
        (chain, signer, address)
    }

    fn recipient() -> Address {
        "0x1111111111111111111111111111111111111111".parse().unwrap()
    }

    #[tokio::test]
    async fn test_signed_tx_recovers_to_custodial_address() {
        let (_chain, signer, address) = signer_fixture().await;
        let signed = signer
            .sign_transaction("user-1", recipient(), Bytes::new(), U256::from(100))
            .await
            .unwrap();

        assert_eq!(signed.sender, address);
        assert_eq!(signed.nonce, 0);
        // Typed-transaction envelope for EIP-1559
        assert_eq!(signed.raw.0[0], 0x02);

        let rlp = ethers::utils::rlp::Rlp::new(&signed.raw.0[..]);
        let (tx, sig) = TypedTransaction::decode_signed(&rlp).unwrap();
        // Typed transactions carry raw y-parity, never the 27-offset form
        assert!(sig.v <= 1);
        assert_eq!(sig.recover(tx.sighash()).unwrap(), address);
    }

    #[tokio::test]
    async fn test_unknown_owner_is_wallet_not_found() {
        let (_chain, signer, _address) = signer_fixture().await;
        let result = signer
            .sign_transaction("nobody", recipient(), Bytes::new(), U256::zero())
            .await;
        assert!(matches!(result, Err(EngineError::WalletNotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_sends_get_distinct_sequential_nonces() {
        let (chain, signer, address) = signer_fixture().await;
        let signer = Arc::new(signer);

        let a = {
            let signer = signer.clone();
            tokio::spawn(async move {
                signer
                    .sign_and_send("user-1", recipient(), Bytes::new(), U256::from(1))
                    .await
            })
        };
        let b = {
            let signer = signer.clone();
            tokio::spawn(async move {
                signer
                    .sign_and_send("user-1", recipient(), Bytes::new(), U256::from(2))
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let submitted = chain.submitted.lock().await.clone();
        assert_eq!(submitted, vec![(address, 0), (address, 1)]);
    }

    #[tokio::test]
    async fn test_stale_nonce_view_is_a_nonce_conflict() {
        let (chain, signer, address) = signer_fixture().await;
        signer
            .sign_and_send("user-1", recipient(), Bytes::new(), U256::from(1))
            .await
            .unwrap();

        // The node's pending view lags behind what was just accepted.
        chain.stale_nonce_view.store(true, Ordering::SeqCst);
        let result = signer
            .sign_and_send("user-1", recipient(), Bytes::new(), U256::from(2))
            .await;
        match result {
            Err(EngineError::NonceConflict { owner, nonce }) => {
                assert_eq!(owner, address);
                assert_eq!(nonce, 0);
            }
            other => panic!("expected NonceConflict, got {:?}", other),
        }
    }
}
