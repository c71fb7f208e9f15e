//! Bet placement and custodial withdrawals.
//!
//! A bet is recorded in the ledger only after its transaction confirms, and
//! exactly once: the mirror never shows stake the chain did not accept.

use std::sync::Arc;

use chrono::Utc;
use ethers::abi::AbiEncode;
use ethers::types::{Address, Bytes, U256};
use tracing::info;

use crate::blockchain::client::TxBroadcaster;
use crate::blockchain::contracts::PlaceBetCall;
use crate::blockchain::types::{u256_to_decimal, TxOutcome};
use crate::db::{MarketStore, WalletDirectory};
use crate::error::EngineError;
use crate::models::{Direction, MarketState, NewBet};
use crate::signing::session::ThresholdSigner;
use crate::signing::tx_signer::CustodialTxSigner;

/// Confirmed bet: ledger id and the receipt it is tied to.
#[derive(Debug, Clone)]
pub struct PlacedBet {
    pub bet_id: i64,
    pub outcome: TxOutcome,
}

pub struct BettingService<B, S, D, M> {
    signer: Arc<CustodialTxSigner<B, S, D>>,
    store: Arc<M>,
}

impl<B, S, D, M> BettingService<B, S, D, M>
where
    B: TxBroadcaster,
    S: ThresholdSigner,
    D: WalletDirectory,
    M: MarketStore,
{
    pub fn new(signer: Arc<CustodialTxSigner<B, S, D>>, store: Arc<M>) -> Self {
        Self { signer, store }
    }

    /// Place a bet from the owner's custodial wallet. The stake travels as
    /// transaction value; the direction is the only calldata argument.
    pub async fn place_bet(
        &self,
        owner_id: &str,
        market_id: i64,
        direction: Direction,
        amount_wei: U256,
    ) -> Result<PlacedBet, EngineError> {
        if amount_wei.is_zero() {
            return Err(EngineError::InvalidParameters(
                "bet amount must be positive".into(),
            ));
        }
        let market = self
            .store
            .market(market_id)
            .await?
            .ok_or(EngineError::MarketNotFound(market_id))?;
        match market.state(Utc::now().timestamp()) {
            MarketState::Open => {}
            MarketState::Finalizable => {
                return Err(EngineError::InvalidParameters(format!(
                    "market {} is past its settlement time",
                    market_id
                )))
            }
            MarketState::Finalized => return Err(EngineError::AlreadyFinalized(market_id)),
        }

        let contract: Address = market.contract_address.parse().map_err(|_| {
            EngineError::InvalidParameters(format!(
                "bad market contract address: {}",
                market.contract_address
            ))
        })?;
        let calldata: Bytes = PlaceBetCall {
            is_above: direction == Direction::Above,
        }
        .encode()
        .into();

        let outcome = self
            .signer
            .sign_and_send(owner_id, contract, calldata, amount_wei)
            .await?;

        let bet_id = self
            .store
            .record_bet(&NewBet {
                market_id,
                owner_id: owner_id.to_string(),
                direction,
                amount: u256_to_decimal(amount_wei)?,
                transaction_hash: format!("{:?}", outcome.tx_hash),
            })
            .await?;
        info!(owner_id, market_id, bet_id, %direction, "bet confirmed and recorded");
        Ok(PlacedBet { bet_id, outcome })
    }

    /// Send native value from the owner's custodial wallet to an external
    /// address. No calldata: a plain transfer.
    pub async fn withdraw(
        &self,
        owner_id: &str,
        to: Address,
        amount_wei: U256,
    ) -> Result<TxOutcome, EngineError> {
        if amount_wei.is_zero() {
            return Err(EngineError::InvalidParameters(
                "withdrawal amount must be positive".into(),
            ));
        }
        let outcome = self
            .signer
            .sign_and_send(owner_id, to, Bytes::new(), amount_wei)
            .await?;
        info!(owner_id, ?to, "withdrawal confirmed");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::H256;
    use ethers::utils::keccak256;
    use rust_decimal::Decimal;
    use tokio::sync::Mutex;

    use crate::blockchain::types::TxStatus;
    use crate::db::{InMemoryMarketStore, InMemoryWalletDirectory};
    use crate::models::{CustodialWallet, Market};
    use crate::signing::local::SingleKeySigner;

    struct FakeChain {
        next_nonce: Mutex<HashMap<Address, u64>>,
        revert_next: AtomicBool,
    }

    impl FakeChain {
        fn new() -> Self {
            Self {
                next_nonce: Mutex::new(HashMap::new()),
                revert_next: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TxBroadcaster for FakeChain {
        async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError> {
            Ok(*self.next_nonce.lock().await.entry(address).or_insert(0))
        }

        async fn broadcast(
            &self,
            raw: Bytes,
            sender: Address,
            _nonce: u64,
        ) -> Result<H256, EngineError> {
            *self.next_nonce.lock().await.entry(sender).or_insert(0) += 1;
            Ok(H256::from(keccak256(&raw)))
        }

        async fn await_receipt(&self, tx_hash: H256) -> Result<TxOutcome, EngineError> {
            let status = if self.revert_next.swap(false, Ordering::SeqCst) {
                TxStatus::Failed
            } else {
                TxStatus::Confirmed
            };
            Ok(TxOutcome {
                tx_hash,
                status,
                block_number: Some(1),
                gas_used: None,
            })
        }
    }

    struct Fixture {
        chain: Arc<FakeChain>,
        store: Arc<InMemoryMarketStore>,
        service: BettingService<FakeChain, SingleKeySigner, InMemoryWalletDirectory, InMemoryMarketStore>,
    }

    async fn fixture() -> Fixture {
        let chain = Arc::new(FakeChain::new());
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

        let signer = Arc::new(CustodialTxSigner::new(
            chain.clone(),
            threshold,
            directory,
            "admin",
            137,
        ));
        let store = Arc::new(InMemoryMarketStore::default());
        Fixture {
            chain,
            store: store.clone(),
            service: BettingService::new(signer, store),
        }
    }

    fn open_market(id: i64) -> Market {
        Market {
            id,
            title: "BTC above 50k".into(),
            asset_type: "BTC/USD".into(),
            contract_address: "0x2222222222222222222222222222222222222222".into(),
            oracle_address: "0x3333333333333333333333333333333333333333".into(),
            settlement_time: Utc::now().timestamp() + 3_600,
            target_price: Decimal::from(5_000_000_000_000i64),
            is_finalized: false,
            winner_direction: None,
            final_price: None,
            participant_count: 0,
            yes_count: 0,
            no_count: 0,
            yes_amount: Decimal::ZERO,
            no_amount: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_confirmed_bet_is_recorded_once() {
        let f = fixture().await;
        f.store.seed_market(open_market(1));

        let placed = f
            .service
            .place_bet("user-1", 1, Direction::Above, U256::from(1_000))
            .await
            .unwrap();
        assert_eq!(placed.bet_id, 1);

        let market = f.store.market(1).await.unwrap().unwrap();
        assert_eq!(market.yes_amount, Decimal::from(1_000));
        assert_eq!(market.participant_count, 1);
        assert_eq!(f.store.bets().len(), 1);
        assert_eq!(
            f.store.bets()[0].transaction_hash,
            format!("{:?}", placed.outcome.tx_hash)
        );
    }

    #[tokio::test]
    async fn test_reverted_bet_is_not_recorded() {
        let f = fixture().await;
        f.store.seed_market(open_market(1));
        f.chain.revert_next.store(true, Ordering::SeqCst);

        let result = f
            .service
            .place_bet("user-1", 1, Direction::Below, U256::from(1_000))
            .await;
        assert!(matches!(
            result,
            Err(EngineError::TransactionReverted { .. })
        ));
        assert!(f.store.bets().is_empty());
        let market = f.store.market(1).await.unwrap().unwrap();
        assert_eq!(market.no_amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_bet_on_finalized_market_is_rejected() {
        let f = fixture().await;
        let mut market = open_market(1);
        market.is_finalized = true;
        f.store.seed_market(market);

        let result = f
            .service
            .place_bet("user-1", 1, Direction::Above, U256::from(1_000))
            .await;
        assert!(matches!(result, Err(EngineError::AlreadyFinalized(1))));
    }

    #[tokio::test]
    async fn test_bet_past_settlement_is_rejected() {
        let f = fixture().await;
        let mut market = open_market(1);
        market.settlement_time = Utc::now().timestamp() - 60;
        f.store.seed_market(market);

        let result = f
            .service
            .place_bet("user-1", 1, Direction::Above, U256::from(1_000))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_bet_validation_order() {
        let f = fixture().await;
        // Zero amount fails before the market lookup
        let result = f
            .service
            .place_bet("user-1", 99, Direction::Above, U256::zero())
            .await;
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));

        let result = f
            .service
            .place_bet("user-1", 99, Direction::Above, U256::from(1))
            .await;
        assert!(matches!(result, Err(EngineError::MarketNotFound(99))));
    }

    #[tokio::test]
    async fn test_withdraw_sends_plain_transfer() {
        let f = fixture().await;
        let to: Address = "0x4444444444444444444444444444444444444444".parse().unwrap();

        let outcome = f
            .service
            .withdraw("user-1", to, U256::from(5_000))
            .await
            .unwrap();
        assert!(outcome.is_confirmed());

        assert!(matches!(
            f.service.withdraw("user-1", to, U256::zero()).await,
            Err(EngineError::InvalidParameters(_))
        ));
    }
}
