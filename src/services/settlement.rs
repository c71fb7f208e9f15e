//! Market settlement orchestration.
//!
//! The chain is authoritative for finalization: the mirror row only
//! short-circuits work, it never overrides `isFinalized()`. Finalizing an
//! already-finalized market succeeds as a no-op, so retries and concurrent
//! settlement runs converge instead of failing each other.

use std::sync::Arc;

use chrono::Utc;
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::blockchain::gateways::MarketGateway;
use crate::blockchain::types::{i256_to_decimal, u256_to_decimal};
use crate::db::MarketStore;
use crate::error::EngineError;
use crate::models::{Direction, Market, MarketState};

/// Outcome of settling one market.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub market_id: i64,
    /// Set when this call submitted the finalize transaction; `None` for
    /// no-op reconciliations.
    pub tx_hash: Option<H256>,
    pub winner: Direction,
    /// 8-decimal fixed-point oracle price locked in at settlement.
    pub final_price: Decimal,
    pub target_price: Decimal,
    /// The market was already finalized before this call did anything.
    pub already_finalized: bool,
}

/// Per-market result within a batch run.
#[derive(Debug)]
pub struct BatchItem {
    pub market_id: i64,
    pub result: Result<FinalizeOutcome, EngineError>,
}

/// Aggregate view of one batch run. `succeeded + failed == total` always.
#[derive(Debug)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

pub struct SettlementOrchestrator<G, S> {
    gateway: Arc<G>,
    store: Arc<S>,
}

impl<G, S> SettlementOrchestrator<G, S>
where
    G: MarketGateway,
    S: MarketStore,
{
    pub fn new(gateway: Arc<G>, store: Arc<S>) -> Self {
        Self { gateway, store }
    }

    /// Markets due for settlement, longest overdue first.
    pub async fn list_finalizable(&self, now: i64) -> Result<Vec<Market>, EngineError> {
        self.store.finalizable(now).await
    }

    /// Finalize one market, reading its own pending nonce.
    pub async fn finalize_one(&self, market_id: i64) -> Result<FinalizeOutcome, EngineError> {
        let market = self.load_due(market_id).await?;
        if let Some(outcome) = self.short_circuit(&market).await? {
            return Ok(outcome);
        }
        let nonce = self.gateway.admin_pending_nonce().await?;
        self.submit_finalize(&market, nonce).await
    }

    /// Finalize a batch sequentially with one nonce seed.
    ///
    /// The admin pending nonce is read once; each submission that reaches
    /// the chain consumes the next value, including mined-but-reverted
    /// transactions. One failing market never aborts the rest.
    pub async fn finalize_batch(&self, market_ids: &[i64]) -> Result<BatchReport, EngineError> {
        let mut nonce = self.gateway.admin_pending_nonce().await?;
        let mut items = Vec::with_capacity(market_ids.len());
        let mut succeeded = 0;
        let mut failed = 0;

        for &market_id in market_ids {
            let (result, consumed_nonce) = self.finalize_batched(market_id, nonce).await;
            if consumed_nonce {
                nonce += 1;
            }
            match &result {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    warn!(market_id, error = %e, "batch item failed");
                    failed += 1;
                }
            }
            items.push(BatchItem { market_id, result });
        }

        info!(
            total = market_ids.len(),
            succeeded, failed, "settlement batch complete"
        );
        Ok(BatchReport {
            total: market_ids.len(),
            succeeded,
            failed,
            items,
        })
    }

    /// One batch item: the second return value reports whether a
    /// transaction reached the chain and consumed the nonce.
    async fn finalize_batched(
        &self,
        market_id: i64,
        nonce: u64,
    ) -> (Result<FinalizeOutcome, EngineError>, bool) {
        let market = match self.load_due(market_id).await {
            Ok(m) => m,
            Err(e) => return (Err(e), false),
        };
        match self.short_circuit(&market).await {
            Ok(Some(outcome)) => return (Ok(outcome), false),
            Ok(None) => {}
            Err(e) => return (Err(e), false),
        }
        match self.submit_finalize(&market, nonce).await {
            Ok(outcome) => (Ok(outcome), true),
            Err(e) => {
                let consumed = e.is_post_broadcast();
                (Err(e), consumed)
            }
        }
    }

    async fn load_due(&self, market_id: i64) -> Result<Market, EngineError> {
        let market = self
            .store
            .market(market_id)
            .await?
            .ok_or(EngineError::MarketNotFound(market_id))?;
        if market.state(Utc::now().timestamp()) == MarketState::Open {
            return Err(EngineError::InvalidParameters(format!(
                "market {} has not reached its settlement time",
                market_id
            )));
        }
        Ok(market)
    }

    /// Already-finalized detection: mirror row first, then the contract.
    /// Returns the converged outcome, or `None` when a finalize transaction
    /// is still needed.
    async fn short_circuit(
        &self,
        market: &Market,
    ) -> Result<Option<FinalizeOutcome>, EngineError> {
        if market.is_finalized {
            return Ok(Some(self.stored_outcome(market).await?));
        }

        let address = contract_address(market)?;
        if self.gateway.is_finalized(address).await? {
            // Finalized on-chain but not mirrored: a previous run died
            // between submission and the ledger write. Reconcile now.
            let (winner, final_price, target_price) = self.read_outcome(address).await?;
            self.store
                .mark_finalized(market.id, winner, final_price)
                .await?;
            info!(market_id = market.id, %winner, "mirror reconciled from chain state");
            return Ok(Some(FinalizeOutcome {
                market_id: market.id,
                tx_hash: None,
                winner,
                final_price,
                target_price,
                already_finalized: true,
            }));
        }
        Ok(None)
    }

    async fn stored_outcome(&self, market: &Market) -> Result<FinalizeOutcome, EngineError> {
        // A finalized row always carries its outcome fields; fall back to
        // the contract if an old row predates them.
        let (winner, final_price) = match (market.winner_direction, market.final_price) {
            (Some(winner), Some(price)) => (winner, price),
            _ => {
                let address = contract_address(market)?;
                let (winner, final_price, _) = self.read_outcome(address).await?;
                (winner, final_price)
            }
        };
        Ok(FinalizeOutcome {
            market_id: market.id,
            tx_hash: None,
            winner,
            final_price,
            target_price: market.target_price,
            already_finalized: true,
        })
    }

    async fn read_outcome(
        &self,
        address: Address,
    ) -> Result<(Direction, Decimal, Decimal), EngineError> {
        let final_price = i256_to_decimal(self.gateway.latest_price(address).await?)?;
        let target_price = u256_to_decimal(self.gateway.target_price(address).await?)?;
        Ok((
            Direction::winner_for(final_price, target_price),
            final_price,
            target_price,
        ))
    }

    async fn submit_finalize(
        &self,
        market: &Market,
        nonce: u64,
    ) -> Result<FinalizeOutcome, EngineError> {
        let address = contract_address(market)?;
        let outcome = self.gateway.finalize(address, nonce).await?;
        if !outcome.is_confirmed() {
            return Err(EngineError::TransactionReverted {
                tx_hash: outcome.tx_hash,
            });
        }

        let (winner, final_price, target_price) = self.read_outcome(address).await?;
        let wrote = self
            .store
            .mark_finalized(market.id, winner, final_price)
            .await?;
        if !wrote {
            // A concurrent run mirrored first; the chain outcome is the
            // same either way.
            warn!(market_id = market.id, "mirror already finalized by another writer");
        }
        info!(
            market_id = market.id,
            tx_hash = ?outcome.tx_hash,
            %winner,
            %final_price,
            "market finalized"
        );
        Ok(FinalizeOutcome {
            market_id: market.id,
            tx_hash: Some(outcome.tx_hash),
            winner,
            final_price,
            target_price,
            already_finalized: false,
        })
    }
}

fn contract_address(market: &Market) -> Result<Address, EngineError> {
    market.contract_address.parse().map_err(|_| {
        EngineError::InvalidParameters(format!(
            "bad market contract address: {}",
            market.contract_address
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ethers::types::{I256, U256};

    use crate::blockchain::types::{TxOutcome, TxStatus};
    use crate::db::InMemoryMarketStore;

    struct FakeGateway {
        pending_nonce: u64,
        finalized: Mutex<HashSet<Address>>,
        reverts: HashSet<Address>,
        lost_receipts: HashSet<Address>,
        prices: HashMap<Address, (I256, U256)>,
        calls: Mutex<Vec<(Address, u64)>>,
    }

    impl FakeGateway {
        fn new(pending_nonce: u64) -> Self {
            Self {
                pending_nonce,
                finalized: Mutex::new(HashSet::new()),
                reverts: HashSet::new(),
                lost_receipts: HashSet::new(),
                prices: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_prices(mut self, address: Address, latest: i64, target: u64) -> Self {
            self.prices
                .insert(address, (I256::from(latest), U256::from(target)));
            self
        }

        fn reverting(mut self, address: Address) -> Self {
            self.reverts.insert(address);
            self
        }

        /// Broadcast succeeds but the receipt poll fails, as a node outage
        /// between submission and confirmation would.
        fn losing_receipt(mut self, address: Address) -> Self {
            self.lost_receipts.insert(address);
            self
        }

        fn finalize_calls(&self) -> Vec<(Address, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MarketGateway for FakeGateway {
        async fn admin_pending_nonce(&self) -> Result<u64, EngineError> {
            Ok(self.pending_nonce)
        }

        async fn is_finalized(&self, market: Address) -> Result<bool, EngineError> {
            Ok(self.finalized.lock().unwrap().contains(&market))
        }

        async fn finalize(
            &self,
            market: Address,
            nonce: u64,
        ) -> Result<TxOutcome, EngineError> {
            self.calls.lock().unwrap().push((market, nonce));
            if self.lost_receipts.contains(&market) {
                return Err(EngineError::SubmittedUnconfirmed {
                    tx_hash: H256::repeat_byte(0xcc),
                    waited_secs: 120,
                });
            }
            if self.reverts.contains(&market) {
                // Mined with status 0: the nonce is still consumed.
                return Ok(TxOutcome {
                    tx_hash: H256::repeat_byte(0xee),
                    status: TxStatus::Failed,
                    block_number: Some(5),
                    gas_used: None,
                });
            }
            self.finalized.lock().unwrap().insert(market);
            Ok(TxOutcome {
                tx_hash: H256::repeat_byte(0x01),
                status: TxStatus::Confirmed,
                block_number: Some(5),
                gas_used: None,
            })
        }

        async fn latest_price(&self, market: Address) -> Result<I256, EngineError> {
            Ok(self.prices[&market].0)
        }

        async fn target_price(&self, market: Address) -> Result<U256, EngineError> {
            Ok(self.prices[&market].1)
        }
    }

    fn address(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn due_market(id: i64, contract: Address) -> Market {
        Market {
            id,
            title: format!("market {}", id),
            asset_type: "BTC/USD".into(),
            contract_address: format!("{:?}", contract),
            oracle_address: format!("{:?}", address(0xfe)),
            settlement_time: Utc::now().timestamp() - 60,
            target_price: Decimal::from(5_000u64),
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
    async fn test_finalize_one_settles_and_mirrors() {
        let contract = address(0x0a);
        let gateway = Arc::new(FakeGateway::new(7).with_prices(contract, 5_100, 5_000));
        let store = Arc::new(InMemoryMarketStore::default());
        store.seed_market(due_market(1, contract));
        let orchestrator = SettlementOrchestrator::new(gateway.clone(), store.clone());

        let outcome = orchestrator.finalize_one(1).await.unwrap();
        assert!(!outcome.already_finalized);
        assert!(outcome.tx_hash.is_some());
        assert_eq!(outcome.winner, Direction::Above);
        assert_eq!(outcome.final_price, Decimal::from(5_100u64));
        assert_eq!(gateway.finalize_calls(), vec![(contract, 7)]);

        let market = store.market(1).await.unwrap().unwrap();
        assert!(market.is_finalized);
        assert_eq!(market.winner_direction, Some(Direction::Above));
    }

    #[tokio::test]
    async fn test_finalize_one_is_idempotent() {
        let contract = address(0x0a);
        let gateway = Arc::new(FakeGateway::new(0).with_prices(contract, 4_900, 5_000));
        let store = Arc::new(InMemoryMarketStore::default());
        store.seed_market(due_market(1, contract));
        let orchestrator = SettlementOrchestrator::new(gateway.clone(), store.clone());

        let first = orchestrator.finalize_one(1).await.unwrap();
        assert_eq!(first.winner, Direction::Below);

        let second = orchestrator.finalize_one(1).await.unwrap();
        assert!(second.already_finalized);
        assert!(second.tx_hash.is_none());
        assert_eq!(second.winner, Direction::Below);
        // Only the first call submitted a transaction
        assert_eq!(gateway.finalize_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_chain_finalized_reconciles_mirror_without_submitting() {
        let contract = address(0x0b);
        let gateway = Arc::new(FakeGateway::new(0).with_prices(contract, 5_200, 5_000));
        gateway.finalized.lock().unwrap().insert(contract);
        let store = Arc::new(InMemoryMarketStore::default());
        store.seed_market(due_market(2, contract));
        let orchestrator = SettlementOrchestrator::new(gateway.clone(), store.clone());

        let outcome = orchestrator.finalize_one(2).await.unwrap();
        assert!(outcome.already_finalized);
        assert!(outcome.tx_hash.is_none());
        assert!(gateway.finalize_calls().is_empty());

        let market = store.market(2).await.unwrap().unwrap();
        assert!(market.is_finalized);
        assert_eq!(market.winner_direction, Some(Direction::Above));
        assert_eq!(market.final_price, Some(Decimal::from(5_200u64)));
    }

    #[tokio::test]
    async fn test_batch_isolates_failures_and_sequences_nonces() {
        let (c1, c2, c3) = (address(0x01), address(0x02), address(0x03));
        let gateway = Arc::new(
            FakeGateway::new(10)
                .with_prices(c1, 5_100, 5_000)
                .with_prices(c2, 5_100, 5_000)
                .with_prices(c3, 4_900, 5_000)
                .reverting(c2),
        );
        let store = Arc::new(InMemoryMarketStore::default());
        store.seed_market(due_market(1, c1));
        store.seed_market(due_market(2, c2));
        store.seed_market(due_market(3, c3));
        let orchestrator = SettlementOrchestrator::new(gateway.clone(), store.clone());

        let report = orchestrator.finalize_batch(&[1, 2, 3]).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded + report.failed, report.total);
        assert!(matches!(
            report.items[1].result,
            Err(EngineError::TransactionReverted { .. })
        ));

        // The reverted submission still consumed nonce 11
        assert_eq!(
            gateway.finalize_calls(),
            vec![(c1, 10), (c2, 11), (c3, 12)]
        );
        assert!(store.market(1).await.unwrap().unwrap().is_finalized);
        assert!(!store.market(2).await.unwrap().unwrap().is_finalized);
        assert!(store.market(3).await.unwrap().unwrap().is_finalized);
    }

    #[tokio::test]
    async fn test_batch_advances_nonce_after_unconfirmed_submission() {
        let (c1, c2) = (address(0x01), address(0x02));
        let gateway = Arc::new(
            FakeGateway::new(10)
                .with_prices(c1, 5_100, 5_000)
                .with_prices(c2, 5_100, 5_000)
                .losing_receipt(c1),
        );
        let store = Arc::new(InMemoryMarketStore::default());
        store.seed_market(due_market(1, c1));
        store.seed_market(due_market(2, c2));
        let orchestrator = SettlementOrchestrator::new(gateway.clone(), store.clone());

        let report = orchestrator.finalize_batch(&[1, 2]).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(matches!(
            report.items[0].result,
            Err(EngineError::SubmittedUnconfirmed { .. })
        ));

        // Market 1's broadcast consumed nonce 10 even though its receipt
        // never arrived; market 2 must not reuse it.
        assert_eq!(gateway.finalize_calls(), vec![(c1, 10), (c2, 11)]);
        assert!(store.market(2).await.unwrap().unwrap().is_finalized);
    }

    #[tokio::test]
    async fn test_batch_skips_nonce_for_noop_items() {
        let (c1, c2) = (address(0x01), address(0x02));
        let gateway = Arc::new(
            FakeGateway::new(3)
                .with_prices(c1, 5_100, 5_000)
                .with_prices(c2, 5_100, 5_000),
        );
        // c1 already finalized on-chain: reconcile only, no transaction
        gateway.finalized.lock().unwrap().insert(c1);
        let store = Arc::new(InMemoryMarketStore::default());
        store.seed_market(due_market(1, c1));
        store.seed_market(due_market(2, c2));
        let orchestrator = SettlementOrchestrator::new(gateway.clone(), store.clone());

        let report = orchestrator.finalize_batch(&[1, 2]).await.unwrap();
        assert_eq!(report.succeeded, 2);
        // The no-op item left nonce 3 for the real submission
        assert_eq!(gateway.finalize_calls(), vec![(c2, 3)]);
    }

    #[tokio::test]
    async fn test_batch_missing_market_fails_only_that_item() {
        let c1 = address(0x01);
        let gateway = Arc::new(FakeGateway::new(0).with_prices(c1, 5_100, 5_000));
        let store = Arc::new(InMemoryMarketStore::default());
        store.seed_market(due_market(1, c1));
        let orchestrator = SettlementOrchestrator::new(gateway.clone(), store.clone());

        let report = orchestrator.finalize_batch(&[99, 1]).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(matches!(
            report.items[0].result,
            Err(EngineError::MarketNotFound(99))
        ));
        assert_eq!(gateway.finalize_calls(), vec![(c1, 0)]);
    }

    #[tokio::test]
    async fn test_not_due_market_is_rejected() {
        let c1 = address(0x01);
        let gateway = Arc::new(FakeGateway::new(0).with_prices(c1, 5_100, 5_000));
        let store = Arc::new(InMemoryMarketStore::default());
        let mut market = due_market(1, c1);
        market.settlement_time = Utc::now().timestamp() + 3_600;
        store.seed_market(market);
        let orchestrator = SettlementOrchestrator::new(gateway.clone(), store);

        let result = orchestrator.finalize_one(1).await;
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));
        assert!(gateway.finalize_calls().is_empty());
    }

    #[tokio::test]
    async fn test_list_finalizable_delegates_to_store() {
        let gateway = Arc::new(FakeGateway::new(0));
        let store = Arc::new(InMemoryMarketStore::default());
        let mut early = due_market(1, address(0x01));
        early.settlement_time = 1_000;
        let mut late = due_market(2, address(0x02));
        late.settlement_time = 2_000;
        store.seed_market(late);
        store.seed_market(early);
        let orchestrator = SettlementOrchestrator::new(gateway, store);

        let due = orchestrator.list_finalizable(5_000).await.unwrap();
        assert_eq!(due.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
    }
}
