//! Market and bet persistence.
//!
//! The mirror rows are advisory for reads; the chain stays authoritative for
//! finalization. `mark_finalized` is write-once at the SQL level so the
//! outcome fields can never be overwritten by a late or duplicate settlement.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::error::EngineError;
use crate::models::{Bet, Direction, Market, NewBet, NewMarket};

#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn market(&self, id: i64) -> Result<Option<Market>, EngineError>;

    /// Markets still accepting or awaiting settlement, newest first.
    async fn active_markets(&self) -> Result<Vec<Market>, EngineError>;

    /// Unfinalized markets whose settlement time has elapsed, oldest
    /// settlement first so the longest-overdue markets settle first.
    async fn finalizable(&self, now: i64) -> Result<Vec<Market>, EngineError>;

    /// Insert the mirror row for a freshly deployed market contract.
    async fn insert_market(
        &self,
        market: &NewMarket,
        contract_address: &str,
    ) -> Result<i64, EngineError>;

    /// Record a confirmed bet and bump the market aggregates atomically.
    async fn record_bet(&self, bet: &NewBet) -> Result<i64, EngineError>;

    /// Set the outcome fields. Returns `false` when the market was already
    /// finalized and nothing was written.
    async fn mark_finalized(
        &self,
        id: i64,
        winner: Direction,
        final_price: Decimal,
    ) -> Result<bool, EngineError>;
}

/// PostgreSQL-backed store.
pub struct PgMarketStore {
    pool: PgPool,
}

impl PgMarketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const MARKET_COLUMNS: &str = "id, title, asset_type, contract_address, oracle_address, \
     settlement_time, target_price, is_finalized, winner_direction, final_price, \
     participant_count, yes_count, no_count, yes_amount, no_amount, created_at";

#[async_trait]
impl MarketStore for PgMarketStore {
    async fn market(&self, id: i64) -> Result<Option<Market>, EngineError> {
        let market = sqlx::query_as::<_, Market>(&format!(
            "SELECT {} FROM markets WHERE id = $1",
            MARKET_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(market)
    }

    async fn active_markets(&self) -> Result<Vec<Market>, EngineError> {
        let markets = sqlx::query_as::<_, Market>(&format!(
            "SELECT {} FROM markets WHERE is_finalized = FALSE ORDER BY created_at DESC",
            MARKET_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(markets)
    }

    async fn finalizable(&self, now: i64) -> Result<Vec<Market>, EngineError> {
        let markets = sqlx::query_as::<_, Market>(&format!(
            "SELECT {} FROM markets \
             WHERE is_finalized = FALSE AND settlement_time <= $1 \
             ORDER BY settlement_time ASC",
            MARKET_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(markets)
    }

    async fn insert_market(
        &self,
        market: &NewMarket,
        contract_address: &str,
    ) -> Result<i64, EngineError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO markets \
             (title, asset_type, contract_address, oracle_address, settlement_time, target_price) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&market.title)
        .bind(&market.asset_type)
        .bind(contract_address)
        .bind(&market.oracle_address)
        .bind(market.settlement_time)
        .bind(market.target_price)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn record_bet(&self, bet: &NewBet) -> Result<i64, EngineError> {
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO bets (market_id, owner_id, direction, amount, transaction_hash) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(bet.market_id)
        .bind(&bet.owner_id)
        .bind(bet.direction)
        .bind(bet.amount)
        .bind(&bet.transaction_hash)
        .fetch_one(&mut *tx)
        .await?;

        let (yes_delta, no_delta, yes_count, no_count) = match bet.direction {
            Direction::Above => (bet.amount, Decimal::ZERO, 1i32, 0i32),
            Direction::Below => (Decimal::ZERO, bet.amount, 0i32, 1i32),
        };
        sqlx::query(
            "UPDATE markets SET \
               yes_amount = yes_amount + $2, \
               no_amount = no_amount + $3, \
               yes_count = yes_count + $4, \
               no_count = no_count + $5, \
               participant_count = participant_count + 1 \
             WHERE id = $1",
        )
        .bind(bet.market_id)
        .bind(yes_delta)
        .bind(no_delta)
        .bind(yes_count)
        .bind(no_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn mark_finalized(
        &self,
        id: i64,
        winner: Direction,
        final_price: Decimal,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "UPDATE markets SET \
               is_finalized = TRUE, winner_direction = $2, final_price = $3 \
             WHERE id = $1 AND is_finalized = FALSE",
        )
        .bind(id)
        .bind(winner)
        .bind(final_price)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// In-memory store for exercising orchestration without PostgreSQL.
#[derive(Default)]
pub struct InMemoryMarketStore {
    inner: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    markets: HashMap<i64, Market>,
    bets: Vec<Bet>,
    next_market_id: i64,
    next_bet_id: i64,
}

impl InMemoryMarketStore {
    /// Seed a fully formed market row, as tests need fine-grained control.
    pub fn seed_market(&self, market: Market) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.next_market_id = state.next_market_id.max(market.id);
        state.markets.insert(market.id, market);
    }

    pub fn bets(&self) -> Vec<Bet> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bets
            .clone()
    }
}

#[async_trait]
impl MarketStore for InMemoryMarketStore {
    async fn market(&self, id: i64) -> Result<Option<Market>, EngineError> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.markets.get(&id).cloned())
    }

    async fn active_markets(&self) -> Result<Vec<Market>, EngineError> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut markets: Vec<Market> = state
            .markets
            .values()
            .filter(|m| !m.is_finalized)
            .cloned()
            .collect();
        markets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(markets)
    }

    async fn finalizable(&self, now: i64) -> Result<Vec<Market>, EngineError> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut markets: Vec<Market> = state
            .markets
            .values()
            .filter(|m| !m.is_finalized && m.settlement_time <= now)
            .cloned()
            .collect();
        markets.sort_by_key(|m| m.settlement_time);
        Ok(markets)
    }

    async fn insert_market(
        &self,
        market: &NewMarket,
        contract_address: &str,
    ) -> Result<i64, EngineError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.next_market_id += 1;
        let id = state.next_market_id;
        state.markets.insert(
            id,
            Market {
                id,
                title: market.title.clone(),
                asset_type: market.asset_type.clone(),
                contract_address: contract_address.to_string(),
                oracle_address: market.oracle_address.clone(),
                settlement_time: market.settlement_time,
                target_price: market.target_price,
                is_finalized: false,
                winner_direction: None,
                final_price: None,
                participant_count: 0,
                yes_count: 0,
                no_count: 0,
                yes_amount: Decimal::ZERO,
                no_amount: Decimal::ZERO,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn record_bet(&self, bet: &NewBet) -> Result<i64, EngineError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.next_bet_id += 1;
        let id = state.next_bet_id;
        let market = state
            .markets
            .get_mut(&bet.market_id)
            .ok_or(EngineError::MarketNotFound(bet.market_id))?;
        match bet.direction {
            Direction::Above => {
                market.yes_amount += bet.amount;
                market.yes_count += 1;
            }
            Direction::Below => {
                market.no_amount += bet.amount;
                market.no_count += 1;
            }
        }
        market.participant_count += 1;
        state.bets.push(Bet {
            id,
            market_id: bet.market_id,
            owner_id: bet.owner_id.clone(),
            direction: bet.direction,
            amount: bet.amount,
            transaction_hash: bet.transaction_hash.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn mark_finalized(
        &self,
        id: i64,
        winner: Direction,
        final_price: Decimal,
    ) -> Result<bool, EngineError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let market = state
            .markets
            .get_mut(&id)
            .ok_or(EngineError::MarketNotFound(id))?;
        if market.is_finalized {
            return Ok(false);
        }
        market.is_finalized = true;
        market.winner_direction = Some(winner);
        market.final_price = Some(final_price);
        Ok(true)
    }
}
