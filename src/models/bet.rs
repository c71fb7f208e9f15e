//! Bet model
//!
//! One row per confirmed on-chain submission: the transaction hash ties the
//! ledger record to exactly one chain transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::market::Direction;

/// A placed bet, immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Bet {
    pub id: i64,
    pub market_id: i64,
    /// Application-level owner identity (not the wallet address).
    pub owner_id: String,
    pub direction: Direction,
    /// Stake in wei.
    pub amount: Decimal,
    /// Hash of the confirmed placeBet transaction (0x-hex).
    pub transaction_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a confirmed bet.
#[derive(Debug, Clone)]
pub struct NewBet {
    pub market_id: i64,
    pub owner_id: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub transaction_hash: String,
}
