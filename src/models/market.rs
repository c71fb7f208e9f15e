//! Market model and odds math
//!
//! A market is the off-chain mirror of one deployed betting contract: it is
//! created when the factory mints the contract, accumulates bet aggregates
//! while open, and is finalized exactly once with the oracle outcome.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Bet direction: will the oracle price finish above or below the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "bet_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Above => "above",
            Direction::Below => "below",
        }
    }

    /// The winning side once the oracle price is locked in.
    ///
    /// Both prices are 8-decimal fixed-point base units. `final >= target`
    /// settles above.
    pub fn winner_for(final_price: Decimal, target_price: Decimal) -> Direction {
        if final_price >= target_price {
            Direction::Above
        } else {
            Direction::Below
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "above" => Ok(Direction::Above),
            "below" => Ok(Direction::Below),
            _ => Err(format!("invalid direction: {}", s)),
        }
    }
}

/// Lifecycle state derived from the mirror row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketState {
    /// Settlement time in the future, accepting bets.
    Open,
    /// Settlement time elapsed, on-chain finalize not yet confirmed.
    Finalizable,
    /// Terminal: outcome fields set.
    Finalized,
}

/// Off-chain mirror of one on-chain betting market.
///
/// All monetary fields are base-unit integers: bet amounts in wei, prices in
/// 8-decimal fixed point as the oracle reports them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Market {
    pub id: i64,
    pub title: String,
    pub asset_type: String,
    /// Deployed per-market contract address (0x-hex).
    pub contract_address: String,
    /// Price feed consumed read-only at finalization (0x-hex).
    pub oracle_address: String,
    /// Unix timestamp after which the market may be finalized.
    pub settlement_time: i64,
    /// 8-decimal fixed-point target.
    pub target_price: Decimal,
    pub is_finalized: bool,
    pub winner_direction: Option<Direction>,
    /// 8-decimal fixed-point oracle snapshot, set at finalization.
    pub final_price: Option<Decimal>,
    pub participant_count: i32,
    pub yes_count: i32,
    pub no_count: i32,
    /// Wei staked on above.
    pub yes_amount: Decimal,
    /// Wei staked on below.
    pub no_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Market {
    pub fn state(&self, now: i64) -> MarketState {
        if self.is_finalized {
            MarketState::Finalized
        } else if self.settlement_time <= now {
            MarketState::Finalizable
        } else {
            MarketState::Open
        }
    }

    pub fn odds(&self) -> OddsBoard {
        OddsBoard::from_amounts(self.yes_amount, self.no_amount)
    }
}

/// Parimutuel odds derived from the running totals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OddsBoard {
    /// Payout multiplier for a winning above bet, 2-dp.
    pub yes_odds: Decimal,
    /// Payout multiplier for a winning below bet, 2-dp.
    pub no_odds: Decimal,
    pub total_amount: Decimal,
}

impl OddsBoard {
    /// `odds = total / side`; an empty side quotes even money.
    pub fn from_amounts(yes_amount: Decimal, no_amount: Decimal) -> Self {
        let total = yes_amount + no_amount;
        let yes_odds = if yes_amount > Decimal::ZERO {
            (total / yes_amount).round_dp(2)
        } else {
            Decimal::ONE
        };
        let no_odds = if no_amount > Decimal::ZERO {
            (total / no_amount).round_dp(2)
        } else {
            Decimal::ONE
        };
        Self {
            yes_odds,
            no_odds,
            total_amount: total,
        }
    }

    /// Net profit for a winning bet of `amount` on `direction`.
    pub fn profit(&self, direction: Direction, amount: Decimal) -> Decimal {
        let odds = match direction {
            Direction::Above => self.yes_odds,
            Direction::Below => self.no_odds,
        };
        (amount * odds - amount).round_dp(2)
    }
}

/// Parameters for creating a market, validated before any chain interaction.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMarket {
    pub title: String,
    pub asset_type: String,
    pub settlement_time: i64,
    /// 8-decimal fixed-point target.
    pub target_price: Decimal,
    pub oracle_address: String,
}
