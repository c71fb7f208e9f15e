//! Chain-facing types: transaction outcomes, the fixed fee policy and
//! fixed-point conversions between chain integers and ledger decimals.

use ethers::types::{H256, I256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::EngineError;

/// Mined status of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Receipt data for a submitted transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutcome {
    pub tx_hash: H256,
    pub status: TxStatus,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
}

impl TxOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.status == TxStatus::Confirmed
    }
}

/// Latest oracle round, 8-decimal fixed point.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OraclePrice {
    pub price: I256,
    pub updated_at: u64,
}

impl OraclePrice {
    pub fn to_decimal(&self) -> Result<Decimal, EngineError> {
        i256_to_decimal(self.price)
    }
}

/// EIP-1559 fee preset: explicit gas limit and a fixed priority/max fee pair
/// tuned for fast inclusion rather than fee-market tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    pub gas_limit: u64,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
}

fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

impl FeePolicy {
    /// Custodial user transactions (bets, transfers).
    pub fn custodial() -> Self {
        Self {
            gas_limit: 400_000,
            max_priority_fee_per_gas: gwei(800),
            max_fee_per_gas: gwei(1_500),
        }
    }

    /// Admin finalize calls.
    pub fn finalize() -> Self {
        Self {
            gas_limit: 600_000,
            max_priority_fee_per_gas: gwei(600),
            max_fee_per_gas: gwei(1_200),
        }
    }

    /// Factory market creation.
    pub fn create_market() -> Self {
        Self {
            gas_limit: 2_000_000,
            max_priority_fee_per_gas: gwei(500),
            max_fee_per_gas: gwei(1_000),
        }
    }
}

/// Convert an unsigned chain integer to a ledger decimal (base units).
pub fn u256_to_decimal(value: U256) -> Result<Decimal, EngineError> {
    Decimal::from_str(&value.to_string())
        .map_err(|_| EngineError::InvalidParameters(format!("amount out of range: {}", value)))
}

/// Convert a signed chain integer (oracle answer) to a ledger decimal.
pub fn i256_to_decimal(value: I256) -> Result<Decimal, EngineError> {
    Decimal::from_str(&value.to_string())
        .map_err(|_| EngineError::InvalidParameters(format!("price out of range: {}", value)))
}

/// Convert a ledger decimal (whole base units) back to a chain integer.
pub fn decimal_to_u256(value: Decimal) -> Result<U256, EngineError> {
    if value.is_sign_negative() || value.fract() != Decimal::ZERO {
        return Err(EngineError::InvalidParameters(format!(
            "not a base-unit integer: {}",
            value
        )));
    }
    U256::from_dec_str(&value.normalize().to_string())
        .map_err(|_| EngineError::InvalidParameters(format!("amount out of range: {}", value)))
}
