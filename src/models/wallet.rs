//! Custodial wallet model
//!
//! Maps an application user identity to the threshold-signed key that acts on
//! their behalf. Created once at onboarding, looked up (never mutated) by the
//! transaction signer.

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::EngineError;

/// A user's custodial wallet record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CustodialWallet {
    /// Application user identity the key is bound to.
    pub owner_id: String,
    /// Uncompressed secp256k1 public key, 0x-hex.
    pub public_key: String,
    /// Key identifier within the signing network (token id).
    pub key_id: String,
    /// Address derived from the public key, 0x-hex.
    pub address: String,
}

impl CustodialWallet {
    /// The derived address as an ethers type.
    pub fn eth_address(&self) -> Result<Address, EngineError> {
        self.address
            .parse()
            .map_err(|_| EngineError::InvalidParameters(format!("bad wallet address: {}", self.address)))
    }
}
