//! Custodial wallet lookup.
//!
//! The directory is read-only from the engine's point of view; wallet rows
//! are created by the onboarding flow, outside this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::EngineError;
use crate::models::CustodialWallet;

#[async_trait]
pub trait WalletDirectory: Send + Sync {
    /// The custodial wallet bound to `owner_id`, or `WalletNotFound`.
    async fn wallet_for(&self, owner_id: &str) -> Result<CustodialWallet, EngineError>;
}

pub struct PgWalletDirectory {
    pool: PgPool,
}

impl PgWalletDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WalletDirectory for PgWalletDirectory {
    async fn wallet_for(&self, owner_id: &str) -> Result<CustodialWallet, EngineError> {
        sqlx::query_as::<_, CustodialWallet>(
            "SELECT owner_id, public_key, key_id, address \
             FROM custodial_wallets WHERE owner_id = $1",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::WalletNotFound(owner_id.to_string()))
    }
}

/// In-memory directory for tests.
#[derive(Default)]
pub struct InMemoryWalletDirectory {
    wallets: Mutex<HashMap<String, CustodialWallet>>,
}

impl InMemoryWalletDirectory {
    pub fn insert(&self, wallet: CustodialWallet) {
        self.wallets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(wallet.owner_id.clone(), wallet);
    }
}

#[async_trait]
impl WalletDirectory for InMemoryWalletDirectory {
    async fn wallet_for(&self, owner_id: &str) -> Result<CustodialWallet, EngineError> {
        self.wallets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(owner_id)
            .cloned()
            .ok_or_else(|| EngineError::WalletNotFound(owner_id.to_string()))
    }
}
