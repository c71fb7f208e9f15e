//! In-memory signer backed by plain local keys.
//!
//! Same capability surface as the network client, so everything above the
//! [`ThresholdSigner`] seam can be exercised without a signing network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::H256;
use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::signing::session::{
    SessionCredential, SignatureShare, ThresholdSigner,
};

/// Single-party stand-in for the distributed signer. Keys are registered by
/// their uncompressed public key, matching the directory records.
pub struct SingleKeySigner {
    keys: RwLock<HashMap<String, LocalWallet>>,
    validity: Duration,
    issued: AtomicU64,
}

impl SingleKeySigner {
    pub fn new() -> Self {
        Self::with_validity(SessionCredential::validity())
    }

    /// Shortened validity windows let expiry paths run without waiting.
    pub fn with_validity(validity: Duration) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            validity,
            issued: AtomicU64::new(0),
        }
    }

    /// Register a key and return its 0x-hex uncompressed public key.
    pub async fn register(&self, wallet: LocalWallet) -> String {
        let point = wallet.signer().verifying_key().to_encoded_point(false);
        let public_key = format!("0x{}", hex::encode(point.as_bytes()));
        self.keys
            .write()
            .await
            .insert(public_key.to_lowercase(), wallet);
        public_key
    }
}

impl Default for SingleKeySigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThresholdSigner for SingleKeySigner {
    async fn authorize(&self, admin_id: &str) -> Result<SessionCredential, EngineError> {
        let serial = self.issued.fetch_add(1, Ordering::Relaxed);
        Ok(SessionCredential::with_expiry(
            format!("local-{}-{}", admin_id, serial),
            Utc::now() + self.validity,
        ))
    }

    async fn co_sign(
        &self,
        credential: &SessionCredential,
        public_key: &str,
        digest: H256,
    ) -> Result<SignatureShare, EngineError> {
        credential.ensure_live()?;
        let keys = self.keys.read().await;
        let wallet = keys
            .get(&public_key.to_lowercase())
            .ok_or_else(|| EngineError::SigningUnavailable("unregistered public key".into()))?;
        let signature = wallet
            .sign_hash(digest)
            .map_err(|e| EngineError::SigningUnavailable(e.to_string()))?;
        Ok(SignatureShare {
            r: signature.r,
            s: signature.s,
            recovery_id: (signature.v - 27) as u8,
        })
    }
}
