//! Threshold signing session primitives
//!
//! A session credential is a short-lived, single-capability authorization to
//! drive signing for custodial keys. Credentials are deliberately time-boxed
//! (~10 minutes) and scoped to one capability so a leaked admin authorization
//! stays narrow; callers re-authorize instead of holding long-lived tokens.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ethers::types::{Signature, H256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::EngineError;

/// The single capability a session credential can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    ExecuteSigningAction,
}

/// Time-boxed authorization returned by [`ThresholdSigner::authorize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredential {
    pub token: String,
    pub capability: Capability,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionCredential {
    pub fn validity() -> Duration {
        Duration::minutes(10)
    }

    pub fn new(token: String) -> Self {
        let now = Utc::now();
        Self {
            token,
            capability: Capability::ExecuteSigningAction,
            issued_at: now,
            expires_at: now + Self::validity(),
        }
    }

    pub fn with_expiry(token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            token,
            capability: Capability::ExecuteSigningAction,
            issued_at: Utc::now(),
            expires_at,
        }
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Fail `SessionExpired` when the validity window has elapsed; stale
    /// credentials must never produce a signature silently.
    pub fn ensure_live(&self) -> Result<(), EngineError> {
        if self.is_live_at(Utc::now()) {
            Ok(())
        } else {
            Err(EngineError::SessionExpired)
        }
    }
}

/// Combined signature shares for one digest: the network never reconstructs
/// the private key, only this final (r, s, recovery id) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    pub r: U256,
    pub s: U256,
    pub recovery_id: u8,
}

impl SignatureShare {
    /// Assemble an Ethereum signature with v carrying the raw y-parity.
    /// Typed transactions encode v as 0/1, and `Signature::recover`
    /// normalizes those values; the legacy 27-offset form would underflow
    /// ethers' EIP-155 normalization when serializing a typed transaction.
    pub fn to_eth_signature(&self) -> Signature {
        Signature {
            r: self.r,
            s: self.s,
            v: self.recovery_id as u64,
        }
    }
}

/// Capability interface over the distributed signing protocol.
///
/// One production network implementation and one in-memory single-key
/// implementation exist; anything that can co-sign a digest for a registered
/// public key satisfies the engine.
#[async_trait]
pub trait ThresholdSigner: Send + Sync {
    /// Obtain a time-boxed credential scoped to signing-action execution for
    /// the admin identity. Implementations may serve a cached live credential.
    async fn authorize(&self, admin_id: &str) -> Result<SessionCredential, EngineError>;

    /// Co-sign `digest` for the custodial `public_key` (0x-hex uncompressed).
    async fn co_sign(
        &self,
        credential: &SessionCredential,
        public_key: &str,
        digest: H256,
    ) -> Result<SignatureShare, EngineError>;
}

/// Per-identity soft cache of live credentials. A false miss only costs an
/// extra authorization round trip, never an incorrect signature.
pub struct SessionCache {
    inner: RwLock<HashMap<String, SessionCredential>>,
    /// Remaining validity below which a credential is not reused.
    reuse_margin: Duration,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            reuse_margin: Duration::seconds(60),
        }
    }
}

impl SessionCache {
    pub async fn get_live(&self, identity: &str) -> Option<SessionCredential> {
        let cutoff = Utc::now() + self.reuse_margin;
        self.inner
            .read()
            .await
            .get(identity)
            .filter(|c| c.is_live_at(cutoff))
            .cloned()
    }

    pub async fn put(&self, identity: &str, credential: SessionCredential) {
        self.inner
            .write()
            .await
            .insert(identity.to_string(), credential);
    }
}
