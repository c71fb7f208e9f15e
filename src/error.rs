//! Engine error taxonomy
//!
//! Every failure the engine can surface is a variant here, classified at the
//! point it is raised (RPC rejections in the chain client, signing failures in
//! the session layer, validation failures before any side effect). Callers
//! match exhaustively instead of inspecting message text.

use ethers::types::{Address, H256};

/// Closed error enumeration for the signing and settlement engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No custodial wallet is registered for the owner identity.
    #[error("no custodial wallet registered for owner: {0}")]
    WalletNotFound(String),

    /// The signing network could not reach quorum or is unreachable.
    #[error("signing network unavailable: {0}")]
    SigningUnavailable(String),

    /// The session credential's validity window has elapsed.
    #[error("session credential expired")]
    SessionExpired,

    /// A concurrent submission for the same sending address raced this one.
    #[error("nonce {nonce} for {owner:?} already consumed by a concurrent submission")]
    NonceConflict { owner: Address, nonce: u64 },

    /// The node rejected the transaction because the sender cannot cover
    /// value + gas.
    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,

    /// The node rejected the transaction as underpriced for the current
    /// fee market.
    #[error("transaction underpriced for current fee market")]
    Underpriced,

    /// The transaction was mined but its execution reverted.
    #[error("transaction reverted on-chain: {tx_hash:?}")]
    TransactionReverted { tx_hash: H256 },

    /// The transaction was broadcast but no receipt arrived within the
    /// waiting ceiling. Not a failure: the caller must reconcile later.
    #[error("transaction submitted but unconfirmed after {waited_secs}s: {tx_hash:?}")]
    SubmittedUnconfirmed { tx_hash: H256, waited_secs: u64 },

    /// RPC or signing-network transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// The market is already finalized. Benign: orchestration treats this as
    /// success-as-noop.
    #[error("market {0} is already finalized")]
    AlreadyFinalized(i64),

    /// No market row exists for the id.
    #[error("market not found: {0}")]
    MarketNotFound(i64),

    /// Malformed request-level input, rejected before any chain interaction.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Ledger access failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// Whether the failure happened after broadcast, meaning a transaction
    /// may exist on-chain and blind resubmission is unsafe.
    pub fn is_post_broadcast(&self) -> bool {
        matches!(
            self,
            EngineError::TransactionReverted { .. } | EngineError::SubmittedUnconfirmed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_broadcast_classification() {
        let reverted = EngineError::TransactionReverted {
            tx_hash: H256::zero(),
        };
        assert!(reverted.is_post_broadcast());

        let unconfirmed = EngineError::SubmittedUnconfirmed {
            tx_hash: H256::zero(),
            waited_secs: 120,
        };
        assert!(unconfirmed.is_post_broadcast());

        assert!(!EngineError::SessionExpired.is_post_broadcast());
        assert!(!EngineError::InvalidParameters("bad".into()).is_post_broadcast());
    }

    #[test]
    fn test_display_messages() {
        let e = EngineError::WalletNotFound("google:123".into());
        assert!(e.to_string().contains("google:123"));

        let e = EngineError::MarketNotFound(42);
        assert_eq!(e.to_string(), "market not found: 42");
    }
}
