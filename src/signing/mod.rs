//! Threshold signing: session lifecycle, the network client and the
//! custodial transaction signer built on top of them.

pub mod local;
pub mod network;
pub mod session;
pub mod tx_signer;

pub use local::SingleKeySigner;
pub use network::{SigningNetworkClient, SigningNetworkConfig};
pub use session::{Capability, SessionCredential, SignatureShare, ThresholdSigner};
pub use tx_signer::{CustodialTxSigner, SignedTx};
