//! HTTP client for the distributed threshold signing network.
//!
//! Connection lifecycle: handshake with the coordinator, cache the cluster
//! handle, and re-handshake when the cluster reports itself below quorum or a
//! transport error suggests the handle went stale. Authorization signs a
//! challenge with the admin wallet and exchanges it for a session token.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::signing::session::{
    SessionCache, SessionCredential, SignatureShare, ThresholdSigner,
};

#[derive(Debug, Clone, Deserialize)]
pub struct SigningNetworkConfig {
    pub endpoint: String,
    pub network: String,
    #[serde(default = "default_session_validity_mins")]
    pub session_validity_mins: i64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_session_validity_mins() -> i64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy)]
struct ClusterHandle {
    node_count: u32,
    min_quorum: u32,
    connected_at: DateTime<Utc>,
}

impl ClusterHandle {
    fn is_ready(&self) -> bool {
        self.node_count >= self.min_quorum
            && Utc::now() - self.connected_at < Duration::minutes(30)
    }
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    node_count: u32,
    min_quorum: u32,
}

#[derive(Debug, Serialize)]
struct AuthMethod {
    auth_method_type: u32,
    access_token: String,
}

#[derive(Debug, Serialize)]
struct SessionRequest {
    network: String,
    auth_methods: Vec<AuthMethod>,
    resource: String,
    ability: String,
    expiration: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    session_token: &'a str,
    public_key: &'a str,
    to_sign: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    r: String,
    s: String,
    recovery_id: u8,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for the signing coordinator. Safe to share behind an `Arc`.
pub struct SigningNetworkClient {
    http: reqwest::Client,
    config: SigningNetworkConfig,
    admin_wallet: LocalWallet,
    handle: RwLock<Option<ClusterHandle>>,
    sessions: SessionCache,
}

impl SigningNetworkClient {
    pub fn new(
        config: SigningNetworkConfig,
        admin_wallet: LocalWallet,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Network(e.to_string()))?;
        Ok(Self {
            http,
            config,
            admin_wallet,
            handle: RwLock::new(None),
            sessions: SessionCache::default(),
        })
    }

    async fn handshake(&self) -> Result<ClusterHandle, EngineError> {
        let url = format!("{}/web/handshake", self.config.endpoint);
        let response: HandshakeResponse = self
            .http
            .get(&url)
            .query(&[("network", self.config.network.as_str())])
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("handshake: {}", e)))?
            .error_for_status()
            .map_err(|e| EngineError::Network(format!("handshake: {}", e)))?
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("handshake body: {}", e)))?;

        let handle = ClusterHandle {
            node_count: response.node_count,
            min_quorum: response.min_quorum,
            connected_at: Utc::now(),
        };
        if !handle.is_ready() {
            return Err(EngineError::SigningUnavailable(format!(
                "cluster below quorum: {} of {} nodes",
                handle.node_count, handle.min_quorum
            )));
        }
        info!(
            network = %self.config.network,
            nodes = handle.node_count,
            quorum = handle.min_quorum,
            "signing network connected"
        );
        Ok(handle)
    }

    /// Reuse the cached handle when it still looks healthy, otherwise
    /// re-handshake.
    async fn ensure_connected(&self) -> Result<(), EngineError> {
        if let Some(handle) = *self.handle.read().await {
            if handle.is_ready() {
                return Ok(());
            }
        }
        // Handshake outside the lock; concurrent reconnects both write a
        // fresh handle, which is harmless.
        let handle = self.handshake().await?;
        *self.handle.write().await = Some(handle);
        Ok(())
    }

    async fn mark_stale(&self) {
        *self.handle.write().await = None;
    }

    /// Sign the admin challenge and package it as a wallet auth method.
    async fn admin_auth_method(&self, admin_id: &str) -> Result<AuthMethod, EngineError> {
        let message = format!(
            "{} requests signing-action execution on {} at {}",
            admin_id,
            self.config.network,
            Utc::now().to_rfc3339()
        );
        let signature = self
            .admin_wallet
            .sign_message(message.as_bytes())
            .await
            .map_err(|e| EngineError::SigningUnavailable(format!("challenge sign: {}", e)))?;
        let access_token = serde_json::json!({
            "sig": format!("0x{}", hex::encode(signature.to_vec())),
            "derivedVia": "web3.eth.personal.sign",
            "signedMessage": message,
            "address": format!("{:?}", self.admin_wallet.address()),
        })
        .to_string();
        Ok(AuthMethod {
            auth_method_type: 1,
            access_token,
        })
    }
}

#[async_trait]
impl ThresholdSigner for SigningNetworkClient {
    async fn authorize(&self, admin_id: &str) -> Result<SessionCredential, EngineError> {
        if let Some(credential) = self.sessions.get_live(admin_id).await {
            return Ok(credential);
        }
        self.ensure_connected().await?;

        let request = SessionRequest {
            network: self.config.network.clone(),
            auth_methods: vec![self.admin_auth_method(admin_id).await?],
            resource: "*".into(),
            ability: "execute-signing-action".into(),
            expiration: Utc::now() + Duration::minutes(self.config.session_validity_mins),
        };
        let url = format!("{}/session/sign", self.config.endpoint);
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                EngineError::Network(format!("session request: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .json::<ErrorBody>()
                .await
                .map(|b| b.error)
                .unwrap_or_else(|_| status.to_string());
            self.mark_stale().await;
            return Err(EngineError::SigningUnavailable(format!(
                "session denied: {}",
                body
            )));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("session body: {}", e)))?;
        let credential =
            SessionCredential::with_expiry(session.session_token, session.expires_at);
        self.sessions.put(admin_id, credential.clone()).await;
        Ok(credential)
    }

    async fn co_sign(
        &self,
        credential: &SessionCredential,
        public_key: &str,
        digest: H256,
    ) -> Result<SignatureShare, EngineError> {
        credential.ensure_live()?;
        self.ensure_connected().await?;

        let url = format!("{}/action/execute", self.config.endpoint);
        let request = SignRequest {
            session_token: &credential.token,
            public_key,
            to_sign: format!("0x{}", hex::encode(digest.as_bytes())),
        };
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                // Transport failures often mean the cluster view is stale.
                EngineError::Network(format!("signing request: {}", e))
            });
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.mark_stale().await;
                return Err(e);
            }
        };

        match response.status() {
            status if status.is_success() => {
                let body: SignResponse = response
                    .json()
                    .await
                    .map_err(|e| EngineError::Network(format!("signature body: {}", e)))?;
                Ok(SignatureShare {
                    r: parse_u256(&body.r)?,
                    s: parse_u256(&body.s)?,
                    recovery_id: body.recovery_id,
                })
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(EngineError::SessionExpired),
            status => {
                let body = response
                    .json::<ErrorBody>()
                    .await
                    .map(|b| b.error)
                    .unwrap_or_else(|_| status.to_string());
                warn!(%status, error = %body, "signing action rejected");
                Err(EngineError::SigningUnavailable(body))
            }
        }
    }
}

fn parse_u256(hex_str: &str) -> Result<U256, EngineError> {
    U256::from_str_radix(hex_str.trim_start_matches("0x"), 16)
        .map_err(|_| EngineError::SigningUnavailable(format!("bad signature field: {}", hex_str)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u256_accepts_prefixed_hex() {
        assert_eq!(parse_u256("0x1f").unwrap(), U256::from(31));
        assert_eq!(parse_u256("1f").unwrap(), U256::from(31));
        assert!(parse_u256("0xzz").is_err());
    }

    #[test]
    fn test_cluster_handle_quorum() {
        let handle = ClusterHandle {
            node_count: 2,
            min_quorum: 3,
            connected_at: Utc::now(),
        };
        assert!(!handle.is_ready());

        let ready = ClusterHandle {
            node_count: 3,
            min_quorum: 3,
            connected_at: Utc::now(),
        };
        assert!(ready.is_ready());
    }

    #[test]
    fn test_cluster_handle_goes_stale() {
        let handle = ClusterHandle {
            node_count: 10,
            min_quorum: 3,
            connected_at: Utc::now() - Duration::hours(1),
        };
        assert!(!handle.is_ready());
    }
}
