use serde::Deserialize;

use crate::signing::network::SigningNetworkConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    pub database_url: String,

    // Blockchain settings
    pub rpc_url: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    pub factory_address: String,

    // Admin key driving factory and finalize transactions, and the signing
    // network authorization challenge
    pub admin_private_key: String,
    #[serde(default = "default_admin_identity")]
    pub admin_identity: String,

    // Signing network settings
    pub signing_network_url: String,
    #[serde(default = "default_signing_network_name")]
    pub signing_network_name: String,
    #[serde(default = "default_session_validity_mins")]
    pub session_validity_mins: i64,

    // RPC timeouts
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,

    // Settlement worker settings
    #[serde(default = "default_settlement_interval")]
    pub settlement_interval_secs: u64,
    #[serde(default = "default_settlement_batch_size")]
    pub settlement_batch_size: usize,
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_chain_id() -> u64 {
    137 // Polygon mainnet
}

fn default_admin_identity() -> String {
    "settlement-admin".to_string()
}

fn default_signing_network_name() -> String {
    "datil-dev".to_string()
}

fn default_session_validity_mins() -> i64 {
    10
}

fn default_rpc_timeout() -> u64 {
    15
}

fn default_receipt_timeout() -> u64 {
    120
}

fn default_settlement_interval() -> u64 {
    60
}

fn default_settlement_batch_size() -> usize {
    20
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }

    pub fn signing_network(&self) -> SigningNetworkConfig {
        SigningNetworkConfig {
            endpoint: self.signing_network_url.clone(),
            network: self.signing_network_name.clone(),
            session_validity_mins: self.session_validity_mins,
            request_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_optional_fields() {
        let json = serde_json::json!({
            "database_url": "postgres://localhost/polybet",
            "rpc_url": "https://polygon-rpc.com",
            "factory_address": "0x1111111111111111111111111111111111111111",
            "admin_private_key": "0xabc",
            "signing_network_url": "https://signing.example.com",
        });
        let config: AppConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.chain_id, 137);
        assert_eq!(config.session_validity_mins, 10);
        assert_eq!(config.settlement_batch_size, 20);
        assert_eq!(config.signing_network().network, "datil-dev");
    }
}
