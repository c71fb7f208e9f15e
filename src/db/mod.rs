//! Ledger access: PostgreSQL pool management and the store traits the
//! services program against.

pub mod market_store;
pub mod wallet_directory;

pub use market_store::{InMemoryMarketStore, MarketStore, PgMarketStore};
pub use wallet_directory::{InMemoryWalletDirectory, PgWalletDirectory, WalletDirectory};

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::error::EngineError;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            // Settlement batches and bet recording are short transactions;
            // a small pool with fast acquire failure is enough.
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 300,
        }
    }
}

/// Open the ledger pool and verify connectivity with one round trip.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, EngineError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    info!(
        max_connections = config.max_connections,
        "ledger pool connected"
    );
    Ok(pool)
}
