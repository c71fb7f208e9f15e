//! Settlement worker: periodically finalizes every market whose settlement
//! time has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use polybet_engine::blockchain::{AdminChain, ChainClient};
use polybet_engine::config::AppConfig;
use polybet_engine::db::{self, DatabaseConfig, PgMarketStore};
use polybet_engine::services::SettlementOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polybet_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;
    tracing::info!(
        "Starting settlement worker v{} ({})",
        env!("CARGO_PKG_VERSION"),
        config.environment
    );

    let pool = db::connect(&DatabaseConfig::new(&config.database_url)).await?;
    let store = Arc::new(PgMarketStore::new(pool));

    let chain = Arc::new(
        ChainClient::new(&config.rpc_url, config.chain_id)?.with_timeouts(
            Duration::from_secs(config.rpc_timeout_secs),
            Duration::from_secs(config.receipt_timeout_secs),
        ),
    );
    let signer = chain.admin_middleware(&config.admin_private_key)?;
    let factory_address = config
        .factory_address
        .parse()
        .map_err(|_| anyhow::anyhow!("bad factory address: {}", config.factory_address))?;
    let gateway = Arc::new(AdminChain::new(chain, signer, factory_address));

    let orchestrator = SettlementOrchestrator::new(gateway, store);
    let mut ticker = tokio::time::interval(Duration::from_secs(config.settlement_interval_secs));
    tracing::info!(
        interval_secs = config.settlement_interval_secs,
        batch_size = config.settlement_batch_size,
        "settlement loop running"
    );

    loop {
        ticker.tick().await;
        let due = match orchestrator.list_finalizable(Utc::now().timestamp()).await {
            Ok(markets) => markets,
            Err(e) => {
                tracing::error!("failed to list finalizable markets: {}", e);
                continue;
            }
        };
        if due.is_empty() {
            continue;
        }

        let ids: Vec<i64> = due
            .iter()
            .take(config.settlement_batch_size)
            .map(|m| m.id)
            .collect();
        tracing::info!(count = ids.len(), "settling due markets");
        match orchestrator.finalize_batch(&ids).await {
            Ok(report) => {
                if report.failed > 0 {
                    tracing::warn!(
                        succeeded = report.succeeded,
                        failed = report.failed,
                        "settlement batch finished with failures"
                    );
                }
            }
            Err(e) => tracing::error!("settlement batch aborted: {}", e),
        }
    }
}
