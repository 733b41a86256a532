//! DialFi Airdrop Server
//!
//! Mines, converts and sells DiFi/Dpower against a capped supply pool

use std::sync::Arc;

use dialfi_airdrop::{AirdropStorage, Config, NowPaymentsClient, PaymentService};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting DialFi Airdrop Server");

    let config = Config::load()?;

    let db_path = config.database_path();
    let storage = Arc::new(AirdropStorage::new(&db_path, config.token.clone())?);
    info!("SQLite storage initialized at {}", db_path);

    let gateway = Arc::new(NowPaymentsClient::new(config.gateway.base_url.clone()));
    let payments = PaymentService::new(
        storage.clone(),
        gateway,
        config.ipn_secret(),
        config.gateway.callback_url.clone(),
    );

    // Get server binding from environment, falling back to config
    let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port: u16 = std::env::var("SERVER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.server.port);

    dialfi_airdrop::server::run_server(&host, port, storage, payments).await?;

    Ok(())
}
