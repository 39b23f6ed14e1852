// ingestd - SalesControl ingest service entry point

use anyhow::Result;
use salescontrol::config::IngestConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("LOG_LEVEL", "info")).init();

    let config = IngestConfig::from_env()?;
    salescontrol::ingest::run(config).await
}
