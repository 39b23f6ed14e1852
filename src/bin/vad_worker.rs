// vad-worker - SalesControl VAD/dialogue worker entry point

use anyhow::Result;
use salescontrol::config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("LOG_LEVEL", "info")).init();

    let config = WorkerConfig::from_env()?;
    salescontrol::worker::run(config).await
}
