use anyhow::Result;
use replybot::config::Config;
use replybot::pipeline::Pipeline;
use replybot::storage::SqliteStorage;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,replybot=debug")),
        )
        .init();

    // Saved values from .env; real env vars take precedence
    Config::load_env_file();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(Path::new(&config_path))?;

    let storage = Arc::new(SqliteStorage::open(Path::new(&config.storage.path))?);

    let pipeline = Pipeline::start(&config, storage).await?;

    tokio::signal::ctrl_c().await?;
    pipeline.shutdown().await;
    Ok(())
}
