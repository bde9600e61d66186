/// One-shot schema bootstrap tool.
/// Usage: cargo run --bin volguard-init-db
///
/// Opens (creating if absent) the SQLite store at the configured `db_path`
/// and applies the schema, so the main binary's first startup doesn't pay
/// that cost under a deploy health-check timeout.
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use volguard::config::loader::load_config;
use volguard::persistence::SqliteStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("loading configuration");
    let config = load_config()?;

    info!(db_path = %config.db_path, "initializing sqlite store");
    match SqliteStore::open(&config.db_path) {
        Ok(_) => {
            info!("schema applied, store ready");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "failed to initialize store");
            Err(e.into())
        }
    }
}
