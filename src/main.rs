//! batch-connector - connection attempt tracker
//!
//! Serves the JSON API over the attempt store.

use batch_connector::config::{ConfigStore, ServerConfig};
use batch_connector::db::Store;
use batch_connector::manager::ConnectionManager;
use batch_connector::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("batch_connector=info".parse()?))
        .init();

    // Load configuration
    let server_cfg = ServerConfig::load();
    let config = Arc::new(ConfigStore::open(&server_cfg.config_path)?);
    tracing::info!("Using config at {}", server_cfg.config_path.display());
    tracing::info!("Using database at {}", server_cfg.db_path.display());

    // Initialize database
    let store = Store::new(&server_cfg.db_path)?;
    tracing::info!("Tracking {} connection attempts", store.count_attempts()?);

    let manager = Arc::new(ConnectionManager::new(config, store));

    // Start web server
    let server = Server::new(manager);
    server.start().await?;

    Ok(())
}
