use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use huddle_broker::config::BrokerConfig;
use huddle_broker::registry::{RegistryConfig, RoomRegistry};
use huddle_broker::server;
use huddle_broker::store::{SnapshotStore, SqliteSnapshotStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BrokerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_filter.clone()))
        .init();

    let store: Option<Arc<dyn SnapshotStore>> = match &config.database_path {
        Some(path) => {
            let store = SqliteSnapshotStore::open(path)
                .with_context(|| format!("failed to open snapshot db at `{}`", path.display()))?;
            info!(path = %path.display(), "snapshot persistence enabled");
            Some(Arc::new(store))
        }
        None => {
            warn!("HUDDLE_BROKER_DATABASE_PATH not set, rooms are in-memory only");
            None
        }
    };

    let registry = Arc::new(RoomRegistry::new(store, RegistryConfig::default()));
    let app = server::router(Arc::clone(&registry));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind broker listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting room broker");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("broker exited unexpectedly")?;

    // Flush whatever the debounce timers were still holding.
    registry.persist_all().await;
    info!("room broker stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
