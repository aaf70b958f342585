use anyhow::Context;
use rover_hub::clock::SystemClock;
use rover_hub::config::Config;
use rover_hub::db::{self, PgRoverStore};
use rover_hub::dispatcher::{self, HubState};
use rover_hub::registry::RoverRegistry;
use rover_hub::store::{MemoryRoverStore, RoverStore};
use rover_hub::{metrics, monitor, persist};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    config.validate()?;

    info!("Starting Rover Hub");
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Offline threshold: {}ms, monitor period: {}ms",
        config.offline_threshold_ms, config.monitor_period_ms
    );

    metrics::init_metrics().context("Failed to register metrics")?;

    let store: Arc<dyn RoverStore> = match &config.database_url {
        Some(url) => {
            info!("Database: {}", url.split('@').last().unwrap_or("***"));
            let pool = db::make_pool(url)
                .await
                .context("Failed to connect to database")?;
            Arc::new(PgRoverStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, rover state will not survive a restart");
            Arc::new(MemoryRoverStore::new())
        }
    };

    // Bounded channel for write-behind persistence
    info!("Channel capacity: {}", config.channel_capacity);
    let (persist_tx, persist_rx) = mpsc::channel(config.channel_capacity);

    let registry = RoverRegistry::new(store.clone(), Arc::new(SystemClock)).with_persistence(persist_tx);
    registry.hydrate().await.context("Failed to load rovers")?;
    let registry = Arc::new(registry);

    let shutdown = CancellationToken::new();

    let persist_handle = tokio::spawn(persist::run_persister(
        persist_rx,
        store,
        config.persist_batch,
        config.persist_wait_ms,
    ));

    let monitor_handle = tokio::spawn(monitor::run_monitor(
        registry.clone(),
        config.monitor(),
        shutdown.clone(),
    ));

    let state = HubState::new(registry.clone(), config.session(), shutdown.clone());
    let app = dispatcher::build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        let result = dispatcher::serve(listener, app, server_shutdown.clone()).await;
        // Bring the rest of the hub down if the server exits on its own
        server_shutdown.cancel();
        result
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {
            error!("HTTP server terminated");
        }
    }
    shutdown.cancel();

    let server_result = server_handle.await;
    match server_result {
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = monitor_handle.await {
        error!("Monitor task failed: {}", e);
    }

    // Dropping the last registry handle closes the persist channel and flushes it
    drop(registry);
    if let Err(e) = persist_handle.await {
        error!("Persister task failed: {}", e);
    }

    info!("Shutting down");
    Ok(())
}
