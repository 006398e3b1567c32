mod config;
mod core;
mod error;
mod hub;
mod rpc;
mod signals;
mod store;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt, reload};

use crate::config::{Config, StoreBackend};
use crate::core::pipeline::{self, PipelineStats};
use crate::core::shutdown;
use crate::hub::HubSettings;
use crate::rpc::HttpEventFeed;
use crate::rpc::event::TransferParser;
use crate::rpc::ingest::{IngestConfig, IngestionClient};
use crate::signals::DetectionEngine;
use crate::store::graph::GraphStoreClient;
use crate::store::sqlite::SqliteStore;
use crate::store::{TransactionStore, with_timeout};

const DEFAULT_CONFIG_PATH: &str = "tetherwatch.toml";

#[tokio::main]
async fn main() {
    // RUST_LOG wins; otherwise the config's filter replaces this bootstrap one once loaded.
    let env_filter = EnvFilter::try_from_default_env().ok();
    let has_env_filter = env_filter.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new("tetherwatch=info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    tracing::info!("TetherWatch starting...");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match Config::load(&config_path).and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    if !has_env_filter {
        match EnvFilter::try_new(&config.logging.filter) {
            Ok(f) => {
                if let Err(e) = filter_handle.reload(f) {
                    tracing::warn!("Failed to apply log filter: {e}");
                }
            }
            Err(e) => tracing::warn!("Ignoring invalid log filter {:?}: {e}", config.logging.filter),
        }
    }
    tracing::debug!("Config: {:?}", config);

    let store: Arc<dyn TransactionStore> = match build_store(&config) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open transaction store: {e}");
            std::process::exit(1);
        }
    };
    match with_timeout(config.store.request_timeout(), store.health()).await {
        Ok(()) => tracing::info!(backend = ?config.store.backend, "Transaction store healthy"),
        Err(e) => tracing::warn!("Transaction store health check failed: {e}"),
    }

    let feed = match HttpEventFeed::new(&config.feed) {
        Ok(feed) => Arc::new(feed),
        Err(e) => {
            tracing::error!("Failed to build feed client: {e}");
            std::process::exit(1);
        }
    };
    let listener = match TcpListener::bind(&config.hub.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {e}", config.hub.listen_addr);
            std::process::exit(1);
        }
    };

    let (trigger, shutdown) = shutdown::channel();
    let stats = Arc::new(PipelineStats::default());

    // Ingestion → store writer
    let parser = TransferParser::new(&config.feed.event_name, &config.feed.token_contract);
    let client = IngestionClient::new(feed, parser, IngestConfig::from(&config));
    let (ingest, transactions) = client.start(&shutdown);
    let writer = tokio::spawn(pipeline::run_store_writer(
        transactions,
        store.clone(),
        config.store.request_timeout(),
        stats.clone(),
    ));

    // Engine → fan-out → hub → subscribers
    let (hub, hub_task) = hub::spawn(HubSettings::from(&config.hub), shutdown.clone());
    let (outlier_tx, outlier_rx) = mpsc::channel(config.detection.outlier_capacity);
    let engine = Arc::new(DetectionEngine::from_config(&config, store.clone()));
    let engine_task = tokio::spawn(engine.run(outlier_tx, shutdown.clone()));
    let fanout = tokio::spawn(pipeline::run_fanout(outlier_rx, hub.clone(), stats.clone()));
    let server = tokio::spawn(hub::ws::serve(listener, hub.clone(), shutdown.clone()));

    let mut stats_tick = tokio::time::interval(Duration::from_secs(config.pipeline.stats_interval_secs));
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stats_tick.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for ctrl-c: {e}");
                }
                break;
            }
            _ = stats_tick.tick() => pipeline::log_stats(&ingest, &stats, &hub).await,
        }
    }

    tracing::info!("Shutting down...");
    trigger.trigger();
    ingest.close().await;
    for (name, task) in [("store writer", writer), ("fan-out", fanout), ("listener", server)] {
        if let Err(e) = task.await {
            tracing::warn!("{name} task failed: {e}");
        }
    }
    if let Err(e) = engine_task.await {
        tracing::warn!("Detection task failed: {e}");
    }
    match hub_task.await {
        Ok(hub_stats) => tracing::info!(
            delivered = hub_stats.delivered,
            evicted = hub_stats.evicted,
            "Hub closed"
        ),
        Err(e) => tracing::warn!("Hub task failed: {e}"),
    }
    let totals = stats.snapshot();
    tracing::info!(
        written = totals.written,
        write_failed = totals.write_failed,
        outliers = totals.broadcast,
        "TetherWatch stopped"
    );
}

fn build_store(config: &Config) -> Result<Arc<dyn TransactionStore>, error::StoreError> {
    let store: Arc<dyn TransactionStore> = match config.store.backend {
        StoreBackend::Graph => Arc::new(GraphStoreClient::new(
            &config.store.graph_url,
            &config.feed.token_contract,
            config.store.request_timeout(),
        )?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(Path::new(&config.store.sqlite_path))?),
    };
    Ok(store)
}
