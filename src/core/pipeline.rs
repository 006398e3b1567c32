use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::{ConnectionState, Outlier, Severity, Transaction};
use crate::error::HubError;
use crate::hub::{HubHandle, HubStats};
use crate::rpc::ingest::{IngestSnapshot, IngestionHandle};
use crate::store::{TransactionStore, with_timeout};

/// Counters shared by the store writer and the outlier fan-out.
#[derive(Debug, Default)]
pub struct PipelineStats {
    written: AtomicU64,
    write_failed: AtomicU64,
    broadcast: AtomicU64,
    broadcast_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub written: u64,
    pub write_failed: u64,
    pub broadcast: u64,
    pub broadcast_dropped: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            written: self.written.load(Ordering::Relaxed),
            write_failed: self.write_failed.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
            broadcast_dropped: self.broadcast_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Forward every ingested transaction to the store. Runs until ingestion closes its channel.
pub async fn run_store_writer(
    mut rx: mpsc::Receiver<Transaction>,
    store: Arc<dyn TransactionStore>,
    timeout: Duration,
    stats: Arc<PipelineStats>,
) {
    info!("Store writer started");
    while let Some(tx) = rx.recv().await {
        match with_timeout(timeout, store.write_transaction(&tx)).await {
            Ok(()) => {
                let written = stats.written.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(hash = %tx.hash, amount = %tx.amount, "Transaction stored");
                if written % 1000 == 0 {
                    info!("Store writer persisted {written} transactions");
                }
            }
            Err(e) => {
                stats.write_failed.fetch_add(1, Ordering::Relaxed);
                warn!(hash = %tx.hash, "Failed to store transaction: {e}");
            }
        }
    }
    info!(
        written = stats.written.load(Ordering::Relaxed),
        failed = stats.write_failed.load(Ordering::Relaxed),
        "Store writer stopped"
    );
}

/// Hand detected outliers to the hub. Runs until the engine drops its sender or the hub closes.
pub async fn run_fanout(mut rx: mpsc::Receiver<Outlier>, hub: HubHandle, stats: Arc<PipelineStats>) {
    while let Some(outlier) = rx.recv().await {
        if outlier.severity >= Severity::High {
            info!(
                kind = %outlier.kind,
                severity = %outlier.severity,
                address = %outlier.address,
                "Outlier detected"
            );
        }
        match hub.broadcast(outlier) {
            Ok(()) => {
                stats.broadcast.fetch_add(1, Ordering::Relaxed);
            }
            Err(HubError::Closed) => {
                info!("Hub closed, stopping outlier fan-out");
                break;
            }
            Err(_) => {
                stats.broadcast_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    debug!("Outlier fan-out stopped");
}

/// Counters from every stage, gathered for the periodic summary line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsReport {
    pub status: ConnectionState,
    pub feed: IngestSnapshot,
    pub pipeline: PipelineSnapshot,
    /// `None` once the hub has stopped.
    pub hub: Option<HubStats>,
}

impl StatsReport {
    pub async fn gather(ingest: &IngestionHandle, stats: &PipelineStats, hub: &HubHandle) -> Self {
        Self {
            status: ingest.status(),
            feed: ingest.stats(),
            pipeline: stats.snapshot(),
            hub: hub.stats().await.ok(),
        }
    }

    pub fn log(&self) {
        let (feed, pipeline) = (&self.feed, &self.pipeline);
        let hub = self.hub.unwrap_or_default();
        info!(
            status = %self.status,
            received = feed.received,
            emitted = feed.emitted,
            skipped = feed.skipped,
            malformed = feed.malformed,
            invalid = feed.invalid,
            dropped = feed.dropped,
            written = pipeline.written,
            write_failed = pipeline.write_failed,
            outliers = pipeline.broadcast,
            outliers_dropped = pipeline.broadcast_dropped,
            subscribers = hub.subscribers,
            delivered = hub.delivered,
            evicted = hub.evicted,
            "Pipeline stats"
        );
    }
}

/// One summary line across ingestion, storage and the hub.
pub async fn log_stats(ingest: &IngestionHandle, stats: &PipelineStats, hub: &HubHandle) {
    StatsReport::gather(ingest, stats, hub).await.log();
}
