pub mod dedup;
pub mod iqr;
pub mod pattern;
pub mod stats;
pub mod zscore;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::shutdown::Shutdown;
use crate::core::{Outlier, Transaction};
use crate::error::{DetectError, StoreError};
use crate::store::{TransactionStore, with_timeout};
use dedup::deduplicate;
use iqr::IqrDetector;
use pattern::{PatternDetector, PatternSettings};
use zscore::ZScoreDetector;

/// One detection method run against a window snapshot.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn detect(&self, snapshot: &[Transaction]) -> Result<Vec<Outlier>, DetectError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub interval: Duration,
    /// Look-back of the periodic loop.
    pub window: Duration,
    /// Look-back of `detect_once`.
    pub on_demand_window: Duration,
    pub window_limit: usize,
    pub store_timeout: Duration,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        let interval = config.detection.interval();
        let velocity = Duration::from_secs(config.pattern.velocity_window_secs);
        Self {
            interval,
            window: (interval * 2).max(velocity),
            on_demand_window: Duration::from_secs(config.detection.on_demand_window_secs),
            window_limit: config.detection.window_limit,
            store_timeout: config.store.request_timeout(),
        }
    }
}

/// Periodically runs every detector over the latest store window and merges the results.
pub struct DetectionEngine {
    store: Arc<dyn TransactionStore>,
    detectors: Vec<Arc<dyn Detector>>,
    config: EngineConfig,
    state: watch::Sender<EngineState>,
}

impl DetectionEngine {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        detectors: Vec<Arc<dyn Detector>>,
        config: EngineConfig,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Stopped);
        Self {
            store,
            detectors,
            config,
            state,
        }
    }

    /// Engine with the standard detectors in dedup priority order: zscore, iqr, pattern.
    pub fn from_config(config: &Config, store: Arc<dyn TransactionStore>) -> Self {
        let detection = &config.detection;
        let mut detectors: Vec<Arc<dyn Detector>> = vec![
            Arc::new(ZScoreDetector::new(
                detection.zscore_threshold,
                detection.min_data_points,
            )),
            Arc::new(IqrDetector::new(
                detection.iqr_multiplier,
                detection.min_data_points,
            )),
        ];
        if detection.pattern_enabled {
            let mut settings = PatternSettings::from(&config.pattern);
            settings.window_limit = detection.window_limit;
            detectors.push(Arc::new(PatternDetector::new(
                store.clone(),
                settings,
                config.store.request_timeout(),
            )));
        }
        Self::new(store, detectors, EngineConfig::from(config))
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// One on-demand pass over the on-demand window, independent of the periodic loop.
    pub async fn detect_once(&self) -> Result<Vec<Outlier>, StoreError> {
        self.run_cycle(self.config.on_demand_window).await
    }

    async fn run_cycle(&self, window: Duration) -> Result<Vec<Outlier>, StoreError> {
        let end = Utc::now();
        let span = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::days(1));
        let start = end - span;
        let snapshot: Arc<[Transaction]> = with_timeout(
            self.config.store_timeout,
            self.store.query_window(start, end, self.config.window_limit),
        )
        .await?
        .into();

        let candidates = self.run_detectors(snapshot.clone()).await;
        let merged = deduplicate(candidates);
        debug!(
            window = snapshot.len(),
            outliers = merged.len(),
            "Detection cycle complete"
        );
        Ok(merged)
    }

    /// Run detectors concurrently. Results are gathered in registration order.
    async fn run_detectors(&self, snapshot: Arc<[Transaction]>) -> Vec<Outlier> {
        let mut tasks = DetectorTasks(
            self.detectors
                .iter()
                .map(|detector| {
                    let detector = detector.clone();
                    let snapshot = snapshot.clone();
                    let name = detector.name();
                    (
                        name,
                        tokio::spawn(async move { detector.detect(&snapshot).await }),
                    )
                })
                .collect(),
        );

        let mut candidates = Vec::new();
        for (name, handle) in tasks.0.iter_mut() {
            match handle.await {
                Ok(Ok(found)) => {
                    debug!(detector = *name, found = found.len(), "Detector finished");
                    candidates.extend(found);
                }
                Ok(Err(e)) => warn!(detector = *name, "Detector failed, excluded from cycle: {e}"),
                Err(e) => warn!(
                    detector = *name,
                    "Detector failed, excluded from cycle: {}",
                    DetectError::Task(e.to_string())
                ),
            }
        }
        candidates
    }

    /// Periodic loop: one cycle immediately, then one per interval until shutdown.
    pub async fn run(self: Arc<Self>, outliers: mpsc::Sender<Outlier>, shutdown: Shutdown) {
        let started = self.state.send_if_modified(|state| {
            if *state == EngineState::Running {
                false
            } else {
                *state = EngineState::Running;
                true
            }
        });
        if !started {
            warn!("Detection engine already running");
            return;
        }
        info!(
            interval = ?self.config.interval,
            window = ?self.config.window,
            detectors = self.detectors.len(),
            "Detection engine started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.run_cycle(self.config.window) => result,
            };
            match result {
                Ok(found) => {
                    if !publish(&outliers, found) {
                        info!("Outlier channel closed, stopping detection");
                        break;
                    }
                }
                Err(e) => warn!("Detection cycle skipped: {e}"),
            }
        }

        self.state.send_replace(EngineState::Stopped);
        info!("Detection engine stopped");
    }
}

type DetectorResult = Result<Vec<Outlier>, DetectError>;

/// Detector tasks of one cycle. Dropping it aborts whatever is still running.
struct DetectorTasks(Vec<(&'static str, JoinHandle<DetectorResult>)>);

impl Drop for DetectorTasks {
    fn drop(&mut self) {
        for (_, handle) in &self.0 {
            handle.abort();
        }
    }
}

/// Push without blocking; a full channel drops the newest outlier. False once closed.
fn publish(tx: &mpsc::Sender<Outlier>, outliers: Vec<Outlier>) -> bool {
    let total = outliers.len();
    let mut dropped = 0usize;
    for outlier in outliers {
        match tx.try_send(outlier) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(outlier)) => {
                dropped += 1;
                warn!(
                    id = %outlier.id,
                    kind = %outlier.kind,
                    severity = %outlier.severity,
                    "Outlier channel full, dropping newest outlier"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
    if total > 0 {
        info!(published = total - dropped, dropped, "Published outliers");
    }
    true
}
