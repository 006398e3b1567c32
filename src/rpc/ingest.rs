use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::shutdown::{Shutdown, ShutdownTrigger};
use crate::core::tx::validate;
use crate::core::{ConnectionState, Transaction};
use crate::error::FeedError;
use crate::rpc::event::TransferParser;
use crate::rpc::retry::{RetryPolicy, RetrySupervisor};
use crate::rpc::{EventFeed, FeedPage};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub page_limit: usize,
    pub channel_capacity: usize,
    pub retry: RetryPolicy,
}

impl From<&Config> for IngestConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.feed.poll_interval(),
            request_timeout: config.feed.request_timeout(),
            page_limit: config.feed.page_limit,
            channel_capacity: config.feed.channel_capacity,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

#[derive(Debug, Default)]
struct IngestStats {
    received: AtomicU64,
    emitted: AtomicU64,
    skipped: AtomicU64,
    malformed: AtomicU64,
    invalid: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of the ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub received: u64,
    pub emitted: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub invalid: u64,
    pub dropped: u64,
}

impl IngestStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.received.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Polls the feed and turns events into validated transactions.
pub struct IngestionClient {
    feed: Arc<dyn EventFeed>,
    parser: TransferParser,
    config: IngestConfig,
}

/// Handle to a running ingestion task.
pub struct IngestionHandle {
    state: Arc<watch::Sender<ConnectionState>>,
    stats: Arc<IngestStats>,
    stop: ShutdownTrigger,
    task: JoinHandle<()>,
}

impl IngestionClient {
    pub fn new(feed: Arc<dyn EventFeed>, parser: TransferParser, config: IngestConfig) -> Self {
        Self { feed, parser, config }
    }

    /// Spawn the poll loop. Transactions arrive on the returned bounded receiver.
    pub fn start(self, shutdown: &Shutdown) -> (IngestionHandle, mpsc::Receiver<Transaction>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state);
        let stats = Arc::new(IngestStats::default());
        let (stop, stop_signal) = shutdown.child();

        let task = IngestTask {
            supervisor: RetrySupervisor::new(self.config.retry.clone()),
            feed: self.feed,
            parser: self.parser,
            config: self.config,
            state: state.clone(),
            stats: stats.clone(),
            out: tx,
            watermark: 0,
            stop: stop_signal,
        };
        let task = tokio::spawn(task.run());

        (
            IngestionHandle {
                state,
                stats,
                stop,
                task,
            },
            rx,
        )
    }
}

impl IngestionHandle {
    pub fn status(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> IngestSnapshot {
        self.stats.snapshot()
    }

    /// Stop the owned task and force the Disconnected state.
    pub async fn close(mut self) {
        self.stop.trigger();
        if tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .is_err()
        {
            warn!("Ingestion task did not stop in time, aborting");
            self.task.abort();
        }
        let prev = self.state.send_replace(ConnectionState::Disconnected);
        info!(from = %prev, "Ingestion closed");
    }
}

enum Flow {
    Continue,
    Stop,
}

struct IngestTask {
    feed: Arc<dyn EventFeed>,
    parser: TransferParser,
    config: IngestConfig,
    supervisor: RetrySupervisor,
    state: Arc<watch::Sender<ConnectionState>>,
    stats: Arc<IngestStats>,
    out: mpsc::Sender<Transaction>,
    watermark: i64,
    stop: Shutdown,
}

impl IngestTask {
    async fn run(mut self) {
        info!(interval = ?self.config.poll_interval, "Ingestion started");

        let flow = match self.connect().await {
            None => Flow::Stop,
            Some(true) => Flow::Continue,
            Some(false) => self.recover().await,
        };

        if let Flow::Continue = flow {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let polled = self
                    .guarded(self.feed.poll_events(self.watermark, self.config.page_limit))
                    .await;
                let flow = match polled {
                    None => Flow::Stop,
                    Some(Ok(page)) => self.process(page),
                    Some(Err(e)) => {
                        warn!("Feed poll failed: {e}");
                        self.recover().await
                    }
                };
                if let Flow::Stop = flow {
                    break;
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            watermark = self.watermark,
            emitted = stats.emitted,
            dropped = stats.dropped,
            "Ingestion loop stopped"
        );
    }

    /// Run one feed call under the request timeout. `None` means shutdown.
    async fn guarded<T>(
        &self,
        call: impl Future<Output = Result<T, FeedError>>,
    ) -> Option<Result<T, FeedError>> {
        let limit = self.config.request_timeout;
        tokio::select! {
            _ = self.stop.cancelled() => None,
            res = tokio::time::timeout(limit, call) => {
                Some(res.unwrap_or_else(|_| Err(FeedError::Timeout(limit))))
            }
        }
    }

    fn transition(&self, next: ConnectionState) {
        let prev = *self.state.borrow();
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            warn!(from = %prev, to = %next, "Ignoring illegal connection state transition");
            return;
        }
        self.state.send_replace(next);
        match next {
            ConnectionState::Error | ConnectionState::Reconnecting => {
                warn!(from = %prev, to = %next, "Feed connection state changed")
            }
            _ => info!(from = %prev, to = %next, "Feed connection state changed"),
        }
    }

    /// Probe the feed. `None` means shutdown interrupted the attempt.
    async fn connect(&mut self) -> Option<bool> {
        self.transition(ConnectionState::Connecting);
        match self.guarded(self.feed.probe()).await? {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                self.supervisor.reset();
                Some(true)
            }
            Err(e) => {
                warn!(attempt = self.supervisor.attempt(), "Feed connect failed: {e}");
                self.transition(ConnectionState::Error);
                Some(false)
            }
        }
    }

    /// Supervisor loop: back off, reconnect, and sit out open-circuit periods.
    async fn recover(&mut self) -> Flow {
        self.transition(ConnectionState::Reconnecting);
        loop {
            if !self.supervisor.should_retry() {
                self.transition(ConnectionState::Error);
                warn!(
                    remaining = ?self.supervisor.circuit_remaining(),
                    "Circuit open, suspending reconnect attempts"
                );
                if self.supervisor.wait_circuit(&self.stop).await.is_err() {
                    return Flow::Stop;
                }
                continue;
            }
            if self.supervisor.wait(&self.stop).await.is_err() {
                return Flow::Stop;
            }
            match self.connect().await {
                None => return Flow::Stop,
                Some(true) => return Flow::Continue,
                // Error is reserved for open-circuit periods.
                Some(false) => self.transition(ConnectionState::Reconnecting),
            }
        }
    }

    fn process(&mut self, page: FeedPage) -> Flow {
        let stats = &self.stats;
        if page.undecodable > 0 {
            stats
                .malformed
                .fetch_add(page.undecodable as u64, Ordering::Relaxed);
        }

        let since = self.watermark;
        let mut newest = since;
        let mut flow = Flow::Continue;

        for event in page.events {
            IngestStats::bump(&stats.received);
            if event.block_timestamp <= since {
                IngestStats::bump(&stats.skipped);
                debug!(tx = %event.transaction_id, "Skipping redelivered event");
                continue;
            }
            newest = newest.max(event.block_timestamp);

            let tx = match self.parser.parse(&event) {
                Ok(tx) => tx,
                Err(e) if e.is_skip() => {
                    IngestStats::bump(&stats.skipped);
                    debug!(tx = %event.transaction_id, "Skipping event: {e}");
                    continue;
                }
                Err(e) => {
                    IngestStats::bump(&stats.malformed);
                    warn!(tx = %event.transaction_id, "Skipping malformed event: {e}");
                    continue;
                }
            };

            if let Err(e) = validate(&tx) {
                IngestStats::bump(&stats.invalid);
                warn!(tx = %tx.hash, "Dropping invalid transaction: {e}");
                continue;
            }

            match self.out.try_send(tx) {
                Ok(()) => IngestStats::bump(&stats.emitted),
                Err(mpsc::error::TrySendError::Full(tx)) => {
                    IngestStats::bump(&stats.dropped);
                    warn!(tx = %tx.hash, "Transaction channel full, dropping newest transaction");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!("Transaction channel closed, stopping ingestion");
                    flow = Flow::Stop;
                    break;
                }
            }
        }

        self.watermark = newest;
        flow
    }
}
