pub mod message;
pub mod session;
pub mod ws;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::core::shutdown::Shutdown;
use crate::core::{Outlier, OutlierKind, Severity};
use crate::error::HubError;
use message::HubMessage;

pub type SubscriberId = u64;

/// Per-subscriber delivery filter. An empty set places no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub severities: HashSet<Severity>,
    #[serde(default, alias = "methods")]
    pub types: HashSet<OutlierKind>,
}

impl SubscriptionFilter {
    pub fn matches(&self, outlier: &Outlier) -> bool {
        (self.severities.is_empty() || self.severities.contains(&outlier.severity))
            && (self.types.is_empty() || self.types.contains(&outlier.kind))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    pub command_capacity: usize,
    pub subscriber_queue: usize,
}

impl From<&HubConfig> for HubSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            command_capacity: config.command_capacity,
            subscriber_queue: config.subscriber_queue,
        }
    }
}

/// A registered subscriber's end of its outbound queue.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<Arc<str>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub filter: SubscriptionFilter,
    pub connected_at: DateTime<Utc>,
    /// Messages waiting in the outbound queue.
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub broadcasts: u64,
    pub delivered: u64,
    pub evicted: u64,
}

enum Command {
    Register {
        filter: SubscriptionFilter,
        reply: oneshot::Sender<Subscription>,
    },
    Unregister {
        id: SubscriberId,
    },
    UpdateFilter {
        id: SubscriberId,
        filter: SubscriptionFilter,
    },
    Broadcast {
        outlier: Outlier,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Lookup {
        id: SubscriberId,
        reply: oneshot::Sender<Option<SubscriberInfo>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown,
}

/// Cloneable front door to the hub loop. Every call is a message to that loop.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl HubHandle {
    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn register(&self, filter: SubscriptionFilter) -> Result<Subscription, HubError> {
        self.ask(|reply| Command::Register { filter, reply }).await
    }

    pub async fn unregister(&self, id: SubscriberId) -> Result<(), HubError> {
        self.send(Command::Unregister { id }).await
    }

    pub async fn update_filter(
        &self,
        id: SubscriberId,
        filter: SubscriptionFilter,
    ) -> Result<(), HubError> {
        self.send(Command::UpdateFilter { id, filter }).await
    }

    /// Queue an outlier for fan-out without waiting. A full command queue drops it.
    pub fn broadcast(&self, outlier: Outlier) -> Result<(), HubError> {
        match self.commands.try_send(Command::Broadcast { outlier }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(Command::Broadcast { outlier })) => {
                warn!(id = %outlier.id, "Hub command queue full, dropping outlier");
                Err(HubError::Full)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(HubError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HubError::Closed),
        }
    }

    pub async fn subscriber_count(&self) -> Result<usize, HubError> {
        self.ask(|reply| Command::Count { reply }).await
    }

    pub async fn subscriber(&self, id: SubscriberId) -> Result<Option<SubscriberInfo>, HubError> {
        self.ask(|reply| Command::Lookup { id, reply }).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.ask(|reply| Command::Stats { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Arc<str>>,
    connected_at: DateTime<Utc>,
}

/// Sole owner of the subscriber registry.
struct Hub {
    commands: mpsc::Receiver<Command>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    next_id: SubscriberId,
    queue_capacity: usize,
    stats: HubStats,
}

/// Start the hub loop. It exits on `Shutdown`, on the shared signal, or once every handle is gone.
pub fn spawn(settings: HubSettings, shutdown: Shutdown) -> (HubHandle, JoinHandle<HubStats>) {
    let (tx, rx) = mpsc::channel(settings.command_capacity);
    let hub = Hub {
        commands: rx,
        subscribers: HashMap::new(),
        next_id: 1,
        queue_capacity: settings.subscriber_queue,
        stats: HubStats::default(),
    };
    let task = tokio::spawn(hub.run(shutdown));
    (HubHandle { commands: tx }, task)
}

impl Hub {
    async fn run(mut self, shutdown: Shutdown) -> HubStats {
        info!(queue = self.queue_capacity, "Broadcast hub started");
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => command,
            };
            match command {
                None | Some(Command::Shutdown) => break,
                Some(command) => self.handle(command),
            }
        }

        // Stop accepting commands before tearing down so nothing is sent afterwards.
        self.commands.close();
        let closed = self.subscribers.len();
        self.subscribers.clear();
        self.stats.subscribers = 0;
        info!(
            closed,
            delivered = self.stats.delivered,
            evicted = self.stats.evicted,
            "Broadcast hub stopped"
        );
        self.stats
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { filter, reply } => self.register(filter, reply),
            Command::Unregister { id } => {
                if self.subscribers.remove(&id).is_some() {
                    debug!(subscriber = id, remaining = self.subscribers.len(), "Subscriber unregistered");
                }
            }
            Command::UpdateFilter { id, filter } => self.update_filter(id, filter),
            Command::Broadcast { outlier } => self.broadcast(&outlier),
            Command::Count { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
            Command::Lookup { id, reply } => {
                let info = self.subscribers.get(&id).map(|sub| SubscriberInfo {
                    id,
                    filter: sub.filter.clone(),
                    connected_at: sub.connected_at,
                    queued: self.queue_capacity - sub.tx.capacity(),
                });
                let _ = reply.send(info);
            }
            Command::Stats { reply } => {
                let mut stats = self.stats;
                stats.subscribers = self.subscribers.len();
                let _ = reply.send(stats);
            }
            Command::Shutdown => {}
        }
    }

    fn register(&mut self, filter: SubscriptionFilter, reply: oneshot::Sender<Subscription>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers.insert(
            id,
            Subscriber {
                filter,
                tx,
                connected_at: Utc::now(),
            },
        );
        if !self.push(id, HubMessage::connected(id)) {
            return;
        }
        if reply.send(Subscription { id, rx }).is_err() {
            self.subscribers.remove(&id);
            return;
        }
        info!(subscriber = id, total = self.subscribers.len(), "Subscriber registered");
    }

    fn update_filter(&mut self, id: SubscriberId, filter: SubscriptionFilter) {
        let Some(sub) = self.subscribers.get_mut(&id) else {
            debug!(subscriber = id, "Filter update for unknown subscriber");
            return;
        };
        sub.filter = filter;
        match HubMessage::subscribed(&sub.filter) {
            Ok(ack) => {
                self.push(id, ack);
            }
            Err(e) => warn!(subscriber = id, "Failed to encode subscription ack: {e}"),
        }
    }

    /// Send one message to one subscriber, evicting it if its queue is full.
    fn push(&mut self, id: SubscriberId, message: HubMessage) -> bool {
        let text: Arc<str> = match message.encode() {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(subscriber = id, "Failed to encode {} message: {e}", message.kind);
                return true;
            }
        };
        let Some(sub) = self.subscribers.get(&id) else {
            return false;
        };
        match sub.tx.try_send(text) {
            Ok(()) => true,
            Err(e) => {
                self.evict(id, matches!(e, mpsc::error::TrySendError::Full(_)));
                false
            }
        }
    }

    fn broadcast(&mut self, outlier: &Outlier) {
        self.stats.broadcasts += 1;
        let text: Arc<str> = match HubMessage::outlier(outlier).and_then(|m| m.encode()) {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(id = %outlier.id, "Failed to encode outlier: {e}");
                return;
            }
        };

        let mut failed = Vec::new();
        for (&id, sub) in &self.subscribers {
            if !sub.filter.matches(outlier) {
                continue;
            }
            match sub.tx.try_send(text.clone()) {
                Ok(()) => self.stats.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => failed.push((id, true)),
                Err(mpsc::error::TrySendError::Closed(_)) => failed.push((id, false)),
            }
        }
        for (id, slow) in failed {
            self.evict(id, slow);
        }
    }

    /// Dropping the sender closes the subscriber's queue, which ends its session.
    fn evict(&mut self, id: SubscriberId, slow: bool) {
        if self.subscribers.remove(&id).is_none() {
            return;
        }
        if slow {
            self.stats.evicted += 1;
            warn!(subscriber = id, "Subscriber queue full, disconnecting slow consumer");
        } else {
            debug!(subscriber = id, "Subscriber queue closed, removing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shutdown;
    use serde_json::Value;

    fn settings(queue: usize) -> HubSettings {
        HubSettings {
            command_capacity: 64,
            subscriber_queue: queue,
        }
    }

    fn filter(severities: &[Severity]) -> SubscriptionFilter {
        SubscriptionFilter {
            severities: severities.iter().copied().collect(),
            types: HashSet::new(),
        }
    }

    fn message_type(text: &str) -> String {
        let value: Value = serde_json::from_str(text).unwrap();
        value["type"].as_str().unwrap().to_string()
    }

    async fn next_type(sub: &mut Subscription) -> String {
        message_type(&sub.rx.recv().await.unwrap())
    }

    #[tokio::test]
    async fn register_sends_connected_ack() {
        let (_trigger, shutdown) = shutdown::channel();
        let (hub, _task) = spawn(settings(8), shutdown);
        let mut sub = hub.register(SubscriptionFilter::default()).await.unwrap();
        assert_eq!(next_type(&mut sub).await, "connected");
        assert_eq!(hub.subscriber_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn filters_by_severity() {
        let (_trigger, shutdown) = shutdown::channel();
        let (hub, _task) = spawn(settings(8), shutdown);
        let mut picky = hub
            .register(filter(&[Severity::High, Severity::Critical]))
            .await
            .unwrap();
        let mut everything = hub.register(SubscriptionFilter::default()).await.unwrap();
        next_type(&mut picky).await;
        next_type(&mut everything).await;

        hub.broadcast(Outlier::new(OutlierKind::ZScore, Severity::Low, "low"))
            .unwrap();
        hub.broadcast(Outlier::new(OutlierKind::ZScore, Severity::Critical, "crit"))
            .unwrap();
        hub.subscriber_count().await.unwrap();

        let received: Value = serde_json::from_str(&picky.rx.recv().await.unwrap()).unwrap();
        assert_eq!(received["data"]["address"], "crit");
        assert!(picky.rx.try_recv().is_err());

        let first: Value = serde_json::from_str(&everything.rx.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&everything.rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["data"]["address"], "low");
        assert_eq!(second["data"]["address"], "crit");
    }

    #[test]
    fn filter_requires_both_constraints() {
        let f = SubscriptionFilter {
            severities: [Severity::High].into_iter().collect(),
            types: [OutlierKind::Iqr].into_iter().collect(),
        };
        assert!(f.matches(&Outlier::new(OutlierKind::Iqr, Severity::High, "a")));
        assert!(!f.matches(&Outlier::new(OutlierKind::ZScore, Severity::High, "a")));
        assert!(!f.matches(&Outlier::new(OutlierKind::Iqr, Severity::Low, "a")));
        assert!(SubscriptionFilter::default().matches(&Outlier::new(
            OutlierKind::Dormant,
            Severity::Low,
            "a"
        )));
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted() {
        let (_trigger, shutdown) = shutdown::channel();
        let (hub, _task) = spawn(settings(2), shutdown);
        let mut slow = hub.register(SubscriptionFilter::default()).await.unwrap();
        let mut fast = hub.register(SubscriptionFilter::default()).await.unwrap();
        next_type(&mut fast).await;

        // slow: connected ack + first outlier fills its queue of two.
        hub.broadcast(Outlier::new(OutlierKind::Iqr, Severity::Low, "one"))
            .unwrap();
        assert_eq!(next_type(&mut fast).await, "outlier");
        hub.broadcast(Outlier::new(OutlierKind::Iqr, Severity::Low, "two"))
            .unwrap();
        assert_eq!(next_type(&mut fast).await, "outlier");

        assert_eq!(hub.subscriber_count().await.unwrap(), 1);
        assert!(hub.subscriber(slow.id).await.unwrap().is_none());
        assert!(hub.subscriber(fast.id).await.unwrap().is_some());
        assert_eq!(hub.stats().await.unwrap().evicted, 1);

        // Queued messages drain, then the queue reports closed.
        assert_eq!(next_type(&mut slow).await, "connected");
        assert_eq!(next_type(&mut slow).await, "outlier");
        assert!(slow.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn update_filter_acknowledges() {
        let (_trigger, shutdown) = shutdown::channel();
        let (hub, _task) = spawn(settings(8), shutdown);
        let mut sub = hub.register(SubscriptionFilter::default()).await.unwrap();
        next_type(&mut sub).await;

        hub.update_filter(sub.id, filter(&[Severity::Critical]))
            .await
            .unwrap();
        assert_eq!(next_type(&mut sub).await, "subscribed");

        let info = hub.subscriber(sub.id).await.unwrap().unwrap();
        assert!(info.filter.severities.contains(&Severity::Critical));
        assert_eq!(info.queued, 0);
    }

    #[tokio::test]
    async fn unregister_removes() {
        let (_trigger, shutdown) = shutdown::channel();
        let (hub, _task) = spawn(settings(8), shutdown);
        let sub = hub.register(SubscriptionFilter::default()).await.unwrap();
        hub.unregister(sub.id).await.unwrap();
        assert_eq!(hub.subscriber_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (_trigger, shutdown) = shutdown::channel();
        let (hub, task) = spawn(settings(8), shutdown);
        let mut sub = hub.register(SubscriptionFilter::default()).await.unwrap();
        hub.shutdown().await;
        let stats = task.await.unwrap();
        assert_eq!(stats.subscribers, 0);

        assert_eq!(next_type(&mut sub).await, "connected");
        assert!(sub.rx.recv().await.is_none());
        assert!(matches!(
            hub.register(SubscriptionFilter::default()).await,
            Err(HubError::Closed)
        ));
        assert!(matches!(
            hub.broadcast(Outlier::new(OutlierKind::Iqr, Severity::Low, "x")),
            Err(HubError::Closed)
        ));
    }

    #[tokio::test]
    async fn shared_signal_stops_hub() {
        let (trigger, shutdown) = shutdown::channel();
        let (hub, task) = spawn(settings(8), shutdown);
        trigger.trigger();
        task.await.unwrap();
        assert!(hub.subscriber_count().await.is_err());
    }
}
