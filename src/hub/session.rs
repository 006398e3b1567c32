use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

use super::message::ClientMessage;
use super::{HubHandle, SubscriberId, Subscription, SubscriptionFilter};
use crate::error::HubError;

/// Time allowed for a single write to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Time allowed between reads from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Keepalive period. Must be shorter than `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Outbound half of a subscriber connection.
#[async_trait]
pub trait MessageSink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), HubError>;

    async fn ping(&mut self) -> Result<(), HubError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HubError>;
}

/// Inbound half of a subscriber connection.
#[async_trait]
pub trait MessageStream: Send {
    /// Next text frame, or `None` once the peer has gone.
    async fn recv_text(&mut self) -> Option<Result<String, HubError>>;
}

/// Serve one subscriber until either side goes away, then unregister it.
pub async fn run_session<S, R>(hub: HubHandle, sink: S, mut stream: R) -> Result<SubscriberId, HubError>
where
    S: MessageSink + 'static,
    R: MessageStream,
{
    let Subscription { id, rx } = hub.register(SubscriptionFilter::default()).await?;
    let mut pump = tokio::spawn(send_pump(id, sink, rx));
    let mut pump_done = false;

    loop {
        tokio::select! {
            _ = &mut pump => {
                pump_done = true;
                break;
            }
            incoming = stream.recv_text() => match incoming {
                None => break,
                Some(Err(e)) => {
                    debug!(subscriber = id, "Read failed: {e}");
                    break;
                }
                Some(Ok(text)) => handle_client_message(&hub, id, &text).await,
            }
        }
    }

    // Unregistering drops the hub's sender, which lets the pump drain and close.
    let _ = hub.unregister(id).await;
    if !pump_done && timeout(WRITE_WAIT, &mut pump).await.is_err() {
        pump.abort();
    }
    info!(subscriber = id, "Subscriber session ended");
    Ok(id)
}

async fn handle_client_message(hub: &HubHandle, id: SubscriberId, text: &str) {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Subscribe(filter)) => {
            debug!(
                subscriber = id,
                severities = filter.severities.len(),
                types = filter.types.len(),
                "Filter updated"
            );
            if let Err(e) = hub.update_filter(id, filter).await {
                debug!(subscriber = id, "Filter update not delivered: {e}");
            }
        }
        Ok(ClientMessage::Ping | ClientMessage::Pong) => {}
        Err(e) => warn!(subscriber = id, "Ignoring unrecognised message: {e}"),
    }
}

async fn send_pump<S: MessageSink>(id: SubscriberId, mut sink: S, mut rx: mpsc::Receiver<Arc<str>>) {
    let mut keepalive = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let result = tokio::select! {
            next = rx.recv() => match next {
                Some(text) => timeout(WRITE_WAIT, sink.send_text(&text)).await,
                None => {
                    let _ = timeout(WRITE_WAIT, sink.close()).await;
                    return;
                }
            },
            _ = keepalive.tick() => timeout(WRITE_WAIT, sink.ping()).await,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(subscriber = id, "Write failed: {e}");
                return;
            }
            Err(_) => {
                warn!(subscriber = id, "Write timed out, dropping subscriber");
                return;
            }
        }
    }
}
