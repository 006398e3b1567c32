use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{WebSocketStream, accept_async_with_config};
use tracing::{debug, info, warn};

use super::HubHandle;
use super::session::{MessageSink, MessageStream, PONG_WAIT, run_session};
use crate::core::shutdown::Shutdown;
use crate::error::HubError;

/// Largest frame accepted from a subscriber. Only control messages flow inbound.
const MAX_INBOUND_MESSAGE: usize = 512;

type Socket = WebSocketStream<TcpStream>;

pub struct WsSink(SplitSink<Socket, Message>);

pub struct WsStream(SplitStream<Socket>);

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&mut self, text: &str) -> Result<(), HubError> {
        self.0.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), HubError> {
        self.0.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HubError> {
        self.0.send(Message::Close(None)).await?;
        self.0.close().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStream for WsStream {
    async fn recv_text(&mut self) -> Option<Result<String, HubError>> {
        loop {
            // Any frame, pongs included, resets the read deadline.
            let next = match timeout(PONG_WAIT, self.0.next()).await {
                Ok(next) => next,
                Err(_) => return Some(Err(HubError::Transport("read deadline exceeded".into()))),
            };
            match next? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "Subscriber sent close");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Accept subscriber connections until shutdown, one session task per socket.
pub async fn serve(listener: TcpListener, hub: HubHandle, shutdown: Shutdown) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "Outlier stream listening"),
        Err(e) => warn!("Listener has no local address: {e}"),
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, hub.clone()));
            }
            Err(e) => warn!("Accept failed: {e}"),
        }
    }
    info!("Outlier stream listener stopped");
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, hub: HubHandle) {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_INBOUND_MESSAGE);
    config.max_frame_size = Some(MAX_INBOUND_MESSAGE);

    let socket = match accept_async_with_config(stream, Some(config)).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(%peer, "WebSocket handshake failed: {e}");
            return;
        }
    };
    let (write, read) = socket.split();
    match run_session(hub, WsSink(write), WsStream(read)).await {
        Ok(id) => debug!(%peer, subscriber = id, "Connection closed"),
        Err(e) => warn!(%peer, "Session refused: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shutdown;
    use crate::core::{Outlier, OutlierKind, Severity};
    use crate::hub::{HubSettings, spawn};
    use serde_json::Value;
    use tokio_tungstenite::connect_async;

    async fn next_json<S>(read: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match read.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn loopback_subscriber_receives_outliers() {
        let (trigger, shutdown) = shutdown::channel();
        let (hub, _task) = spawn(
            HubSettings {
                command_capacity: 16,
                subscriber_queue: 16,
            },
            shutdown.clone(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, hub.clone(), shutdown));

        let (socket, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (mut write, mut read) = socket.split();
        assert_eq!(next_json(&mut read).await["type"], "connected");

        write
            .send(Message::Text(
                r#"{"type":"subscribe","data":{"types":["iqr"]}}"#.into(),
            ))
            .await
            .unwrap();
        assert_eq!(next_json(&mut read).await["type"], "subscribed");

        hub.broadcast(Outlier::new(OutlierKind::ZScore, Severity::High, "skip"))
            .unwrap();
        hub.broadcast(Outlier::new(OutlierKind::Iqr, Severity::High, "keep"))
            .unwrap();
        let outlier = next_json(&mut read).await;
        assert_eq!(outlier["type"], "outlier");
        assert_eq!(outlier["data"]["address"], "keep");

        trigger.trigger();
        server.await.unwrap();
    }
}
