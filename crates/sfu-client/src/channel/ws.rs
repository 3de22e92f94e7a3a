//! Reconnecting WebSocket signaling channel.
//!
//! A background task owns the socket. It connects, pumps frames both ways
//! until the connection drops, fails every pending request, then retries
//! with exponential backoff capped at the configured maximum delay. Each
//! connection gets a fresh outbound queue, so frames never leak from one
//! connection into the next.

use super::{ack_to_result, wait_until_connected, ChannelEvent, Correlator, SignalingChannel};
use crate::config::ClientConfig;
use crate::errors::ClientError;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use signaling_protocol::{
    decode_server_frame, encode_client_frame, ClientFrame, Notification, Request, Response,
    ServerFrame,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// First reconnect delay; doubles up to `reconnect_max_delay`.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// State shared between the channel handle and its connection task.
#[derive(Debug, Default)]
struct Shared {
    correlator: Correlator,
    /// Outbound queue of the live connection, `None` while disconnected
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Shared {
    fn send(&self, text: String) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }
}

/// Signaling channel over `tokio-tungstenite`.
#[derive(Debug)]
pub struct WsSignalingChannel {
    shared: Arc<Shared>,
    connected: watch::Receiver<bool>,
    cancel_token: CancellationToken,
}

impl WsSignalingChannel {
    /// Start connecting to `config.endpoint()` in the background.
    ///
    /// Returns the channel and the receiver of its [`ChannelEvent`]s.
    #[must_use]
    pub fn spawn(config: &ClientConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let shared = Arc::new(Shared::default());
        let (connected_tx, connected) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let task = ConnectionTask {
            endpoint: config.endpoint(),
            reconnect_max_delay: config.reconnect_max_delay.max(INITIAL_RECONNECT_DELAY),
            shared: Arc::clone(&shared),
            connected: connected_tx,
            events: events_tx,
            cancel_token: cancel_token.clone(),
        };
        tokio::spawn(task.run());

        let channel = Arc::new(Self {
            shared,
            connected,
            cancel_token,
        });
        (channel, events_rx)
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.cancel_token.is_cancelled() {
            return Err(ClientError::ChannelClosed);
        }
        wait_until_connected(self.connected.clone(), timeout).await
    }

    async fn request(&self, request: Request) -> Result<Response, ClientError> {
        // Register before looking up the outbound queue: a disconnect clears
        // the queue before failing pending ids, so no request can slip between.
        let (id, reply) = self.shared.correlator.register();
        let text = match encode_client_frame(&ClientFrame::Request { id, request }) {
            Ok(text) => text,
            Err(e) => {
                self.shared.correlator.cancel(id);
                return Err(e.into());
            }
        };

        if !self.shared.send(text) {
            self.shared.correlator.cancel(id);
            return Err(ClientError::ChannelClosed);
        }

        let ack = reply.await.map_err(|_| ClientError::ChannelClosed)?;
        ack_to_result(ack)
    }

    async fn notify(&self, notification: Notification) -> Result<(), ClientError> {
        let text = encode_client_frame(&ClientFrame::Notify { notification })?;
        if self.shared.send(text) {
            Ok(())
        } else {
            Err(ClientError::ChannelClosed)
        }
    }

    fn close(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct ConnectionTask {
    endpoint: String,
    reconnect_max_delay: Duration,
    shared: Arc<Shared>,
    connected: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    cancel_token: CancellationToken,
}

impl ConnectionTask {
    async fn run(self) {
        let mut delay = INITIAL_RECONNECT_DELAY;

        loop {
            let attempt = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                attempt = connect_async(self.endpoint.as_str()) => attempt,
            };

            match attempt {
                Ok((stream, _)) => {
                    delay = INITIAL_RECONNECT_DELAY;
                    let (tx, rx) = mpsc::unbounded_channel();
                    *self.shared.outbound.lock() = Some(tx);
                    self.connected.send_replace(true);
                    info!(target: "sfu.client", endpoint = %self.endpoint, "Signaling connected");
                    let _ = self.events.send(ChannelEvent::Connected);

                    let reason = self.pump(stream, rx).await;

                    *self.shared.outbound.lock() = None;
                    self.connected.send_replace(false);
                    let failed = self.shared.correlator.fail_all();
                    info!(
                        target: "sfu.client",
                        endpoint = %self.endpoint,
                        reason = %reason,
                        failed_requests = failed,
                        "Signaling disconnected"
                    );
                    let _ = self.events.send(ChannelEvent::Disconnected { reason });
                }
                Err(e) => {
                    debug!(
                        target: "sfu.client",
                        endpoint = %self.endpoint,
                        error = %e,
                        retry_in_ms = delay.as_millis(),
                        "Signaling connect failed"
                    );
                }
            }

            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.reconnect_max_delay);
        }

        debug!(target: "sfu.client", endpoint = %self.endpoint, "Signaling channel closed");
    }

    /// Pump frames until the connection ends. Returns the reason.
    async fn pump(&self, stream: WsStream, mut outbound: mpsc::UnboundedReceiver<String>) -> String {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    let _ = sink.close().await;
                    return "closed by client".to_string();
                }
                Some(text) = outbound.recv() => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        return e.to_string();
                    }
                }
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(_))) => return "closed by server".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return e.to_string(),
                    None => return "stream ended".to_string(),
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match decode_server_frame(text) {
            Ok(ServerFrame::Ack { id, ack }) => {
                if !self.shared.correlator.resolve(id, ack) {
                    debug!(target: "sfu.client", id = id, "Ack for unknown request");
                }
            }
            Ok(ServerFrame::Push { seq, event }) => {
                let _ = self.events.send(ChannelEvent::Push { seq, event });
            }
            Err(e) => {
                warn!(target: "sfu.client", error = %e, "Malformed server frame ignored");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_fail_while_disconnected() {
        // Nothing listens on port 9 of localhost
        let config = ClientConfig::new("ABC")
            .unwrap()
            .with_url("ws://127.0.0.1:9");
        let (channel, _events) = WsSignalingChannel::spawn(&config);

        assert!(!channel.is_connected());
        let err = channel
            .request(Request::Join(signaling_protocol::JoinRequest {
                room_code: config.room_code.clone(),
                display_name: String::new(),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ChannelClosed));
        assert_eq!(channel.shared.correlator.pending(), 0);

        let err = channel
            .wait_connected(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectTimeout(_)));

        channel.close();
        let err = channel
            .wait_connected(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ChannelClosed));
    }
}
