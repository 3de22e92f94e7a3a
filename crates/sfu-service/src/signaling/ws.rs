//! WebSocket signaling endpoint.
//!
//! Each upgraded socket is split in two: a writer task that encodes
//! `ServerFrame`s into text frames, and the read loop that decodes
//! `ClientFrame`s and feeds them to a [`SignalingSession`]. When the socket
//! ends, or the session's connection is cancelled, the session leaves every
//! room it joined and the socket is closed.

use crate::actors::{ActorMetrics, RoomRegistryActorHandle};
use crate::errors::SfuError;

use super::handler::SignalingSession;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderValue, Method};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use signaling_protocol::{decode_client_frame, encode_server_frame, MAX_FRAME_LEN};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// How long to wait for the writer to flush after the read side ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state of the signaling router.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: RoomRegistryActorHandle,
    pub metrics: Arc<ActorMetrics>,
}

/// Build the signaling router, serving WebSocket upgrades on `path`.
///
/// # Errors
///
/// Returns `SfuError::Config` if `client_origin` is not a valid header value.
pub fn signaling_router(
    path: &str,
    state: SignalingState,
    client_origin: &str,
) -> Result<Router, SfuError> {
    let origin = HeaderValue::from_str(client_origin)
        .map_err(|e| SfuError::Config(format!("invalid client origin {client_origin}: {e}")))?;

    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET]);

    Ok(Router::new()
        .route(path, get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    ws.max_message_size(MAX_FRAME_LEN)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let (mut session, mut outbound) = SignalingSession::open(state.registry, state.metrics);
    let peer_id = session.peer_id();
    let (mut sink, mut stream) = socket.split();

    info!(target: "sfu.signaling", peer_id = %peer_id, "Signaling channel connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match encode_server_frame(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        target: "sfu.signaling",
                        peer_id = %peer_id,
                        error = %e,
                        "Dropping unencodable frame"
                    );
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let cancel_token = session.cancel_token();
    loop {
        let message = tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %peer_id,
                    "Connection cancelled, closing socket"
                );
                break;
            }
            message = stream.next() => message,
        };
        let Some(message) = message else {
            break;
        };
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %peer_id,
                    error = %e,
                    "WebSocket read error"
                );
                break;
            }
        };

        match message {
            Message::Text(text) => match decode_client_frame(&text) {
                Ok(frame) => {
                    if let Err(e) = session.handle_frame(frame).await {
                        debug!(
                            target: "sfu.signaling",
                            peer_id = %peer_id,
                            error = %e,
                            "Reply not delivered, closing"
                        );
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        target: "sfu.signaling",
                        peer_id = %peer_id,
                        error = %e,
                        "Malformed client frame ignored"
                    );
                }
            },
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %peer_id,
                    "Binary frame ignored"
                );
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let rooms = session.joined_rooms().len();
    session.close().await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(target: "sfu.signaling", peer_id = %peer_id, "Writer drain timed out");
    }

    info!(
        target: "sfu.signaling",
        peer_id = %peer_id,
        rooms = rooms,
        "Signaling channel disconnected"
    );
}
