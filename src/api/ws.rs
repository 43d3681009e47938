// =============================================================================
// WebSocket downstream — broadcast subscriber upgrade
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate `{"type": "initial_data", "data": <cache snapshot>}`.
//   2. A `{"type": "lighter_update", "data": <frame>}` for every upstream
//      event forwarded by the merge layer, for as long as the connection
//      stays healthy.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::broadcast::{next_subscriber_id, Subscriber};
use crate::supervisor::Supervisor;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<Supervisor>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state)).into_response()
}

/// Bridges the hub's synchronous `send` into an async axum sink via an
/// unbounded channel; the connection task owns the actual socket write.
struct ChannelSubscriber {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl Subscriber for ChannelSubscriber {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: &str) -> Result<(), ()> {
        self.tx.send(frame.to_string()).map_err(|_| ())
    }
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<Supervisor>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = next_subscriber_id();

    let initial = json!({"type": "initial_data", "data": state.cache.snapshot()});
    if sender.send(Message::Text(initial.to_string())).await.is_err() {
        warn!("failed to send initial_data frame, dropping connection");
        return;
    }

    state.hub.attach(Arc::new(ChannelSubscriber { id, tx }));

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if sender.send(Message::Text(frame)).await.is_err() {
                            debug!("send failed, disconnecting subscriber");
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(_))) => {
                        // Heartbeats from the client are acknowledged implicitly
                        // by staying connected; no reply is required.
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.detach(id);
    info!(subscriber_id = id, "WebSocket connection closed");
}
