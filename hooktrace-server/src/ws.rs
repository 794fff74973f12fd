//! WebSocket handling
//!
//! One connection = one broadcaster subscription. The client steers interest
//! with `subscribe`/`unsubscribe`/`subscribeAll` control messages; until the
//! first one arrives it receives everything (default open). The server pushes
//! a `connected` envelope on upgrade and a `trace` envelope per delta, and
//! probes idle connections with pings; a connection that misses a probe
//! window is dropped and its channel released.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hooktrace_core::broadcast::SubscriberId;
use hooktrace_core::types::TraceUpdate;

use crate::AppState;

/// Liveness probe interval; a connection gets one full interval to answer.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Subscription control messages from the client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { session_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { session_id: String },
    SubscribeAll,
}

/// Envelopes pushed to the client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerMessage {
    Connected,
    Trace { update: TraceUpdate },
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sub_id, mut updates) = state.broadcaster.subscribe();
    info!(subscriber = sub_id, "WebSocket connected");

    if send_json(&mut ws_tx, &ServerMessage::Connected).await.is_err() {
        state.broadcaster.unsubscribe(sub_id);
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; treat it as the initial probe
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Some(update) => {
                        if send_json(&mut ws_tx, &ServerMessage::Trace { update }).await.is_err() {
                            debug!(subscriber = sub_id, "Send failed, client disconnected");
                            break;
                        }
                    }
                    // The broadcaster dropped us (too slow); close the transport
                    None => {
                        debug!(subscriber = sub_id, "Subscription closed by broadcaster");
                        break;
                    }
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, sub_id, &state);
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(subscriber = sub_id, "Client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(subscriber = sub_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    warn!(subscriber = sub_id, "Liveness probe unanswered, dropping");
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }

    state.broadcaster.unsubscribe(sub_id);
    info!(subscriber = sub_id, "WebSocket closed");
}

/// Serialize and send one envelope.
async fn send_json(
    ws_tx: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => ws_tx.send(Message::Text(json)).await,
        Err(e) => {
            warn!(error = %e, "Failed to serialize server message");
            Ok(())
        }
    }
}

/// Apply one subscription control message.
fn handle_client_message(text: &str, sub_id: SubscriberId, state: &Arc<AppState>) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(subscriber = sub_id, error = %e, "Unparseable client message");
            return;
        }
    };

    match msg {
        ClientMessage::Subscribe { session_id } => {
            debug!(subscriber = sub_id, session_id = %session_id, "Subscribe");
            state.broadcaster.subscribe_run(sub_id, &session_id);
        }
        ClientMessage::Unsubscribe { session_id } => {
            debug!(subscriber = sub_id, session_id = %session_id, "Unsubscribe");
            state.broadcaster.unsubscribe_run(sub_id, &session_id);
        }
        ClientMessage::SubscribeAll => {
            debug!(subscriber = sub_id, "Subscribe all");
            state.broadcaster.subscribe_all(sub_id);
        }
    }
}
