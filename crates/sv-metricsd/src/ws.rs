//! WebSocket gateway for real-time metrics.
//!
//! Every connection immediately receives the latest snapshot, then a
//! bidirectional loop: bus events stream out as `{type, timestamp, payload}`
//! frames, clients may request snapshots or narrow their subscription to one
//! network, and an idle ping goes out after 30 s without client activity.
//! Broken sockets are detected on the next send and pruned by dropping the
//! session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use sv_types::{MetricsEvent, TopologySnapshot};
use tracing::{debug, info};

use crate::routes::MetricsState;

const IDLE_PING_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket GET /api/metrics/ws -- real-time metrics streaming.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MetricsState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

fn event_frame(event: &MetricsEvent) -> String {
    serde_json::json!({
        "type": event.event_type,
        "timestamp": event.timestamp,
        "payload": event.payload,
    })
    .to_string()
}

fn snapshot_frame(snapshot: &TopologySnapshot) -> String {
    serde_json::json!({
        "type": "full_snapshot",
        "timestamp": snapshot.timestamp,
        "payload": snapshot,
    })
    .to_string()
}

/// Resolve the freshest snapshot for a session: in-memory first, then the
/// stored copy in the KV store.
async fn latest_snapshot(
    state: &MetricsState,
    network_id: Option<&str>,
) -> Option<TopologySnapshot> {
    if let Some(snapshot) = state.aggregator.last_snapshot(network_id) {
        return Some(snapshot);
    }
    state.publisher.load_last_snapshot(network_id).await
}

async fn handle_session(socket: WebSocket, state: Arc<MetricsState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = state.hub.subscribe();
    info!(sessions = state.hub.session_count(), "websocket session opened");

    // Replay the latest snapshot so the client renders immediately.
    if let Some(snapshot) = latest_snapshot(&state, None).await {
        if ws_tx
            .send(Message::Text(snapshot_frame(&snapshot).into()))
            .await
            .is_err()
        {
            return;
        }
    }

    // None = all events; Some(id) = only that network's snapshots.
    let mut subscribed_network: Option<String> = None;
    let mut last_activity = Instant::now();
    let mut ping_tick = tokio::time::interval(IDLE_PING_INTERVAL);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_tick.reset();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else {
                    // Lagged past the broadcast buffer or the hub closed.
                    debug!("session dropped behind the event stream");
                    break;
                };

                if let Some(wanted) = subscribed_network.as_deref() {
                    let event_network = event
                        .payload
                        .get("network_id")
                        .and_then(Value::as_str);
                    if event_network.is_some_and(|id| id != wanted) {
                        continue;
                    }
                }

                if ws_tx
                    .send(Message::Text(event_frame(&event).into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }

            _ = ping_tick.tick() => {
                if last_activity.elapsed() >= IDLE_PING_INTERVAL {
                    let ping = serde_json::json!({"type": "ping"}).to_string();
                    if ws_tx.send(Message::Text(ping.into())).await.is_err() {
                        break;
                    }
                }
            }

            incoming = ws_rx.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(_)) | None => break,
                };
                last_activity = Instant::now();

                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(request) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };

                match request.get("action").and_then(Value::as_str) {
                    Some("request_snapshot") => {
                        let network_id = request
                            .get("network_id")
                            .and_then(Value::as_str);
                        if let Some(snapshot) = latest_snapshot(&state, network_id).await {
                            if ws_tx
                                .send(Message::Text(snapshot_frame(&snapshot).into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Some("subscribe_network") => {
                        if let Some(id) = request.get("network_id").and_then(Value::as_str) {
                            subscribed_network = Some(id.to_string());
                            if let Some(snapshot) = latest_snapshot(&state, Some(id)).await {
                                if ws_tx
                                    .send(Message::Text(snapshot_frame(&snapshot).into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    // Unknown actions are ignored.
                    _ => {}
                }
            }
        }
    }

    info!("websocket session closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
