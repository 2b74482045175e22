//! WebSocket gateway end-to-end: a real axum server, a real client socket,
//! and events flowing hub -> session -> client frame.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use sv_auth::{TokenAuthenticator, TokenSigner, TokenVerifier};
use sv_kv::MemoryKv;
use sv_metricsd::aggregator::Aggregator;
use sv_metricsd::config::MetricsConfig;
use sv_metricsd::hub::SnapshotHub;
use sv_metricsd::publisher::BusPublisher;
use sv_metricsd::routes::{metrics_router, MetricsState};
use sv_metricsd::upstream::UpstreamClient;
use sv_types::{MetricsEvent, MetricsEventType};
use tokio_tungstenite::tungstenite::Message;

const SECRET: &str = "ws-it-secret";

async fn spawn_gateway() -> (std::net::SocketAddr, SnapshotHub) {
    let config = MetricsConfig {
        jwt_secret: SECRET.into(),
        ..MetricsConfig::default()
    };
    let signer = TokenSigner::new(SECRET, "HS256").unwrap();
    let verifier = Arc::new(TokenVerifier::new(SECRET, "HS256").unwrap());
    let kv = Arc::new(MemoryKv::new());
    let upstream = Arc::new(UpstreamClient::new(&config, &signer).unwrap());

    let hub = SnapshotHub::new();
    let state = Arc::new(MetricsState {
        aggregator: Arc::new(Aggregator::new(upstream, 30)),
        publisher: Arc::new(BusPublisher::new(kv.clone())),
        hub: hub.clone(),
        usage: Arc::new(sv_telemetry::UsageTracker::new(kv)),
        authenticator: TokenAuthenticator::new(verifier),
        config: std::sync::RwLock::new(config),
    });

    let app = metrics_router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hub)
}

#[tokio::test]
async fn bus_events_reach_websocket_clients() {
    let (addr, hub) = spawn_gateway().await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/api/metrics/ws"))
            .await
            .unwrap();

    // Let the session register with the hub before publishing.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    hub.publish(MetricsEvent::new(
        MetricsEventType::HealthUpdate,
        serde_json::json!({"node_id": "n1", "status": "healthy"}),
    ));

    let frame = tokio::time::timeout(std::time::Duration::from_secs(3), socket.next())
        .await
        .expect("no frame before timeout")
        .unwrap()
        .unwrap();
    let text = match frame {
        Message::Text(text) => text.to_string(),
        other => panic!("expected text frame, got {other:?}"),
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "health_update");
    assert_eq!(value["payload"]["node_id"], "n1");

    socket.close(None).await.ok();
}

#[tokio::test]
async fn unknown_client_actions_are_ignored() {
    let (addr, hub) = spawn_gateway().await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/api/metrics/ws"))
            .await
            .unwrap();

    socket
        .send(Message::text(r#"{"action":"make_coffee"}"#))
        .await
        .unwrap();
    socket.send(Message::text("not json at all")).await.unwrap();

    // The session survives both; a bus event still arrives afterwards.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    hub.publish(MetricsEvent::new(
        MetricsEventType::NodeUpdate,
        serde_json::json!({"id": "n2"}),
    ));

    let frame = tokio::time::timeout(std::time::Duration::from_secs(3), socket.next())
        .await
        .expect("no frame before timeout")
        .unwrap()
        .unwrap();
    let text = match frame {
        Message::Text(text) => text.to_string(),
        other => panic!("expected text frame, got {other:?}"),
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "node_update");
}
