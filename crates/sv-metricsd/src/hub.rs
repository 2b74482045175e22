use std::sync::Arc;

use sv_kv::Kv;
use sv_types::events::{CHANNEL_HEALTH, CHANNEL_SPEED_TEST, CHANNEL_TOPOLOGY};
use sv_types::MetricsEvent;
use tokio::sync::broadcast;
use tracing::{info, warn};

use sv_telemetry::ShutdownSignal;

// ---------------------------------------------------------------------------
// SnapshotHub
// ---------------------------------------------------------------------------

/// In-process fan-out of bus events to WebSocket sessions.
///
/// One background task holds the KV subscription for the metrics channels
/// and re-broadcasts parsed events; each WebSocket session subscribes here
/// instead of opening its own bus connection. Slow sessions that lag behind
/// the broadcast buffer miss events rather than stalling the hub.
#[derive(Clone)]
pub struct SnapshotHub {
    tx: broadcast::Sender<Arc<MetricsEvent>>,
}

impl SnapshotHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Register a new session; the receiver sees every event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<MetricsEvent>> {
        self.tx.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Feed one event into connected sessions.
    pub fn publish(&self, event: MetricsEvent) {
        // Send fails only when no session is connected, which is fine.
        let _ = self.tx.send(Arc::new(event));
    }

    /// Spawn the bus listener that feeds this hub until shutdown.
    pub fn spawn_bus_listener(&self, kv: Arc<dyn Kv>, shutdown: ShutdownSignal) {
        let hub = self.clone();
        tokio::spawn(async move {
            let channels = vec![
                CHANNEL_TOPOLOGY.to_string(),
                CHANNEL_HEALTH.to_string(),
                CHANNEL_SPEED_TEST.to_string(),
            ];
            let mut subscription = match kv.subscribe(&channels).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(error = %e, "cannot subscribe to metrics channels");
                    return;
                }
            };
            info!("bus listener started");

            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("bus listener stopping");
                        break;
                    }
                    message = subscription.recv() => {
                        let Some((channel, payload)) = message else {
                            warn!("bus subscription closed");
                            break;
                        };
                        match serde_json::from_str::<MetricsEvent>(&payload) {
                            Ok(event) => hub.publish(event),
                            Err(e) => {
                                warn!(channel, error = %e, "dropping unparseable bus event");
                            }
                        }
                    }
                }
            }
        });
    }
}

impl Default for SnapshotHub {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
