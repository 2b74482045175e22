use std::sync::Arc;

use serde_json::Value;
use sv_kv::Kv;
use sv_types::events::{
    CHANNEL_HEALTH, CHANNEL_SPEED_TEST, CHANNEL_TOPOLOGY, LAST_SNAPSHOT_KEY,
};
use sv_types::{MetricsEvent, MetricsEventType, SpeedTestMetrics, TopologySnapshot};
use tracing::{debug, error};

/// Late-joining clients read the stored snapshot instead of waiting for the
/// next publish cycle.
const LAST_SNAPSHOT_TTL_SECS: u64 = 3600;

// ---------------------------------------------------------------------------
// BusPublisher
// ---------------------------------------------------------------------------

/// Publishes metrics events onto the shared bus.
///
/// Publish failures are reported as `false` and logged; the publisher loop
/// retries on its next interval rather than propagating.
pub struct BusPublisher {
    kv: Arc<dyn Kv>,
}

impl BusPublisher {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> Arc<dyn Kv> {
        self.kv.clone()
    }

    async fn publish(&self, channel: &str, event_type: MetricsEventType, payload: Value) -> bool {
        let event = MetricsEvent::new(event_type, payload);
        let message = match serde_json::to_string(&event) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "failed to serialize metrics event");
                return false;
            }
        };

        match self.kv.publish(channel, &message).await {
            Ok(receivers) => {
                debug!(channel, ?event_type, receivers, "published event");
                true
            }
            Err(e) => {
                error!(channel, error = %e, "failed to publish event");
                false
            }
        }
    }

    /// Publish a full topology snapshot on the topology channel.
    pub async fn publish_topology_snapshot(&self, snapshot: &TopologySnapshot) -> bool {
        match serde_json::to_value(snapshot) {
            Ok(payload) => {
                self.publish(CHANNEL_TOPOLOGY, MetricsEventType::FullSnapshot, payload)
                    .await
            }
            Err(e) => {
                error!(error = %e, "failed to serialize snapshot");
                false
            }
        }
    }

    /// Publish a health status change for one node.
    pub async fn publish_health_update(&self, node_id: &str, status: &str, metrics: Value) -> bool {
        self.publish(
            CHANNEL_HEALTH,
            MetricsEventType::HealthUpdate,
            serde_json::json!({
                "node_id": node_id,
                "status": status,
                "metrics": metrics,
            }),
        )
        .await
    }

    /// Publish a speed test result for a gateway.
    pub async fn publish_speed_test_result(
        &self,
        gateway_ip: &str,
        result: &SpeedTestMetrics,
    ) -> bool {
        self.publish(
            CHANNEL_SPEED_TEST,
            MetricsEventType::SpeedTestResult,
            serde_json::json!({
                "gateway_ip": gateway_ip,
                "result": result,
            }),
        )
        .await
    }

    fn snapshot_key(network_id: Option<&str>) -> String {
        match network_id {
            Some(id) => format!("{LAST_SNAPSHOT_KEY}:{id}"),
            None => LAST_SNAPSHOT_KEY.to_string(),
        }
    }

    /// Store the latest snapshot (1 h expiry) for late subscribers.
    pub async fn store_last_snapshot(&self, snapshot: &TopologySnapshot) -> bool {
        let key = Self::snapshot_key(snapshot.network_id.as_deref());
        let payload = match serde_json::to_string(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize snapshot for storage");
                return false;
            }
        };
        match self.kv.set(&key, &payload, Some(LAST_SNAPSHOT_TTL_SECS)).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to store last snapshot");
                false
            }
        }
    }

    /// Load the stored snapshot, if one is still live.
    pub async fn load_last_snapshot(&self, network_id: Option<&str>) -> Option<TopologySnapshot> {
        let key = Self::snapshot_key(network_id);
        match self.kv.get(&key).await {
            Ok(Some(payload)) => serde_json::from_str(&payload).ok(),
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "failed to load last snapshot");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
