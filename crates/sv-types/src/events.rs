use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bus channels
// ---------------------------------------------------------------------------

/// Pub/sub channel carrying full snapshots and node updates.
pub const CHANNEL_TOPOLOGY: &str = "metrics:topology";
/// Pub/sub channel carrying health status changes.
pub const CHANNEL_HEALTH: &str = "metrics:health";
/// Pub/sub channel carrying speed test results.
pub const CHANNEL_SPEED_TEST: &str = "metrics:speedtest";
/// KV key holding the latest published snapshot (1 h expiry) so late
/// subscribers get immediate state.
pub const LAST_SNAPSHOT_KEY: &str = "metrics:last_snapshot";

// ---------------------------------------------------------------------------
// MetricsEventType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsEventType {
    FullSnapshot,
    NodeUpdate,
    ConnectivityChange,
    HealthUpdate,
    SpeedTestResult,
}

// ---------------------------------------------------------------------------
// MetricsEvent
// ---------------------------------------------------------------------------

/// Envelope for every message published on the metrics bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub event_type: MetricsEventType,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl MetricsEvent {
    pub fn new(event_type: MetricsEventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&MetricsEventType::FullSnapshot).unwrap();
        assert_eq!(json, "\"full_snapshot\"");
        let back: MetricsEventType = serde_json::from_str("\"speed_test_result\"").unwrap();
        assert_eq!(back, MetricsEventType::SpeedTestResult);
    }

    #[test]
    fn event_round_trips() {
        let event = MetricsEvent::new(
            MetricsEventType::HealthUpdate,
            serde_json::json!({"node_id": "n1", "status": "healthy"}),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: MetricsEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, MetricsEventType::HealthUpdate);
        assert_eq!(back.payload["node_id"], "n1");
    }
}
