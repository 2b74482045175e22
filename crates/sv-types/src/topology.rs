use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// HealthStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Parse a status string from the health service; anything unrecognised
    /// maps to `Unknown`.
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("healthy") => HealthStatus::Healthy,
            Some("degraded") => HealthStatus::Degraded,
            Some("unhealthy") => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

// ---------------------------------------------------------------------------
// DeviceRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    GatewayRouter,
    SwitchAp,
    Firewall,
    Server,
    Service,
    Nas,
    Client,
    Unknown,
    /// Layout-only grouping node; excluded from device counts.
    Group,
}

impl DeviceRole {
    /// Parse the role format used by layout payloads (`"gateway/router"`,
    /// `"switch/ap"`, ...). Unrecognised strings map to `Unknown`.
    pub fn parse(s: Option<&str>) -> Option<Self> {
        let s = s?;
        Some(match s.to_ascii_lowercase().as_str() {
            "gateway/router" => DeviceRole::GatewayRouter,
            "switch/ap" => DeviceRole::SwitchAp,
            "firewall" => DeviceRole::Firewall,
            "server" => DeviceRole::Server,
            "service" => DeviceRole::Service,
            "nas" => DeviceRole::Nas,
            "client" => DeviceRole::Client,
            "group" => DeviceRole::Group,
            _ => DeviceRole::Unknown,
        })
    }
}

// ---------------------------------------------------------------------------
// Probe metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingMetrics {
    pub success: bool,
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub packet_loss_percent: f64,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsMetrics {
    pub success: bool,
    pub resolved_hostname: Option<String>,
    pub reverse_dns: Option<String>,
    pub resolution_time_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port: u16,
    pub open: bool,
    pub service: Option<String>,
    pub response_time_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UptimeMetrics {
    pub uptime_percent_24h: Option<f64>,
    pub avg_latency_24h_ms: Option<f64>,
    #[serde(default)]
    pub checks_passed_24h: u64,
    #[serde(default)]
    pub checks_failed_24h: u64,
    pub last_seen_online: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: Option<f64>,
}

// ---------------------------------------------------------------------------
// Gateway / ISP metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestMetrics {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub ping_ms: Option<f64>,
    pub server_name: Option<String>,
    pub server_location: Option<String>,
    pub server_sponsor: Option<String>,
    pub client_ip: Option<String>,
    pub client_isp: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// Metrics for one of a gateway's configured probe targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestIpMetrics {
    pub ip: String,
    pub label: Option<String>,
    #[serde(default)]
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub ping: Option<PingMetrics>,
    pub uptime: Option<UptimeMetrics>,
    #[serde(default)]
    pub check_history: Vec<CheckHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayIspInfo {
    pub gateway_ip: String,
    #[serde(default)]
    pub test_ips: Vec<TestIpMetrics>,
    pub last_speed_test: Option<SpeedTestMetrics>,
    pub last_speed_test_timestamp: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Layout tree (input from the backend)
// ---------------------------------------------------------------------------

/// A node in the saved layout tree as the backend stores it. Field names
/// follow the frontend's camelCase payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutNode {
    pub id: String,
    pub name: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub role: Option<String>,
    pub parent_id: Option<String>,
    pub connection_speed: Option<String>,
    pub notes: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: Option<i64>,
    #[serde(default = "default_monitoring_enabled")]
    pub monitoring_enabled: bool,
    #[serde(default)]
    pub children: Vec<LayoutNode>,
}

fn default_monitoring_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// NodeMetrics
// ---------------------------------------------------------------------------

/// Per-node view in a topology snapshot: layout identity merged with the
/// latest health record for the node's IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub id: String,
    pub name: String,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub role: Option<DeviceRole>,
    pub parent_id: Option<String>,
    pub connection_speed: Option<String>,
    pub depth: u32,
    #[serde(default)]
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub ping: Option<PingMetrics>,
    pub dns: Option<DnsMetrics>,
    #[serde(default)]
    pub open_ports: Vec<PortInfo>,
    pub uptime: Option<UptimeMetrics>,
    #[serde(default)]
    pub check_history: Vec<CheckHistoryEntry>,
    pub notes: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: Option<i64>,
    pub isp_info: Option<GatewayIspInfo>,
    pub monitoring_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnection {
    pub source_id: String,
    pub target_id: String,
    pub connection_speed: Option<String>,
    pub latency_ms: Option<f64>,
}

// ---------------------------------------------------------------------------
// TopologySnapshot
// ---------------------------------------------------------------------------

/// Immutable point-in-time materialization of one network's topology and
/// health. `total_nodes` and the per-status counts exclude the root node and
/// `group` nodes; `nodes` keeps the full tree for graph rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub network_id: Option<String>,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub degraded_nodes: usize,
    pub unhealthy_nodes: usize,
    pub unknown_nodes: usize,
    pub nodes: HashMap<String, NodeMetrics>,
    pub connections: Vec<NodeConnection>,
    pub gateways: Vec<GatewayIspInfo>,
    pub root_node_id: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_parse_is_case_insensitive() {
        assert_eq!(HealthStatus::parse(Some("HEALTHY")), HealthStatus::Healthy);
        assert_eq!(HealthStatus::parse(Some("Degraded")), HealthStatus::Degraded);
        assert_eq!(HealthStatus::parse(Some("bogus")), HealthStatus::Unknown);
        assert_eq!(HealthStatus::parse(None), HealthStatus::Unknown);
    }

    #[test]
    fn device_role_parse_handles_slash_forms() {
        assert_eq!(
            DeviceRole::parse(Some("gateway/router")),
            Some(DeviceRole::GatewayRouter)
        );
        assert_eq!(DeviceRole::parse(Some("switch/ap")), Some(DeviceRole::SwitchAp));
        assert_eq!(DeviceRole::parse(Some("toaster")), Some(DeviceRole::Unknown));
        assert_eq!(DeviceRole::parse(None), None);
    }

    #[test]
    fn layout_node_accepts_camel_case() {
        let json = r#"{
            "id": "n1",
            "name": "Gateway",
            "ip": "192.168.1.1",
            "role": "gateway/router",
            "monitoringEnabled": false,
            "children": [{"id": "n2"}]
        }"#;
        let node: LayoutNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.id, "n1");
        assert!(!node.monitoring_enabled);
        assert_eq!(node.children.len(), 1);
        // Absent monitoringEnabled defaults to true.
        assert!(node.children[0].monitoring_enabled);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = TopologySnapshot {
            snapshot_id: "s1".into(),
            timestamp: Utc::now(),
            version: 1,
            network_id: Some("net-1".into()),
            total_nodes: 0,
            healthy_nodes: 0,
            degraded_nodes: 0,
            unhealthy_nodes: 0,
            unknown_nodes: 0,
            nodes: HashMap::new(),
            connections: Vec::new(),
            gateways: Vec::new(),
            root_node_id: "root".into(),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: TopologySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
