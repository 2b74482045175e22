use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sv_types::{
    CheckHistoryEntry, DeviceRole, DnsMetrics, GatewayIspInfo, HealthStatus, LayoutNode,
    NodeConnection, NodeMetrics, PingMetrics, PortInfo, SpeedTestMetrics, TestIpMetrics,
    TopologySnapshot, UptimeMetrics,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MIN_PUBLISH_INTERVAL_SECS;
use crate::upstream::UpstreamClient;

/// Map key for the pre-multi-tenant snapshot.
pub const LEGACY_NETWORK_KEY: &str = "default";

// ---------------------------------------------------------------------------
// Value parsing helpers
// ---------------------------------------------------------------------------

fn parse_ts(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
}

fn parse_f64(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64)
}

fn parse_ping(data: Option<&Value>) -> Option<PingMetrics> {
    let data = data?.as_object()?;
    Some(PingMetrics {
        success: data.get("success").and_then(Value::as_bool).unwrap_or(false),
        latency_ms: parse_f64(data.get("latency_ms")),
        packet_loss_percent: parse_f64(data.get("packet_loss_percent")).unwrap_or(0.0),
        min_latency_ms: parse_f64(data.get("min_latency_ms")),
        max_latency_ms: parse_f64(data.get("max_latency_ms")),
        avg_latency_ms: parse_f64(data.get("avg_latency_ms")),
        jitter_ms: parse_f64(data.get("jitter_ms")),
    })
}

fn parse_dns(data: Option<&Value>) -> Option<DnsMetrics> {
    let data = data?.as_object()?;
    Some(DnsMetrics {
        success: data.get("success").and_then(Value::as_bool).unwrap_or(false),
        resolved_hostname: data
            .get("resolved_hostname")
            .and_then(Value::as_str)
            .map(String::from),
        reverse_dns: data
            .get("reverse_dns")
            .and_then(Value::as_str)
            .map(String::from),
        resolution_time_ms: parse_f64(data.get("resolution_time_ms")),
    })
}

fn parse_ports(data: Option<&Value>) -> Vec<PortInfo> {
    data.and_then(Value::as_array)
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    Some(PortInfo {
                        port: p.get("port")?.as_u64()? as u16,
                        open: p.get("open").and_then(Value::as_bool).unwrap_or(false),
                        service: p.get("service").and_then(Value::as_str).map(String::from),
                        response_time_ms: parse_f64(p.get("response_time_ms")),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_history(data: Option<&Value>) -> Vec<CheckHistoryEntry> {
    data.and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    Some(CheckHistoryEntry {
                        timestamp: parse_ts(e.get("timestamp"))?,
                        success: e.get("success").and_then(Value::as_bool).unwrap_or(false),
                        latency_ms: parse_f64(e.get("latency_ms")),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_uptime(health: &Value) -> UptimeMetrics {
    UptimeMetrics {
        uptime_percent_24h: parse_f64(health.get("uptime_percent_24h")),
        avg_latency_24h_ms: parse_f64(health.get("avg_latency_24h_ms")),
        checks_passed_24h: health
            .get("checks_passed_24h")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        checks_failed_24h: health
            .get("checks_failed_24h")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        last_seen_online: parse_ts(health.get("last_seen_online")),
        consecutive_failures: health
            .get("consecutive_failures")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    }
}

fn parse_test_ip(data: &Value) -> TestIpMetrics {
    TestIpMetrics {
        ip: data
            .get("ip")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        label: data.get("label").and_then(Value::as_str).map(String::from),
        status: HealthStatus::parse(data.get("status").and_then(Value::as_str)),
        last_check: parse_ts(data.get("last_check")),
        ping: parse_ping(data.get("ping")),
        uptime: Some(parse_uptime(data)),
        check_history: parse_history(data.get("check_history")),
    }
}

pub(crate) fn parse_speed_test(data: &Value) -> Option<SpeedTestMetrics> {
    Some(SpeedTestMetrics {
        success: data.get("success").and_then(Value::as_bool).unwrap_or(false),
        timestamp: parse_ts(data.get("timestamp")).unwrap_or_else(Utc::now),
        download_mbps: parse_f64(data.get("download_mbps")),
        upload_mbps: parse_f64(data.get("upload_mbps")),
        ping_ms: parse_f64(data.get("ping_ms")),
        server_name: data
            .get("server_name")
            .and_then(Value::as_str)
            .map(String::from),
        server_location: data
            .get("server_location")
            .and_then(Value::as_str)
            .map(String::from),
        server_sponsor: data
            .get("server_sponsor")
            .and_then(Value::as_str)
            .map(String::from),
        client_ip: data.get("client_ip").and_then(Value::as_str).map(String::from),
        client_isp: data
            .get("client_isp")
            .and_then(Value::as_str)
            .map(String::from),
        error_message: data
            .get("error_message")
            .and_then(Value::as_str)
            .map(String::from),
        duration_seconds: parse_f64(data.get("duration_seconds")),
    })
}

// ---------------------------------------------------------------------------
// Snapshot assembly (pure)
// ---------------------------------------------------------------------------

/// Inputs for one assembly pass, all keyed by IP.
pub struct AssemblyInputs<'a> {
    pub health: &'a HashMap<String, Value>,
    pub gateway_test_ips: &'a HashMap<String, Value>,
    pub speed_tests: &'a HashMap<String, Value>,
    /// Cached speed tests from earlier trigger calls, used when the health
    /// service has no stored result for a gateway.
    pub cached_speed_tests: &'a HashMap<String, SpeedTestMetrics>,
    /// The previous snapshot for this network, used to carry node notes
    /// forward when a fresh layout omits them.
    pub prior: Option<&'a TopologySnapshot>,
}

fn process_node(
    node: &LayoutNode,
    depth: u32,
    parent_id: Option<&str>,
    inputs: &AssemblyInputs<'_>,
) -> (NodeMetrics, Option<NodeConnection>) {
    let empty = Value::Null;
    let health = node
        .ip
        .as_deref()
        .and_then(|ip| inputs.health.get(ip))
        .unwrap_or(&empty);
    let has_health = health.is_object();

    let role = DeviceRole::parse(node.role.as_deref());

    // Gateways additionally carry their probe-target and speed-test state.
    let isp_info = match (role, node.ip.as_deref()) {
        (Some(DeviceRole::GatewayRouter), Some(ip)) => {
            inputs.gateway_test_ips.get(ip).map(|gateway_data| {
                let test_ips = gateway_data
                    .get("test_ips")
                    .and_then(Value::as_array)
                    .map(|tips| tips.iter().map(parse_test_ip).collect())
                    .unwrap_or_default();

                let last_speed_test = inputs
                    .speed_tests
                    .get(ip)
                    .and_then(parse_speed_test)
                    .or_else(|| inputs.cached_speed_tests.get(ip).cloned());
                let last_speed_test_timestamp = last_speed_test.as_ref().map(|s| s.timestamp);

                GatewayIspInfo {
                    gateway_ip: ip.to_string(),
                    test_ips,
                    last_speed_test,
                    last_speed_test_timestamp,
                }
            })
        }
        _ => None,
    };

    // Carry notes forward from the prior snapshot when the fresh layout
    // dropped them.
    let notes = node.notes.clone().or_else(|| {
        inputs
            .prior
            .and_then(|snapshot| snapshot.nodes.get(&node.id))
            .and_then(|prior_node| prior_node.notes.clone())
    });

    let metrics = NodeMetrics {
        id: node.id.clone(),
        name: node.name.clone().unwrap_or_else(|| node.id.clone()),
        ip: node.ip.clone(),
        hostname: node.hostname.clone(),
        role,
        parent_id: parent_id
            .map(String::from)
            .or_else(|| node.parent_id.clone()),
        connection_speed: node.connection_speed.clone(),
        depth,
        status: HealthStatus::parse(health.get("status").and_then(Value::as_str)),
        last_check: parse_ts(health.get("last_check")),
        ping: parse_ping(health.get("ping")),
        dns: parse_dns(health.get("dns")),
        open_ports: parse_ports(health.get("open_ports")),
        uptime: has_health.then(|| parse_uptime(health)),
        check_history: parse_history(health.get("check_history")),
        notes,
        created_at: node.created_at,
        updated_at: node.updated_at,
        version: node.version,
        isp_info,
        monitoring_enabled: node.monitoring_enabled,
    };

    let connection = parent_id.map(|parent| NodeConnection {
        source_id: parent.to_string(),
        target_id: node.id.clone(),
        connection_speed: node.connection_speed.clone(),
        latency_ms: health
            .get("ping")
            .and_then(|p| p.get("avg_latency_ms"))
            .and_then(Value::as_f64),
    });

    (metrics, connection)
}

/// Assemble a snapshot from a layout tree and collector data.
///
/// The tree is walked breadth-first. Summary counts exclude the root node
/// and `group` nodes, matching what the dashboard treats as devices; the
/// `nodes` map keeps the full tree for graph rendering.
pub fn assemble_snapshot(
    root: &LayoutNode,
    network_id: Option<&str>,
    inputs: &AssemblyInputs<'_>,
) -> TopologySnapshot {
    let mut nodes: HashMap<String, NodeMetrics> = HashMap::new();
    let mut connections: Vec<NodeConnection> = Vec::new();
    let root_node_id = root.id.clone();

    let mut queue: VecDeque<(&LayoutNode, u32, Option<String>)> = VecDeque::new();
    queue.push_back((root, 0, None));

    while let Some((node, depth, parent_id)) = queue.pop_front() {
        let (mut metrics, connection) = process_node(node, depth, parent_id.as_deref(), inputs);

        // A node can appear twice in a malformed layout; keep whichever copy
        // carries notes.
        if let Some(existing) = nodes.get(&metrics.id) {
            if existing.notes.is_some() && metrics.notes.is_none() {
                debug!(node_id = %metrics.id, "preserving notes from duplicate node");
                metrics.notes = existing.notes.clone();
            }
        }

        if let Some(connection) = connection {
            connections.push(connection);
        }
        for child in &node.children {
            queue.push_back((child, depth + 1, Some(metrics.id.clone())));
        }
        nodes.insert(metrics.id.clone(), metrics);
    }

    let mut counts: HashMap<HealthStatus, usize> = HashMap::new();
    let device_count = nodes
        .values()
        .filter(|n| n.id != root_node_id && n.role != Some(DeviceRole::Group))
        .inspect(|n| *counts.entry(n.status).or_insert(0) += 1)
        .count();

    let gateways = nodes
        .values()
        .filter_map(|n| n.isp_info.clone())
        .collect();

    TopologySnapshot {
        snapshot_id: Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        version: 1,
        network_id: network_id.map(String::from),
        total_nodes: device_count,
        healthy_nodes: counts.get(&HealthStatus::Healthy).copied().unwrap_or(0),
        degraded_nodes: counts.get(&HealthStatus::Degraded).copied().unwrap_or(0),
        unhealthy_nodes: counts.get(&HealthStatus::Unhealthy).copied().unwrap_or(0),
        unknown_nodes: counts.get(&HealthStatus::Unknown).copied().unwrap_or(0),
        nodes,
        connections,
        gateways,
        root_node_id,
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Aggregates collector data into per-network topology snapshots.
///
/// Holds the in-process "last snapshot" per network so the HTTP surface and
/// the WebSocket gateway can answer immediately, and the per-gateway speed
/// test cache that bridges triggered runs into the next snapshot.
pub struct Aggregator {
    upstream: Arc<UpstreamClient>,
    last_snapshots: RwLock<HashMap<String, TopologySnapshot>>,
    cached_speed_tests: RwLock<HashMap<String, SpeedTestMetrics>>,
    publish_interval_secs: AtomicU64,
    publishing_enabled: AtomicBool,
    publish_in_flight: AtomicBool,
}

impl Aggregator {
    pub fn new(upstream: Arc<UpstreamClient>, publish_interval_secs: u64) -> Self {
        Self {
            upstream,
            last_snapshots: RwLock::new(HashMap::new()),
            cached_speed_tests: RwLock::new(HashMap::new()),
            publish_interval_secs: AtomicU64::new(
                publish_interval_secs.max(MIN_PUBLISH_INTERVAL_SECS),
            ),
            publishing_enabled: AtomicBool::new(true),
            publish_in_flight: AtomicBool::new(false),
        }
    }

    /// Generate a snapshot for one network (or the legacy layout when
    /// `network_id` is `None`). Returns `None` when no layout exists.
    pub async fn generate_snapshot(&self, network_id: Option<&str>) -> Option<TopologySnapshot> {
        let (layout, health, gateway_test_ips, speed_tests) = tokio::join!(
            self.upstream.fetch_network_layout(network_id),
            self.upstream.fetch_health_metrics(),
            self.upstream.fetch_gateway_test_ips(),
            self.upstream.fetch_speed_test_results(),
        );

        let layout = layout?;
        let root: LayoutNode = match serde_json::from_value(layout) {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, "layout payload did not parse");
                return None;
            }
        };

        let key = network_id.unwrap_or(LEGACY_NETWORK_KEY).to_string();
        let cached = self.cached_speed_tests.read().expect("speed cache poisoned").clone();
        let snapshot = {
            let snapshots = self.last_snapshots.read().expect("snapshots poisoned");
            let inputs = AssemblyInputs {
                health: &health,
                gateway_test_ips: &gateway_test_ips,
                speed_tests: &speed_tests,
                cached_speed_tests: &cached,
                prior: snapshots.get(&key),
            };
            assemble_snapshot(&root, network_id, &inputs)
        };

        info!(
            network_id = %key,
            devices = snapshot.total_nodes,
            healthy = snapshot.healthy_nodes,
            degraded = snapshot.degraded_nodes,
            unhealthy = snapshot.unhealthy_nodes,
            tree_nodes = snapshot.nodes.len(),
            "generated snapshot"
        );

        self.last_snapshots
            .write()
            .expect("snapshots poisoned")
            .insert(key, snapshot.clone());
        Some(snapshot)
    }

    /// Generate snapshots for every known network. When the backend reports
    /// no networks, fall back to one legacy-mode snapshot.
    pub async fn generate_all_snapshots(&self) -> HashMap<String, TopologySnapshot> {
        let ids = self.upstream.fetch_all_network_ids().await;
        let mut out = HashMap::new();

        if ids.is_empty() {
            if let Some(snapshot) = self.generate_snapshot(None).await {
                out.insert(LEGACY_NETWORK_KEY.to_string(), snapshot);
            }
            return out;
        }

        for id in ids {
            if let Some(snapshot) = self.generate_snapshot(Some(&id)).await {
                out.insert(id, snapshot);
            }
        }
        out
    }

    /// Latest in-memory snapshot for a network (legacy when `None`).
    pub fn last_snapshot(&self, network_id: Option<&str>) -> Option<TopologySnapshot> {
        let snapshots = self.last_snapshots.read().expect("snapshots poisoned");
        let key = network_id.unwrap_or(LEGACY_NETWORK_KEY);
        snapshots.get(key).cloned().or_else(|| {
            // Any snapshot beats none for a fresh WebSocket client.
            snapshots.values().next().cloned()
        })
    }

    /// Remember a triggered speed test for inclusion in the next snapshot.
    pub fn cache_speed_test(&self, gateway_ip: &str, result: SpeedTestMetrics) {
        self.cached_speed_tests
            .write()
            .expect("speed cache poisoned")
            .insert(gateway_ip.to_string(), result);
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    // --- publisher-loop coordination ---

    pub fn publish_interval_secs(&self) -> u64 {
        self.publish_interval_secs.load(Ordering::Relaxed)
    }

    pub fn set_publish_interval_secs(&self, secs: u64) {
        let secs = secs.max(MIN_PUBLISH_INTERVAL_SECS);
        self.publish_interval_secs.store(secs, Ordering::Relaxed);
        info!(secs, "publish interval updated");
    }

    pub fn publishing_enabled(&self) -> bool {
        self.publishing_enabled.load(Ordering::Relaxed)
    }

    pub fn set_publishing_enabled(&self, enabled: bool) {
        self.publishing_enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "publishing toggled");
    }

    /// Claim the publish re-entrancy flag. Returns `false` when a previous
    /// cycle is still running, in which case this cycle must be skipped.
    pub fn try_begin_publish(&self) -> bool {
        self.publish_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_publish(&self) {
        self.publish_in_flight.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs<'a>(
        health: &'a HashMap<String, Value>,
        gateways: &'a HashMap<String, Value>,
        speeds: &'a HashMap<String, Value>,
        cached: &'a HashMap<String, SpeedTestMetrics>,
        prior: Option<&'a TopologySnapshot>,
    ) -> AssemblyInputs<'a> {
        AssemblyInputs {
            health,
            gateway_test_ips: gateways,
            speed_tests: speeds,
            cached_speed_tests: cached,
            prior,
        }
    }

    fn layout_with_groups() -> LayoutNode {
        serde_json::from_value(json!({
            "id": "root",
            "name": "Network",
            "children": [
                {"id": "grp-1", "name": "Servers", "role": "group", "children": [
                    {"id": "dev-1", "name": "web", "ip": "10.0.0.1", "role": "server"},
                    {"id": "dev-2", "name": "db", "ip": "10.0.0.2", "role": "server"}
                ]},
                {"id": "grp-2", "name": "Clients", "role": "group", "children": [
                    {"id": "dev-3", "name": "laptop", "ip": "10.0.0.3", "role": "client"}
                ]}
            ]
        }))
        .unwrap()
    }

    fn health_for(entries: &[(&str, &str)]) -> HashMap<String, Value> {
        entries
            .iter()
            .map(|(ip, status)| {
                (
                    ip.to_string(),
                    json!({"status": status, "ping": {"success": true, "avg_latency_ms": 5.0}}),
                )
            })
            .collect()
    }

    #[test]
    fn counts_exclude_root_and_group_nodes() {
        let layout = layout_with_groups();
        let health = health_for(&[
            ("10.0.0.1", "healthy"),
            ("10.0.0.2", "healthy"),
            ("10.0.0.3", "unhealthy"),
        ]);
        let (gateways, speeds, cached) = (HashMap::new(), HashMap::new(), HashMap::new());

        let snapshot = assemble_snapshot(
            &layout,
            None,
            &inputs(&health, &gateways, &speeds, &cached, None),
        );

        assert_eq!(snapshot.total_nodes, 3);
        assert_eq!(snapshot.healthy_nodes, 2);
        assert_eq!(snapshot.degraded_nodes, 0);
        assert_eq!(snapshot.unhealthy_nodes, 1);
        assert_eq!(snapshot.unknown_nodes, 0);
        // The full graph still carries root + 2 groups + 3 devices.
        assert_eq!(snapshot.nodes.len(), 6);
        assert_eq!(snapshot.root_node_id, "root");
    }

    #[test]
    fn summary_counts_sum_to_total() {
        let layout = layout_with_groups();
        let health = health_for(&[("10.0.0.1", "degraded")]);
        let (gateways, speeds, cached) = (HashMap::new(), HashMap::new(), HashMap::new());

        let snapshot = assemble_snapshot(
            &layout,
            None,
            &inputs(&health, &gateways, &speeds, &cached, None),
        );

        assert_eq!(
            snapshot.healthy_nodes
                + snapshot.degraded_nodes
                + snapshot.unhealthy_nodes
                + snapshot.unknown_nodes,
            snapshot.total_nodes
        );
        // Devices without health records are unknown.
        assert_eq!(snapshot.unknown_nodes, 2);
    }

    #[test]
    fn depth_parent_and_connections_follow_the_tree() {
        let layout = layout_with_groups();
        let health = HashMap::new();
        let (gateways, speeds, cached) = (HashMap::new(), HashMap::new(), HashMap::new());

        let snapshot = assemble_snapshot(
            &layout,
            None,
            &inputs(&health, &gateways, &speeds, &cached, None),
        );

        let dev = &snapshot.nodes["dev-1"];
        assert_eq!(dev.depth, 2);
        assert_eq!(dev.parent_id.as_deref(), Some("grp-1"));
        // One connection per non-root node.
        assert_eq!(snapshot.connections.len(), 5);
        assert!(snapshot
            .connections
            .iter()
            .any(|c| c.source_id == "grp-1" && c.target_id == "dev-1"));
    }

    #[test]
    fn notes_survive_a_layout_that_dropped_them() {
        let with_notes: LayoutNode = serde_json::from_value(json!({
            "id": "root",
            "children": [{"id": "dev-1", "ip": "10.0.0.1", "role": "server", "notes": "rack 3"}]
        }))
        .unwrap();
        let without_notes: LayoutNode = serde_json::from_value(json!({
            "id": "root",
            "children": [{"id": "dev-1", "ip": "10.0.0.1", "role": "server"}]
        }))
        .unwrap();

        let health = HashMap::new();
        let (gateways, speeds, cached) = (HashMap::new(), HashMap::new(), HashMap::new());

        let first = assemble_snapshot(
            &with_notes,
            None,
            &inputs(&health, &gateways, &speeds, &cached, None),
        );
        assert_eq!(first.nodes["dev-1"].notes.as_deref(), Some("rack 3"));

        let second = assemble_snapshot(
            &without_notes,
            None,
            &inputs(&health, &gateways, &speeds, &cached, Some(&first)),
        );
        assert_eq!(second.nodes["dev-1"].notes.as_deref(), Some("rack 3"));
    }

    #[test]
    fn gateway_nodes_pick_up_isp_info() {
        let layout: LayoutNode = serde_json::from_value(json!({
            "id": "root",
            "children": [{"id": "gw", "ip": "192.168.1.1", "role": "gateway/router"}]
        }))
        .unwrap();
        let health = HashMap::new();
        let gateways: HashMap<String, Value> = [(
            "192.168.1.1".to_string(),
            json!({"test_ips": [{"ip": "1.1.1.1", "label": "dns", "status": "healthy"}]}),
        )]
        .into();
        let speeds: HashMap<String, Value> = [(
            "192.168.1.1".to_string(),
            json!({"success": true, "download_mbps": 940.2, "timestamp": "2024-01-15T03:00:00Z"}),
        )]
        .into();
        let cached = HashMap::new();

        let snapshot = assemble_snapshot(
            &layout,
            Some("net-1"),
            &inputs(&health, &gateways, &speeds, &cached, None),
        );

        assert_eq!(snapshot.gateways.len(), 1);
        let isp = &snapshot.gateways[0];
        assert_eq!(isp.gateway_ip, "192.168.1.1");
        assert_eq!(isp.test_ips.len(), 1);
        assert_eq!(isp.test_ips[0].status, HealthStatus::Healthy);
        assert_eq!(
            isp.last_speed_test.as_ref().unwrap().download_mbps,
            Some(940.2)
        );
        assert_eq!(snapshot.network_id.as_deref(), Some("net-1"));
    }

    #[test]
    fn gateway_without_stored_speed_test_uses_cache() {
        let layout: LayoutNode = serde_json::from_value(json!({
            "id": "root",
            "children": [{"id": "gw", "ip": "192.168.1.1", "role": "gateway/router"}]
        }))
        .unwrap();
        let health = HashMap::new();
        let gateways: HashMap<String, Value> =
            [("192.168.1.1".to_string(), json!({"test_ips": []}))].into();
        let speeds = HashMap::new();
        let cached: HashMap<String, SpeedTestMetrics> = [(
            "192.168.1.1".to_string(),
            parse_speed_test(&json!({"success": true, "download_mbps": 101.0})).unwrap(),
        )]
        .into();

        let snapshot = assemble_snapshot(
            &layout,
            None,
            &inputs(&health, &gateways, &speeds, &cached, None),
        );
        assert_eq!(
            snapshot.gateways[0]
                .last_speed_test
                .as_ref()
                .unwrap()
                .download_mbps,
            Some(101.0)
        );
    }
}
