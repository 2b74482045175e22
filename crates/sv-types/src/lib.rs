//! Shared data model for surveyor services.
//!
//! This crate provides the common type definitions used across the
//! aggregator, gateway, notification, and edge services so that wire
//! payloads and bus events stay consistent between them.

pub mod events;
pub mod identity;
pub mod notify;
pub mod topology;

pub use events::{MetricsEvent, MetricsEventType};
pub use identity::{AuthMethod, AuthProviderKind, IdentityClaims, UserRole};
pub use notify::{
    NetworkEvent, NotificationChannel, NotificationPriority, NotificationRecord,
    NotificationType, ScheduledBroadcast, ScheduledBroadcastStatus,
};
pub use topology::{
    CheckHistoryEntry, DeviceRole, DnsMetrics, GatewayIspInfo, HealthStatus, LayoutNode,
    NodeConnection, NodeMetrics, PingMetrics, PortInfo, SpeedTestMetrics, TestIpMetrics,
    TopologySnapshot, UptimeMetrics,
};
