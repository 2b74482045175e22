use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// NotificationPriority
// ---------------------------------------------------------------------------

/// Ordered priority scale: `Low < Medium < High < Critical`. The derive
/// ordering is relied on by the minimum-priority and quiet-hours-bypass
/// comparisons, so variant order matters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for NotificationPriority {
    fn default() -> Self {
        NotificationPriority::Medium
    }
}

// ---------------------------------------------------------------------------
// NotificationType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    DeviceOffline,
    DeviceOnline,
    DeviceDegraded,
    HighLatency,
    PacketLoss,
    NetworkDown,
    NetworkUp,
    ScheduledMaintenance,
    SpeedTestComplete,
    ServiceUp,
    ServiceDown,
    AnomalyDetected,
    UpdateAvailable,
    Test,
}

impl NotificationType {
    /// Event types delivered through per-user global preferences rather than
    /// per-network preferences.
    pub fn is_global(&self) -> bool {
        matches!(self, NotificationType::ServiceUp | NotificationType::ServiceDown)
    }
}

// ---------------------------------------------------------------------------
// NotificationChannel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Discord,
}

// ---------------------------------------------------------------------------
// NetworkEvent
// ---------------------------------------------------------------------------

/// A single observed event entering the notification pipeline. One event may
/// fan out to multiple recipients and channels, producing one
/// [`NotificationRecord`] per (recipient, channel) attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub event_type: NotificationType,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub device_ip: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub previous_state: Option<String>,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub priority: Option<NotificationPriority>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl NetworkEvent {
    pub fn new(
        event_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            title: title.into(),
            message: message.into(),
            device_ip: None,
            device_name: None,
            previous_state: None,
            current_state: None,
            priority: None,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationRecord
// ---------------------------------------------------------------------------

/// Append-only record of one delivery attempt on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub event_id: String,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub channel: NotificationChannel,
    pub success: bool,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl NotificationRecord {
    pub fn new(
        event_id: impl Into<String>,
        channel: NotificationChannel,
        success: bool,
        priority: NotificationPriority,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: event_id.into(),
            network_id: None,
            user_id: None,
            channel,
            success,
            priority,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            error_message: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduledBroadcast
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledBroadcastStatus {
    Pending,
    Sent,
    Cancelled,
    Failed,
}

/// A preconfigured notification fanned out to every member of a network when
/// its due time arrives.
///
/// Lifecycle: `Pending -> Sent` when the timer fires and delivery begins;
/// `Pending -> Cancelled` on manual cancellation; `Pending -> Failed` when
/// recipient enumeration raises. Once non-pending the broadcast is immutable
/// apart from `seen_at`, which may be stamped exactly once on a `Sent`
/// broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledBroadcast {
    pub id: String,
    pub network_id: String,
    pub title: String,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub timezone: Option<String>,
    pub status: ScheduledBroadcastStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seen_at: Option<DateTime<Utc>>,
    pub event_type: NotificationType,
    pub priority: NotificationPriority,
    #[serde(default)]
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_total_order() {
        assert!(NotificationPriority::Low < NotificationPriority::Medium);
        assert!(NotificationPriority::Medium < NotificationPriority::High);
        assert!(NotificationPriority::High < NotificationPriority::Critical);
    }

    #[test]
    fn priority_default_is_medium() {
        assert_eq!(NotificationPriority::default(), NotificationPriority::Medium);
    }

    #[test]
    fn global_types() {
        assert!(NotificationType::ServiceUp.is_global());
        assert!(NotificationType::ServiceDown.is_global());
        assert!(!NotificationType::DeviceOffline.is_global());
    }

    #[test]
    fn record_without_network_id_deserializes_as_none() {
        // Legacy history entries predate multi-tenant records.
        let json = r#"{
            "id": "r1",
            "event_id": "e1",
            "channel": "email",
            "success": true,
            "priority": "high",
            "title": "t",
            "message": "m",
            "timestamp": "2024-01-15T03:00:00Z"
        }"#;
        let record: NotificationRecord = serde_json::from_str(json).unwrap();
        assert!(record.network_id.is_none());
        assert!(record.user_id.is_none());
    }

    #[test]
    fn broadcast_status_wire_format() {
        let json = serde_json::to_string(&ScheduledBroadcastStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }
}
