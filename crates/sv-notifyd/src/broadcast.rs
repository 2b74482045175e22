use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use sv_types::{
    NotificationPriority, NotificationType, ScheduledBroadcast, ScheduledBroadcastStatus,
};
use tracing::{error, info, warn};
use uuid::Uuid;

const SCHEDULED_FILE: &str = "scheduled.json";

/// Once a client stamps `seen_at`, the broadcast stays listed for this many
/// seconds and then drops out of listings.
pub const SEEN_DISMISSAL_DELAY_SECS: i64 = 5;

// ---------------------------------------------------------------------------
// Update payload
// ---------------------------------------------------------------------------

/// Mutable fields of a pending broadcast.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct BroadcastUpdate {
    pub title: Option<String>,
    pub message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub priority: Option<NotificationPriority>,
    pub event_type: Option<NotificationType>,
}

// ---------------------------------------------------------------------------
// BroadcastStore
// ---------------------------------------------------------------------------

/// Scheduled broadcast state machine and persistence.
///
/// `Pending` is the only mutable state: updates and cancellation require it,
/// deletion requires having left it, and `seen_at` can be stamped exactly
/// once after the broadcast was sent.
pub struct BroadcastStore {
    path: PathBuf,
    broadcasts: Mutex<HashMap<String, ScheduledBroadcast>>,
}

impl BroadcastStore {
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let path = data_dir.into().join(SCHEDULED_FILE);
        let broadcasts = Mutex::new(load_broadcasts(&path));
        Self { path, broadcasts }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        network_id: &str,
        title: &str,
        message: &str,
        scheduled_at: DateTime<Utc>,
        timezone: Option<String>,
        created_by: &str,
        event_type: NotificationType,
        priority: NotificationPriority,
    ) -> ScheduledBroadcast {
        let broadcast = ScheduledBroadcast {
            id: Uuid::new_v4().to_string(),
            network_id: network_id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            scheduled_at,
            timezone,
            status: ScheduledBroadcastStatus::Pending,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            sent_at: None,
            seen_at: None,
            event_type,
            priority,
            error_message: None,
        };
        self.broadcasts
            .lock()
            .unwrap()
            .insert(broadcast.id.clone(), broadcast.clone());
        self.save();
        info!(broadcast_id = %broadcast.id, network_id, "scheduled broadcast created");
        broadcast
    }

    pub fn get(&self, id: &str) -> Option<ScheduledBroadcast> {
        self.broadcasts.lock().unwrap().get(id).cloned()
    }

    /// List broadcasts for display. Pending always shows; completed states
    /// show only when requested, and sent broadcasts acknowledged more than
    /// the dismissal delay ago are filtered out.
    pub fn list(&self, include_completed: bool, network_id: Option<&str>) -> Vec<ScheduledBroadcast> {
        let now = Utc::now();
        let cutoff = Duration::seconds(SEEN_DISMISSAL_DELAY_SECS);
        let broadcasts = self.broadcasts.lock().unwrap();

        let mut out: Vec<ScheduledBroadcast> = broadcasts
            .values()
            .filter(|b| match network_id {
                Some(id) => b.network_id == id,
                None => true,
            })
            .filter(|b| {
                if b.status == ScheduledBroadcastStatus::Pending {
                    return true;
                }
                if !include_completed {
                    return false;
                }
                match b.seen_at {
                    Some(seen_at) => now - seen_at <= cutoff,
                    None => true,
                }
            })
            .cloned()
            .collect();
        out.sort_by_key(|b| b.scheduled_at);
        out
    }

    /// Pending broadcasts whose due time has passed.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<ScheduledBroadcast> {
        let broadcasts = self.broadcasts.lock().unwrap();
        broadcasts
            .values()
            .filter(|b| b.status == ScheduledBroadcastStatus::Pending && b.scheduled_at <= now)
            .cloned()
            .collect()
    }

    /// Update a pending broadcast. Returns `None` for unknown ids or
    /// non-pending broadcasts.
    pub fn update(&self, id: &str, update: BroadcastUpdate) -> Option<ScheduledBroadcast> {
        let updated = {
            let mut broadcasts = self.broadcasts.lock().unwrap();
            let broadcast = broadcasts.get_mut(id)?;
            if broadcast.status != ScheduledBroadcastStatus::Pending {
                return None;
            }
            if let Some(title) = update.title {
                broadcast.title = title;
            }
            if let Some(message) = update.message {
                broadcast.message = message;
            }
            if let Some(scheduled_at) = update.scheduled_at {
                broadcast.scheduled_at = scheduled_at;
            }
            if let Some(priority) = update.priority {
                broadcast.priority = priority;
            }
            if let Some(event_type) = update.event_type {
                broadcast.event_type = event_type;
            }
            broadcast.clone()
        };
        self.save();
        Some(updated)
    }

    /// Cancel a pending broadcast. Returns `false` otherwise.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = {
            let mut broadcasts = self.broadcasts.lock().unwrap();
            match broadcasts.get_mut(id) {
                Some(b) if b.status == ScheduledBroadcastStatus::Pending => {
                    b.status = ScheduledBroadcastStatus::Cancelled;
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            self.save();
            info!(broadcast_id = id, "broadcast cancelled");
        }
        cancelled
    }

    /// Delete a broadcast that already left the pending state. Returns
    /// `false` for unknown ids or still-pending broadcasts.
    pub fn delete(&self, id: &str) -> bool {
        let deleted = {
            let mut broadcasts = self.broadcasts.lock().unwrap();
            match broadcasts.get(id) {
                Some(b) if b.status != ScheduledBroadcastStatus::Pending => {
                    broadcasts.remove(id);
                    true
                }
                _ => false,
            }
        };
        if deleted {
            self.save();
        }
        deleted
    }

    /// Stamp `seen_at` on a sent broadcast, once. Returns the new timestamp,
    /// or `None` when the broadcast is unknown, not sent, or already seen.
    pub fn mark_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        let stamped = {
            let mut broadcasts = self.broadcasts.lock().unwrap();
            let broadcast = broadcasts.get_mut(id)?;
            if broadcast.status != ScheduledBroadcastStatus::Sent || broadcast.seen_at.is_some() {
                return None;
            }
            let now = Utc::now();
            broadcast.seen_at = Some(now);
            now
        };
        self.save();
        Some(stamped)
    }

    /// Transition a broadcast out of pending after a delivery attempt.
    pub fn mark_sent(&self, id: &str) {
        {
            let mut broadcasts = self.broadcasts.lock().unwrap();
            if let Some(b) = broadcasts.get_mut(id) {
                b.status = ScheduledBroadcastStatus::Sent;
                b.sent_at = Some(Utc::now());
            }
        }
        self.save();
    }

    pub fn mark_failed(&self, id: &str, error_message: &str) {
        {
            let mut broadcasts = self.broadcasts.lock().unwrap();
            if let Some(b) = broadcasts.get_mut(id) {
                b.status = ScheduledBroadcastStatus::Failed;
                b.error_message = Some(error_message.to_string());
            }
        }
        self.save();
    }

    fn save(&self) {
        let snapshot = self.broadcasts.lock().unwrap().clone();
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let payload = serde_json::to_string_pretty(&snapshot)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            std::fs::write(&self.path, payload)
        };
        if let Err(e) = write() {
            error!(path = %self.path.display(), error = %e, "failed to persist broadcasts");
        }
    }
}

fn load_broadcasts(path: &Path) -> HashMap<String, ScheduledBroadcast> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    let Ok(entries) = serde_json::from_str::<HashMap<String, serde_json::Value>>(&raw) else {
        warn!(path = %path.display(), "scheduled file did not parse, starting empty");
        return HashMap::new();
    };
    entries
        .into_iter()
        .filter_map(|(id, value)| match serde_json::from_value(value) {
            Ok(broadcast) => Some((id, broadcast)),
            Err(e) => {
                // Broadcasts without a network id predate multi-tenancy and
                // cannot be delivered to anyone.
                warn!(id, error = %e, "dropping invalid scheduled broadcast");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sv-notifyd-broadcast-{tag}-{}",
            Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn store(tag: &str) -> BroadcastStore {
        BroadcastStore::load(temp_dir(tag))
    }

    fn create(store: &BroadcastStore, offset_minutes: i64) -> ScheduledBroadcast {
        store.create(
            "net-1",
            "Maintenance",
            "Router reboot at 22:00",
            Utc::now() + Duration::minutes(offset_minutes),
            Some("America/New_York".into()),
            "owner-1",
            NotificationType::ScheduledMaintenance,
            NotificationPriority::High,
        )
    }

    #[test]
    fn create_starts_pending() {
        let store = store("create");
        let broadcast = create(&store, 60);
        assert_eq!(broadcast.status, ScheduledBroadcastStatus::Pending);
        assert_eq!(broadcast.network_id, "net-1");
        assert!(broadcast.sent_at.is_none());
    }

    #[test]
    fn due_only_returns_past_pending() {
        let store = store("due");
        let past = create(&store, -5);
        create(&store, 60);
        let sent = create(&store, -10);
        store.mark_sent(&sent.id);

        let due = store.due(Utc::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past.id);
    }

    #[test]
    fn update_requires_pending() {
        let store = store("update");
        let broadcast = create(&store, 60);

        let updated = store
            .update(
                &broadcast.id,
                BroadcastUpdate {
                    title: Some("New title".into()),
                    priority: Some(NotificationPriority::Critical),
                    ..BroadcastUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "New title");
        assert_eq!(updated.priority, NotificationPriority::Critical);

        store.mark_sent(&broadcast.id);
        assert!(store
            .update(&broadcast.id, BroadcastUpdate::default())
            .is_none());
        assert!(store.update("missing", BroadcastUpdate::default()).is_none());
    }

    #[test]
    fn cancel_only_from_pending() {
        let store = store("cancel");
        let broadcast = create(&store, 60);
        assert!(store.cancel(&broadcast.id));
        assert_eq!(
            store.get(&broadcast.id).unwrap().status,
            ScheduledBroadcastStatus::Cancelled
        );
        // Second cancel fails; so does cancelling a sent broadcast.
        assert!(!store.cancel(&broadcast.id));

        let sent = create(&store, -1);
        store.mark_sent(&sent.id);
        assert!(!store.cancel(&sent.id));
    }

    #[test]
    fn delete_only_after_leaving_pending() {
        let store = store("delete");
        let pending = create(&store, 60);
        assert!(!store.delete(&pending.id));

        store.mark_sent(&pending.id);
        assert!(store.delete(&pending.id));
        assert!(store.get(&pending.id).is_none());
        assert!(!store.delete("missing"));
    }

    #[test]
    fn mark_seen_once_and_only_when_sent() {
        let store = store("seen");
        let broadcast = create(&store, -1);
        // Not sent yet.
        assert!(store.mark_seen(&broadcast.id).is_none());

        store.mark_sent(&broadcast.id);
        assert!(store.mark_seen(&broadcast.id).is_some());
        // Already seen.
        assert!(store.mark_seen(&broadcast.id).is_none());
    }

    #[test]
    fn listing_filters_seen_after_delay() {
        let store = store("listing");
        let broadcast = create(&store, -1);
        store.mark_sent(&broadcast.id);

        // Unseen sent broadcasts are listed with include_completed.
        assert_eq!(store.list(true, None).len(), 1);
        assert!(store.list(false, None).is_empty());

        // Backdate seen_at past the dismissal delay.
        {
            let mut broadcasts = store.broadcasts.lock().unwrap();
            broadcasts.get_mut(&broadcast.id).unwrap().seen_at =
                Some(Utc::now() - Duration::seconds(SEEN_DISMISSAL_DELAY_SECS + 5));
        }
        assert!(store.list(true, None).is_empty());
    }

    #[test]
    fn failed_transition_records_error() {
        let store = store("failed");
        let broadcast = create(&store, -1);
        store.mark_failed(&broadcast.id, "no recipients");

        let failed = store.get(&broadcast.id).unwrap();
        assert_eq!(failed.status, ScheduledBroadcastStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("no recipients"));
    }

    #[test]
    fn reload_round_trips() {
        let dir = temp_dir("reload");
        let id = {
            let store = BroadcastStore::load(&dir);
            store
                .create(
                    "net-1",
                    "t",
                    "m",
                    Utc::now(),
                    None,
                    "u1",
                    NotificationType::ScheduledMaintenance,
                    NotificationPriority::Medium,
                )
                .id
        };
        let reloaded = BroadcastStore::load(&dir);
        assert!(reloaded.get(&id).is_some());
    }
}
