use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sv_types::{NotificationPriority, NotificationType};
use tracing::{debug, error, info, warn};

const PREFERENCES_FILE: &str = "preferences.json";
const GLOBAL_PREFERENCES_FILE: &str = "global_preferences.json";
const SILENCED_DEVICES_FILE: &str = "silenced_devices.json";

// ---------------------------------------------------------------------------
// Channel configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub email_address: Option<String>,
}

impl EmailConfig {
    pub fn is_configured(&self) -> bool {
        self.enabled && self.email_address.as_deref().is_some_and(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

impl DiscordConfig {
    pub fn is_configured(&self) -> bool {
        self.enabled && self.webhook_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

// ---------------------------------------------------------------------------
// NetworkPreferences
// ---------------------------------------------------------------------------

fn default_enabled() -> bool {
    true
}

fn default_enabled_types() -> Vec<NotificationType> {
    vec![
        NotificationType::DeviceOffline,
        NotificationType::DeviceOnline,
        NotificationType::DeviceDegraded,
        NotificationType::HighLatency,
        NotificationType::PacketLoss,
        NotificationType::NetworkDown,
        NotificationType::NetworkUp,
        NotificationType::ScheduledMaintenance,
        NotificationType::AnomalyDetected,
        NotificationType::UpdateAvailable,
    ]
}

fn default_max_per_hour() -> usize {
    20
}

/// Per-network notification settings, created lazily with defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPreferences {
    pub network_id: String,
    /// Master switch.
    pub enabled: bool,
    pub email: EmailConfig,
    pub discord: DiscordConfig,
    pub enabled_notification_types: Vec<NotificationType>,
    /// Per-type priority override; falls back to the event's own priority.
    pub notification_type_priorities: HashMap<NotificationType, NotificationPriority>,
    pub minimum_priority: NotificationPriority,
    pub quiet_hours_enabled: bool,
    /// "HH:MM", inclusive window boundary.
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    /// Events at or above this priority ignore quiet hours.
    pub quiet_hours_bypass_priority: Option<NotificationPriority>,
    pub max_notifications_per_hour: usize,
    /// IANA timezone for quiet-hours comparisons.
    pub timezone: Option<String>,
}

impl Default for NetworkPreferences {
    fn default() -> Self {
        Self {
            network_id: String::new(),
            enabled: default_enabled(),
            email: EmailConfig::default(),
            discord: DiscordConfig::default(),
            enabled_notification_types: default_enabled_types(),
            notification_type_priorities: HashMap::new(),
            minimum_priority: NotificationPriority::Low,
            quiet_hours_enabled: false,
            quiet_hours_start: None,
            quiet_hours_end: None,
            quiet_hours_bypass_priority: None,
            max_notifications_per_hour: default_max_per_hour(),
            timezone: None,
        }
    }
}

impl NetworkPreferences {
    pub fn for_network(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            ..Self::default()
        }
    }

    /// At least one delivery channel is enabled and fully configured.
    pub fn any_channel_configured(&self) -> bool {
        self.email.is_configured() || self.discord.is_configured()
    }
}

// ---------------------------------------------------------------------------
// GlobalUserPreferences
// ---------------------------------------------------------------------------

/// Per-user cross-network toggles, currently the platform up/down emails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalUserPreferences {
    pub user_id: String,
    pub service_up_email: bool,
    pub service_down_email: bool,
    pub email_address: Option<String>,
}

// ---------------------------------------------------------------------------
// PreferencesStore
// ---------------------------------------------------------------------------

/// In-memory preference maps flushed to JSON files.
///
/// Persistence is best-effort: save errors are logged and never fail the
/// mutating operation. The files are dictionaries keyed by entity id.
pub struct PreferencesStore {
    data_dir: PathBuf,
    networks: Mutex<HashMap<String, NetworkPreferences>>,
    global: Mutex<HashMap<String, GlobalUserPreferences>>,
    silenced: Mutex<HashSet<String>>,
}

impl PreferencesStore {
    /// Load preference state from `data_dir`, tolerating missing or
    /// malformed files.
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let store = Self {
            networks: Mutex::new(load_network_prefs(&data_dir.join(PREFERENCES_FILE))),
            global: Mutex::new(load_json_map(&data_dir.join(GLOBAL_PREFERENCES_FILE))),
            silenced: Mutex::new(load_silenced(&data_dir.join(SILENCED_DEVICES_FILE))),
            data_dir,
        };
        info!(
            networks = store.networks.lock().unwrap().len(),
            users = store.global.lock().unwrap().len(),
            silenced = store.silenced.lock().unwrap().len(),
            "preferences loaded"
        );
        store
    }

    // --- per-network preferences ---

    /// Fetch a network's preferences, creating defaults on first access.
    pub fn network(&self, network_id: &str) -> NetworkPreferences {
        let mut networks = self.networks.lock().unwrap();
        networks
            .entry(network_id.to_string())
            .or_insert_with(|| NetworkPreferences::for_network(network_id))
            .clone()
    }

    pub fn network_ids(&self) -> Vec<String> {
        self.networks.lock().unwrap().keys().cloned().collect()
    }

    pub fn update_network(&self, prefs: NetworkPreferences) {
        {
            let mut networks = self.networks.lock().unwrap();
            networks.insert(prefs.network_id.clone(), prefs);
        }
        self.save_networks();
    }

    pub fn delete_network(&self, network_id: &str) -> bool {
        let removed = self.networks.lock().unwrap().remove(network_id).is_some();
        if removed {
            self.save_networks();
        }
        removed
    }

    // --- global user preferences ---

    pub fn global_for_user(&self, user_id: &str) -> GlobalUserPreferences {
        let mut global = self.global.lock().unwrap();
        global
            .entry(user_id.to_string())
            .or_insert_with(|| GlobalUserPreferences {
                user_id: user_id.to_string(),
                ..GlobalUserPreferences::default()
            })
            .clone()
    }

    pub fn update_global(&self, prefs: GlobalUserPreferences) {
        {
            let mut global = self.global.lock().unwrap();
            global.insert(prefs.user_id.clone(), prefs);
        }
        self.save_global();
    }

    /// Users opted in to the given platform-wide event type, with an email
    /// address to deliver to.
    pub fn global_subscribers(&self, event_type: NotificationType) -> Vec<GlobalUserPreferences> {
        let global = self.global.lock().unwrap();
        global
            .values()
            .filter(|p| match event_type {
                NotificationType::ServiceUp => p.service_up_email,
                NotificationType::ServiceDown => p.service_down_email,
                _ => false,
            })
            .filter(|p| p.email_address.as_deref().is_some_and(|a| !a.is_empty()))
            .cloned()
            .collect()
    }

    /// Seed global preferences from per-network email configs: any network
    /// with a configured email gets its address registered for the owner's
    /// platform up/down mails. Running it twice yields identical state.
    pub fn migrate_networks_to_global(
        &self,
        owners: &HashMap<String, String>, // network_id -> owner user id
    ) -> usize {
        let networks = self.networks.lock().unwrap().clone();
        let mut migrated = 0;
        for (network_id, prefs) in &networks {
            let Some(owner) = owners.get(network_id) else {
                debug!(network_id, "skipping migration, no owner known");
                continue;
            };
            let Some(address) = prefs
                .email
                .email_address
                .as_deref()
                .filter(|a| !a.is_empty())
            else {
                continue;
            };

            let mut global = self.global.lock().unwrap();
            if global.contains_key(owner) {
                continue;
            }
            global.insert(
                owner.clone(),
                GlobalUserPreferences {
                    user_id: owner.clone(),
                    service_up_email: true,
                    service_down_email: true,
                    email_address: Some(address.to_string()),
                },
            );
            migrated += 1;
        }
        if migrated > 0 {
            self.save_global();
            info!(migrated, "migrated network emails to global preferences");
        }
        migrated
    }

    // --- silenced devices ---

    pub fn is_silenced(&self, device_ip: &str) -> bool {
        self.silenced.lock().unwrap().contains(device_ip)
    }

    /// Silence a device. Returns `false` when it was already silenced.
    pub fn silence(&self, device_ip: &str) -> bool {
        let inserted = self.silenced.lock().unwrap().insert(device_ip.to_string());
        if inserted {
            self.save_silenced();
        }
        inserted
    }

    /// Unsilence a device. Returns `false` when it was not silenced.
    pub fn unsilence(&self, device_ip: &str) -> bool {
        let removed = self.silenced.lock().unwrap().remove(device_ip);
        if removed {
            self.save_silenced();
        }
        removed
    }

    pub fn silenced_devices(&self) -> HashSet<String> {
        self.silenced.lock().unwrap().clone()
    }

    /// Replace the whole silenced set.
    pub fn set_silenced_devices(&self, devices: HashSet<String>) {
        *self.silenced.lock().unwrap() = devices;
        self.save_silenced();
    }

    // --- persistence ---

    fn save_networks(&self) {
        let snapshot = self.networks.lock().unwrap().clone();
        save_json(&self.data_dir.join(PREFERENCES_FILE), &snapshot);
    }

    fn save_global(&self) {
        let snapshot = self.global.lock().unwrap().clone();
        save_json(&self.data_dir.join(GLOBAL_PREFERENCES_FILE), &snapshot);
    }

    fn save_silenced(&self) {
        let snapshot: Vec<String> = self.silenced.lock().unwrap().iter().cloned().collect();
        save_json(&self.data_dir.join(SILENCED_DEVICES_FILE), &snapshot);
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn save_json<T: Serialize>(path: &Path, value: &T) {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(value)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        std::fs::write(path, payload)
    };
    if let Err(e) = write() {
        error!(path = %path.display(), error = %e, "failed to persist state");
    }
}

fn load_json_map<T: for<'de> Deserialize<'de>>(path: &Path) -> HashMap<String, T> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    let Ok(entries) = serde_json::from_str::<HashMap<String, Value>>(&raw) else {
        warn!(path = %path.display(), "state file did not parse, starting empty");
        return HashMap::new();
    };
    entries
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value(value) {
            Ok(parsed) => Some((key, parsed)),
            Err(e) => {
                warn!(key, error = %e, "dropping invalid entry");
                None
            }
        })
        .collect()
}

/// Network preferences predate multi-tenancy: old files were keyed by
/// user id and lack `network_id`. Those entries are dropped on load.
fn load_network_prefs(path: &Path) -> HashMap<String, NetworkPreferences> {
    let entries: HashMap<String, NetworkPreferences> = load_json_map(path);
    entries
        .into_iter()
        .filter(|(key, prefs)| {
            if prefs.network_id.is_empty() || prefs.network_id != *key {
                warn!(key, "dropping pre-multi-tenant preference entry");
                false
            } else {
                true
            }
        })
        .collect()
}

fn load_silenced(path: &Path) -> HashSet<String> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashSet::new();
    };
    serde_json::from_str::<Vec<String>>(&raw)
        .map(|v| v.into_iter().collect())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sv-notifyd-prefs-{tag}-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn network_prefs_are_created_with_defaults() {
        let store = PreferencesStore::load(temp_dir("defaults"));
        let prefs = store.network("net-1");
        assert_eq!(prefs.network_id, "net-1");
        assert!(prefs.enabled);
        assert_eq!(prefs.minimum_priority, NotificationPriority::Low);
        assert_eq!(prefs.max_notifications_per_hour, 20);
        assert!(!prefs.any_channel_configured());
    }

    #[test]
    fn update_and_reload_round_trips() {
        let dir = temp_dir("roundtrip");
        {
            let store = PreferencesStore::load(&dir);
            let mut prefs = store.network("net-1");
            prefs.email = EmailConfig {
                enabled: true,
                email_address: Some("ops@example.com".into()),
            };
            prefs.quiet_hours_enabled = true;
            prefs.quiet_hours_start = Some("22:00".into());
            prefs.quiet_hours_end = Some("07:00".into());
            store.update_network(prefs);
        }

        let reloaded = PreferencesStore::load(&dir);
        let prefs = reloaded.network("net-1");
        assert!(prefs.email.is_configured());
        assert_eq!(prefs.quiet_hours_start.as_deref(), Some("22:00"));
    }

    #[test]
    fn old_user_keyed_entries_are_dropped_on_load() {
        let dir = temp_dir("legacy");
        let legacy = serde_json::json!({
            "user-42": {"enabled": true, "email": {"enabled": true}},
            "net-1": {"network_id": "net-1", "enabled": true}
        });
        std::fs::write(
            dir.join(PREFERENCES_FILE),
            serde_json::to_string(&legacy).unwrap(),
        )
        .unwrap();

        let store = PreferencesStore::load(&dir);
        assert_eq!(store.network_ids(), vec!["net-1".to_string()]);
    }

    #[test]
    fn malformed_file_starts_empty() {
        let dir = temp_dir("malformed");
        std::fs::write(dir.join(PREFERENCES_FILE), "{not json").unwrap();
        let store = PreferencesStore::load(&dir);
        assert!(store.network_ids().is_empty());
    }

    #[test]
    fn silence_round_trip() {
        let store = PreferencesStore::load(temp_dir("silence"));
        assert!(store.silence("192.168.1.50"));
        assert!(!store.silence("192.168.1.50"));
        assert!(store.is_silenced("192.168.1.50"));
        assert!(store.unsilence("192.168.1.50"));
        assert!(!store.unsilence("192.168.1.50"));
    }

    #[test]
    fn set_silenced_replaces_wholesale() {
        let store = PreferencesStore::load(temp_dir("silence-set"));
        store.silence("10.0.0.1");
        store.set_silenced_devices(["10.0.0.2".to_string(), "10.0.0.3".to_string()].into());
        assert!(!store.is_silenced("10.0.0.1"));
        assert_eq!(store.silenced_devices().len(), 2);
    }

    #[test]
    fn global_subscribers_filter_by_type_and_email() {
        let store = PreferencesStore::load(temp_dir("global"));
        store.update_global(GlobalUserPreferences {
            user_id: "u1".into(),
            service_up_email: true,
            service_down_email: false,
            email_address: Some("a@example.com".into()),
        });
        store.update_global(GlobalUserPreferences {
            user_id: "u2".into(),
            service_up_email: true,
            service_down_email: true,
            email_address: None, // no address, never delivered
        });

        let up = store.global_subscribers(NotificationType::ServiceUp);
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].user_id, "u1");
        assert!(store
            .global_subscribers(NotificationType::ServiceDown)
            .is_empty());
        assert!(store
            .global_subscribers(NotificationType::DeviceOffline)
            .is_empty());
    }

    #[test]
    fn migration_is_idempotent() {
        let store = PreferencesStore::load(temp_dir("migrate"));
        let mut prefs = store.network("net-1");
        prefs.email = EmailConfig {
            enabled: true,
            email_address: Some("owner@example.com".into()),
        };
        store.update_network(prefs);
        // A network without email is skipped.
        store.network("net-2");

        let owners: HashMap<String, String> = [
            ("net-1".to_string(), "u1".to_string()),
            ("net-2".to_string(), "u2".to_string()),
        ]
        .into();

        assert_eq!(store.migrate_networks_to_global(&owners), 1);
        let first = store.global_for_user("u1");
        assert!(first.service_down_email);

        // Second run changes nothing.
        assert_eq!(store.migrate_networks_to_global(&owners), 0);
        assert_eq!(store.global_for_user("u1"), first);
    }

    #[test]
    fn migration_skips_networks_without_owner() {
        let store = PreferencesStore::load(temp_dir("migrate-noowner"));
        let mut prefs = store.network("net-1");
        prefs.email.enabled = true;
        prefs.email.email_address = Some("x@example.com".into());
        store.update_network(prefs);

        assert_eq!(store.migrate_networks_to_global(&HashMap::new()), 0);
    }
}
