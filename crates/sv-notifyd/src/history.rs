use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use sv_types::{NotificationChannel, NotificationRecord};
use tracing::{error, warn};

/// The ring keeps the most recent deliveries only.
const MAX_HISTORY: usize = 1000;
const HISTORY_FILE: &str = "history.json";

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub by_channel: std::collections::HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// NotificationHistory
// ---------------------------------------------------------------------------

/// Append-only bounded ring of delivery records, mirrored to a JSON file.
///
/// Loading migrates legacy records that predate multi-tenancy (missing
/// `network_id` coerces to null) and drops records with invalid shape.
/// Saving is best-effort; a write failure never fails the delivery that
/// produced the record.
pub struct NotificationHistory {
    path: PathBuf,
    ring: Mutex<VecDeque<NotificationRecord>>,
}

impl NotificationHistory {
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let path = data_dir.into().join(HISTORY_FILE);
        let ring = Mutex::new(load_records(&path));
        Self { path, ring }
    }

    /// Append a record, evicting the oldest entries past the cap.
    pub fn append(&self, record: NotificationRecord) {
        {
            let mut ring = self.ring.lock().unwrap();
            while ring.len() >= MAX_HISTORY {
                ring.pop_front();
            }
            ring.push_back(record);
        }
        self.save();
    }

    /// Most recent records first, optionally scoped to one network.
    pub fn recent(&self, limit: usize, network_id: Option<&str>) -> Vec<NotificationRecord> {
        let ring = self.ring.lock().unwrap();
        ring.iter()
            .rev()
            .filter(|r| match network_id {
                Some(id) => r.network_id.as_deref() == Some(id),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> HistoryStats {
        let ring = self.ring.lock().unwrap();
        let mut stats = HistoryStats {
            total: ring.len(),
            ..HistoryStats::default()
        };
        for record in ring.iter() {
            if record.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            let channel = match record.channel {
                NotificationChannel::Email => "email",
                NotificationChannel::Discord => "discord",
            };
            *stats.by_channel.entry(channel.to_string()).or_insert(0) += 1;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self) {
        let snapshot: Vec<NotificationRecord> =
            self.ring.lock().unwrap().iter().cloned().collect();
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let payload = serde_json::to_string(&snapshot)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            std::fs::write(&self.path, payload)
        };
        if let Err(e) = write() {
            error!(path = %self.path.display(), error = %e, "failed to persist history");
        }
    }
}

fn load_records(path: &Path) -> VecDeque<NotificationRecord> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return VecDeque::new();
    };
    let Ok(entries) = serde_json::from_str::<Vec<Value>>(&raw) else {
        warn!(path = %path.display(), "history file did not parse, starting empty");
        return VecDeque::new();
    };

    let mut ring = VecDeque::new();
    for entry in entries {
        // `network_id`/`user_id` default to null for pre-multi-tenant
        // records via the serde defaults on NotificationRecord.
        match serde_json::from_value::<NotificationRecord>(entry) {
            Ok(record) => {
                if ring.len() >= MAX_HISTORY {
                    ring.pop_front();
                }
                ring.push_back(record);
            }
            Err(e) => warn!(error = %e, "dropping invalid history record"),
        }
    }
    ring
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
