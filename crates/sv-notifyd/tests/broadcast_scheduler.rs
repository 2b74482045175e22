//! End-to-end scheduled-broadcast lifecycle against a running scheduler
//! task: create a due broadcast, watch the scheduler deliver it to every
//! network member, then drive the post-send state machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sv_notifyd::anomaly::AnomalyDetector;
use sv_notifyd::broadcast::{BroadcastStore, BroadcastUpdate};
use sv_notifyd::channels::{EmailChannel, LogOnlyTransport};
use sv_notifyd::history::NotificationHistory;
use sv_notifyd::manager::NotificationManager;
use sv_notifyd::members::MemoryNetworkMembers;
use sv_notifyd::prefs::{EmailConfig, PreferencesStore};
use sv_telemetry::ShutdownSignal;
use sv_types::{
    NotificationPriority, NotificationType, ScheduledBroadcastStatus,
};

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sv-notifyd-scheduler-it-{}",
        uuid::Uuid::new_v4()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn build_manager() -> Arc<NotificationManager> {
    let dir = temp_dir();
    let members = Arc::new(MemoryNetworkMembers::new());
    members.add_network("net-1", "owner-1", &["member-2"]);

    let manager = Arc::new(NotificationManager::new(
        PreferencesStore::load(&dir),
        NotificationHistory::load(&dir),
        BroadcastStore::load(&dir),
        AnomalyDetector::load(&dir),
        vec![Arc::new(EmailChannel::new(Arc::new(LogOnlyTransport)))],
        members,
    ));

    let mut prefs = manager.prefs.network("net-1");
    prefs.email = EmailConfig {
        enabled: true,
        email_address: Some("ops@example.com".into()),
    };
    manager.prefs.update_network(prefs);
    manager
}

#[tokio::test]
async fn due_broadcast_is_sent_by_the_scheduler_loop() {
    let manager = build_manager();
    let shutdown = ShutdownSignal::new();
    let handle = manager.spawn_scheduler(Duration::from_millis(200), shutdown.clone());

    let broadcast = manager.broadcasts.create(
        "net-1",
        "Maintenance window",
        "Router reboot in one minute",
        Utc::now() + chrono::Duration::seconds(1),
        Some("America/New_York".into()),
        "owner-1",
        NotificationType::ScheduledMaintenance,
        NotificationPriority::High,
    );
    assert_eq!(broadcast.status, ScheduledBroadcastStatus::Pending);

    // Wait for the due time plus at least one scheduler tick.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = manager.broadcasts.get(&broadcast.id).unwrap();
        if current.status == ScheduledBroadcastStatus::Sent {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "broadcast was not sent in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // One record per recipient (owner + member, one channel each).
    assert_eq!(manager.history.len(), 2);

    // Post-send state machine: update refuses, cancel refuses, delete works.
    assert!(manager
        .broadcasts
        .update(&broadcast.id, BroadcastUpdate::default())
        .is_none());
    assert!(!manager.broadcasts.cancel(&broadcast.id));
    assert!(manager.broadcasts.delete(&broadcast.id));

    shutdown.trigger();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn cancelled_broadcast_is_never_delivered() {
    let manager = build_manager();
    let shutdown = ShutdownSignal::new();
    let handle = manager.spawn_scheduler(Duration::from_millis(100), shutdown.clone());

    let broadcast = manager.broadcasts.create(
        "net-1",
        "Never sent",
        "Cancelled before due",
        Utc::now() + chrono::Duration::seconds(2),
        None,
        "owner-1",
        NotificationType::ScheduledMaintenance,
        NotificationPriority::Medium,
    );
    assert!(manager.broadcasts.cancel(&broadcast.id));

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        manager.broadcasts.get(&broadcast.id).unwrap().status,
        ScheduledBroadcastStatus::Cancelled
    );
    assert!(manager.history.is_empty());

    shutdown.trigger();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}
