use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sv_telemetry::ShutdownSignal;
use sv_types::{
    NetworkEvent, NotificationChannel, NotificationPriority, NotificationRecord, NotificationType,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::anomaly::AnomalyDetector;
use crate::broadcast::BroadcastStore;
use crate::channels::NotificationChannelAdapter;
use crate::decision::{effective_priority, should_notify, RateWindows};
use crate::history::NotificationHistory;
use crate::members::NetworkMembers;
use crate::prefs::{NetworkPreferences, PreferencesStore};

// ---------------------------------------------------------------------------
// NotificationManager
// ---------------------------------------------------------------------------

/// Event ingress, policy evaluation, channel fan-out, history append, and
/// the scheduled-broadcast scheduler.
///
/// Explicitly constructed and injected; all state lives here, not in
/// globals. Channel adapter failures are always recovered locally and
/// recorded as failed [`NotificationRecord`]s.
pub struct NotificationManager {
    pub prefs: PreferencesStore,
    pub history: NotificationHistory,
    pub broadcasts: BroadcastStore,
    pub anomaly: AnomalyDetector,
    rate: RateWindows,
    channels: Vec<Arc<dyn NotificationChannelAdapter>>,
    members: Arc<dyn NetworkMembers>,
    /// Last observed online/offline state per device, for transition
    /// detection on ingress.
    device_states: Mutex<HashMap<String, String>>,
}

impl NotificationManager {
    pub fn new(
        prefs: PreferencesStore,
        history: NotificationHistory,
        broadcasts: BroadcastStore,
        anomaly: AnomalyDetector,
        channels: Vec<Arc<dyn NotificationChannelAdapter>>,
        members: Arc<dyn NetworkMembers>,
    ) -> Self {
        Self {
            prefs,
            history,
            broadcasts,
            anomaly,
            rate: RateWindows::new(),
            channels,
            members,
            device_states: Mutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Deliver `event` to one network's configured channels.
    ///
    /// With `force` false the full policy ladder applies; with `force` true
    /// only channel configuration gates delivery, and the send still lands
    /// in the rate window. Returns one record per attempted channel.
    pub async fn send_to_network(
        &self,
        network_id: &str,
        event: &NetworkEvent,
        force: bool,
    ) -> Vec<NotificationRecord> {
        let prefs = self.prefs.network(network_id);

        if !force {
            let decision = should_notify(
                &prefs,
                event,
                |ip| self.prefs.is_silenced(ip),
                &self.rate,
                Utc::now(),
            );
            if !decision.allowed {
                debug!(network_id, reason = %decision.reason, "notification suppressed");
                return Vec::new();
            }
        } else if !prefs.any_channel_configured() {
            debug!(network_id, "forced notification has no configured channel");
            return Vec::new();
        }

        let event_id = Uuid::new_v4().to_string();
        let records = self
            .dispatch_channels(&prefs, event, &event_id, None)
            .await;

        self.rate
            .record(network_id, prefs.max_notifications_per_hour, Utc::now());
        for record in &records {
            self.history.append(record.clone());
        }
        records
    }

    /// Deliver to every known network (falling back to networks that have
    /// preferences when the backend is unreachable).
    pub async fn broadcast_to_all_networks(
        &self,
        event: &NetworkEvent,
        force: bool,
    ) -> Vec<NotificationRecord> {
        let network_ids = match self.members.all_network_ids().await {
            Ok(ids) if !ids.is_empty() => ids,
            Ok(_) => self.prefs.network_ids(),
            Err(e) => {
                warn!(error = %e, "cannot enumerate networks, using known preferences");
                self.prefs.network_ids()
            }
        };

        let mut records = Vec::new();
        for network_id in network_ids {
            records.extend(self.send_to_network(&network_id, event, force).await);
        }
        records
    }

    /// Per-channel attempts for one recipient context. Adapter errors are
    /// captured into failed records, never propagated.
    async fn dispatch_channels(
        &self,
        prefs: &NetworkPreferences,
        event: &NetworkEvent,
        event_id: &str,
        recipient: Option<(&str, Option<&str>)>, // (user_id, address override)
    ) -> Vec<NotificationRecord> {
        let priority = effective_priority(prefs, event);
        let mut records = Vec::new();

        for adapter in &self.channels {
            if !adapter.is_configured(prefs) {
                continue;
            }
            let address = recipient.and_then(|(_, address)| address);
            let outcome = adapter.send(prefs, event, address).await;

            let mut record = NotificationRecord::new(
                event_id,
                adapter.channel(),
                outcome.is_ok(),
                priority,
                event.title.clone(),
                event.message.clone(),
            );
            record.network_id = Some(prefs.network_id.clone());
            record.user_id = recipient.map(|(user_id, _)| user_id.to_string());
            if let Err(e) = outcome {
                warn!(
                    network_id = %prefs.network_id,
                    channel = ?adapter.channel(),
                    error = %e,
                    "channel delivery failed"
                );
                record.error_message = Some(e.to_string());
            }
            records.push(record);
        }
        records
    }

    // -----------------------------------------------------------------------
    // Global (cross-network) notifications
    // -----------------------------------------------------------------------

    /// Deliver a platform-wide event (service up/down) to opted-in users.
    pub async fn send_global_notification(&self, event: &NetworkEvent) -> Vec<NotificationRecord> {
        if !event.event_type.is_global() {
            debug!(event_type = ?event.event_type, "not a global event type");
            return Vec::new();
        }

        let subscribers = self.prefs.global_subscribers(event.event_type);
        if subscribers.is_empty() {
            debug!("no global subscribers for event");
            return Vec::new();
        }

        let email_adapter = self
            .channels
            .iter()
            .find(|a| a.channel() == NotificationChannel::Email);
        let Some(adapter) = email_adapter else {
            return Vec::new();
        };

        let event_id = Uuid::new_v4().to_string();
        let mut records = Vec::new();
        for subscriber in subscribers {
            // Borrow the user's address through a synthetic single-user
            // preference view.
            let mut prefs = NetworkPreferences::for_network("");
            prefs.email.enabled = true;
            prefs.email.email_address = subscriber.email_address.clone();

            let outcome = adapter
                .send(&prefs, event, subscriber.email_address.as_deref())
                .await;
            let mut record = NotificationRecord::new(
                &event_id,
                NotificationChannel::Email,
                outcome.is_ok(),
                event.priority.unwrap_or(NotificationPriority::High),
                event.title.clone(),
                event.message.clone(),
            );
            record.user_id = Some(subscriber.user_id.clone());
            if let Err(e) = outcome {
                record.error_message = Some(e.to_string());
            }
            self.history.append(record.clone());
            records.push(record);
        }
        records
    }

    // -----------------------------------------------------------------------
    // Test notifications
    // -----------------------------------------------------------------------

    /// Send a test event over one channel, honoring channel configuration
    /// only.
    pub async fn send_test_notification(
        &self,
        network_id: &str,
        channel: NotificationChannel,
    ) -> Result<NotificationRecord, String> {
        let prefs = self.prefs.network(network_id);
        let adapter = self
            .channels
            .iter()
            .find(|a| a.channel() == channel)
            .ok_or_else(|| "channel not available".to_string())?;

        if !adapter.is_configured(&prefs) {
            return Err(match channel {
                NotificationChannel::Email => "Email is not configured for this network".into(),
                NotificationChannel::Discord => "Discord is not configured for this network".into(),
            });
        }

        let mut event = NetworkEvent::new(
            NotificationType::Test,
            "Test notification",
            "This is a test notification from surveyor.",
        );
        event.priority = Some(NotificationPriority::Low);

        let event_id = Uuid::new_v4().to_string();
        let outcome = adapter.send(&prefs, &event, None).await;
        let mut record = NotificationRecord::new(
            event_id,
            channel,
            outcome.is_ok(),
            NotificationPriority::Low,
            event.title.clone(),
            event.message.clone(),
        );
        record.network_id = Some(network_id.to_string());
        if let Err(e) = outcome {
            record.error_message = Some(e.to_string());
        }
        self.history.append(record.clone());
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Health-check ingress
    // -----------------------------------------------------------------------

    /// Fold a health check into the anomaly baseline and emit transition
    /// events (offline/online) into the pipeline.
    pub async fn process_health_check(
        &self,
        device_ip: &str,
        success: bool,
        latency_ms: Option<f64>,
        packet_loss: Option<f64>,
        device_name: Option<&str>,
        previous_state: Option<&str>,
    ) -> Vec<NotificationRecord> {
        let now = Utc::now();
        self.anomaly
            .train(device_ip, success, latency_ms, packet_loss, now);

        let current = if success { "online" } else { "offline" };
        let previous = {
            let mut states = self.device_states.lock().unwrap();
            let previous = previous_state
                .map(String::from)
                .or_else(|| states.get(device_ip).cloned());
            states.insert(device_ip.to_string(), current.to_string());
            previous
        };

        let event = match (previous.as_deref(), current) {
            (Some("online"), "offline") => {
                let name = device_name.unwrap_or(device_ip);
                let mut event = NetworkEvent::new(
                    NotificationType::DeviceOffline,
                    format!("Device offline: {name}"),
                    format!("{name} ({device_ip}) stopped responding to health checks."),
                );
                event.device_ip = Some(device_ip.to_string());
                event.device_name = device_name.map(String::from);
                event.previous_state = previous.clone();
                event.current_state = Some(current.to_string());
                event.priority = Some(NotificationPriority::High);
                Some(event)
            }
            (Some("offline"), "online") => {
                let name = device_name.unwrap_or(device_ip);
                let mut event = NetworkEvent::new(
                    NotificationType::DeviceOnline,
                    format!("Device back online: {name}"),
                    format!("{name} ({device_ip}) is responding again."),
                );
                event.device_ip = Some(device_ip.to_string());
                event.device_name = device_name.map(String::from);
                event.previous_state = previous.clone();
                event.current_state = Some(current.to_string());
                event.priority = Some(NotificationPriority::Medium);
                Some(event)
            }
            _ => None,
        };

        match event {
            Some(event) => self.broadcast_to_all_networks(&event, false).await,
            None => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Scheduled broadcasts
    // -----------------------------------------------------------------------

    /// One scheduler pass: deliver every due pending broadcast.
    pub async fn process_due_broadcasts(&self) {
        for broadcast in self.broadcasts.due(Utc::now()) {
            self.send_scheduled_broadcast(&broadcast.id).await;
        }
    }

    /// Deliver one broadcast to every member of its network.
    ///
    /// Schedule semantics override the policy ladder (`force`), so quiet
    /// hours or minimum priority never hold a maintenance window hostage.
    /// Recipient-enumeration failure transitions the broadcast to failed.
    pub async fn send_scheduled_broadcast(&self, broadcast_id: &str) {
        let Some(broadcast) = self.broadcasts.get(broadcast_id) else {
            warn!(broadcast_id, "broadcast vanished before delivery");
            return;
        };
        if broadcast.status != sv_types::ScheduledBroadcastStatus::Pending {
            return;
        }

        let member_ids = match self.members.member_user_ids(&broadcast.network_id).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(broadcast_id, error = %e, "recipient enumeration failed");
                self.broadcasts.mark_failed(broadcast_id, &e.to_string());
                return;
            }
        };

        let mut event = NetworkEvent::new(
            broadcast.event_type,
            broadcast.title.clone(),
            broadcast.message.clone(),
        );
        event.priority = Some(broadcast.priority);

        let prefs = self.prefs.network(&broadcast.network_id);
        let event_id = Uuid::new_v4().to_string();
        let mut delivered = 0usize;

        for member_id in &member_ids {
            // Deliver to the member's own address when they registered one.
            let address = {
                let global = self.prefs.global_for_user(member_id);
                global.email_address
            };
            let records = self
                .dispatch_channels(
                    &prefs,
                    &event,
                    &event_id,
                    Some((member_id.as_str(), address.as_deref())),
                )
                .await;
            delivered += records.len();
            for record in records {
                self.history.append(record);
            }
        }
        self.rate.record(
            &broadcast.network_id,
            prefs.max_notifications_per_hour,
            Utc::now(),
        );

        self.broadcasts.mark_sent(broadcast_id);
        info!(
            broadcast_id,
            recipients = member_ids.len(),
            records = delivered,
            "scheduled broadcast sent"
        );
    }

    /// Spawn the scheduler loop; ticks every `interval` until shutdown.
    pub fn spawn_scheduler(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: ShutdownSignal,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "broadcast scheduler started");
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("broadcast scheduler stopping");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        manager.process_due_broadcasts().await;
                    }
                }
            }
        })
    }

    /// Owner map for the preference migration, fetched from the backend.
    pub async fn migrate_global_preferences(&self) -> usize {
        match self.members.network_owners().await {
            Ok(owners) => self.prefs.migrate_networks_to_global(&owners),
            Err(e) => {
                warn!(error = %e, "cannot fetch owners; skipping preference migration");
                0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
