use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, NaiveTime, Utc};
use chrono_tz::Tz;
use sv_types::{NetworkEvent, NotificationPriority};
use tracing::debug;

use crate::prefs::NetworkPreferences;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "allowed".into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Priorities
// ---------------------------------------------------------------------------

/// Effective priority for an event: the per-type override wins, then the
/// event's own priority, then medium.
pub fn effective_priority(
    prefs: &NetworkPreferences,
    event: &NetworkEvent,
) -> NotificationPriority {
    prefs
        .notification_type_priorities
        .get(&event.event_type)
        .copied()
        .or(event.priority)
        .unwrap_or(NotificationPriority::Medium)
}

// ---------------------------------------------------------------------------
// Quiet hours
// ---------------------------------------------------------------------------

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

/// The wall-clock "now" in the user's declared timezone. An invalid or
/// missing timezone falls back to server-local time; comparing against UTC
/// here would shift every user's window by their offset.
pub fn current_time_for_zone(timezone: Option<&str>, now_utc: DateTime<Utc>) -> NaiveTime {
    match timezone.and_then(|name| name.parse::<Tz>().ok()) {
        Some(tz) => now_utc.with_timezone(&tz).time(),
        None => now_utc.with_timezone(&Local).time(),
    }
}

/// Whether `now` falls inside the quiet window. Both boundaries are
/// inclusive; a window whose start is after its end wraps overnight.
pub fn in_quiet_window(start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    if start <= end {
        start <= now && now <= end
    } else {
        now >= start || now <= end
    }
}

/// Evaluate quiet hours for a preference set at the given UTC instant.
pub fn is_quiet_hours(prefs: &NetworkPreferences, now_utc: DateTime<Utc>) -> bool {
    if !prefs.quiet_hours_enabled {
        return false;
    }
    let (Some(start), Some(end)) = (
        prefs.quiet_hours_start.as_deref().and_then(parse_hhmm),
        prefs.quiet_hours_end.as_deref().and_then(parse_hhmm),
    ) else {
        return false;
    };
    let now = current_time_for_zone(prefs.timezone.as_deref(), now_utc);
    in_quiet_window(start, end, now)
}

// ---------------------------------------------------------------------------
// Rate windows
// ---------------------------------------------------------------------------

/// Sliding one-hour send windows per network.
///
/// Each window is a FIFO of recent send timestamps, bounded by the
/// network's hourly cap; entries older than an hour fall off on access.
#[derive(Default)]
pub struct RateWindows {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateWindows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another send is admissible under `max_per_hour`.
    pub fn check(&self, network_id: &str, max_per_hour: usize, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(network_id.to_string()).or_default();
        prune(window, now);
        window.len() < max_per_hour
    }

    /// Record a send into the window.
    pub fn record(&self, network_id: &str, max_per_hour: usize, now: DateTime<Utc>) {
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(network_id.to_string()).or_default();
        prune(window, now);
        while window.len() >= max_per_hour.max(1) {
            window.pop_front();
        }
        window.push_back(now);
    }

    pub fn len(&self, network_id: &str) -> usize {
        self.windows
            .lock()
            .unwrap()
            .get(network_id)
            .map(|w| w.len())
            .unwrap_or(0)
    }
}

fn prune(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - Duration::hours(1);
    while window.front().is_some_and(|t| *t < cutoff) {
        window.pop_front();
    }
}

// ---------------------------------------------------------------------------
// should_notify
// ---------------------------------------------------------------------------

/// Policy evaluation for one (network-preferences, event) pair.
///
/// The checks run in a fixed order; the first failing one names the reason.
/// Callers holding a `force` flag skip this entirely but must still verify
/// channel configuration and record into the rate window.
pub fn should_notify(
    prefs: &NetworkPreferences,
    event: &NetworkEvent,
    silenced: impl Fn(&str) -> bool,
    rate: &RateWindows,
    now_utc: DateTime<Utc>,
) -> Decision {
    if !prefs.enabled {
        return Decision::deny("notifications disabled");
    }
    if !prefs.any_channel_configured() {
        return Decision::deny("no notification channels enabled");
    }
    if !prefs.enabled_notification_types.contains(&event.event_type) {
        return Decision::deny(format!("event type {:?} not enabled", event.event_type));
    }
    if let Some(ip) = event.device_ip.as_deref() {
        if silenced(ip) {
            return Decision::deny(format!("device {ip} silenced"));
        }
    }

    let priority = effective_priority(prefs, event);
    if priority < prefs.minimum_priority {
        return Decision::deny("priority below minimum");
    }

    if is_quiet_hours(prefs, now_utc) {
        let bypassed = prefs
            .quiet_hours_bypass_priority
            .is_some_and(|bypass| priority >= bypass);
        if !bypassed {
            debug!(network_id = %prefs.network_id, "suppressed by quiet hours");
            return Decision::deny("quiet hours");
        }
    }

    if !rate.check(&prefs.network_id, prefs.max_notifications_per_hour, now_utc) {
        return Decision::deny("rate limit reached");
    }

    Decision::allow()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
