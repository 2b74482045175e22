use async_trait::async_trait;
use sv_types::{NetworkEvent, NotificationChannel, NotificationPriority};
use thiserror::Error;
use tracing::{debug, warn};

use crate::prefs::NetworkPreferences;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel not configured")]
    NotConfigured,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

// ---------------------------------------------------------------------------
// Channel adapter trait
// ---------------------------------------------------------------------------

/// One delivery channel. Adapter failures are recorded as failed
/// notification records by the manager, never propagated further.
#[async_trait]
pub trait NotificationChannelAdapter: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    /// Whether the channel is enabled and fully configured in these
    /// preferences.
    fn is_configured(&self, prefs: &NetworkPreferences) -> bool;

    /// Deliver `event` using the channel settings in `prefs`. `recipient`
    /// overrides the preference-level address when delivering to a specific
    /// member (scheduled broadcasts, global mails).
    async fn send(
        &self,
        prefs: &NetworkPreferences,
        event: &NetworkEvent,
        recipient: Option<&str>,
    ) -> Result<(), ChannelError>;
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

/// Mail delivery seam. Transport internals (SMTP, API relays) live behind
/// this trait; the channel formats the message and hands it over.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_mail(
        &self,
        to: &str,
        subject: &str,
        text_body: &str,
    ) -> Result<(), ChannelError>;
}

/// Transport used when no mail relay is configured: logs and reports
/// success so development flows exercise the full pipeline.
pub struct LogOnlyTransport;

#[async_trait]
impl EmailTransport for LogOnlyTransport {
    async fn send_mail(
        &self,
        to: &str,
        subject: &str,
        _text_body: &str,
    ) -> Result<(), ChannelError> {
        debug!(to, subject, "mail transport not configured, logging only");
        Ok(())
    }
}

pub struct EmailChannel {
    transport: std::sync::Arc<dyn EmailTransport>,
}

impl EmailChannel {
    pub fn new(transport: std::sync::Arc<dyn EmailTransport>) -> Self {
        Self { transport }
    }

    fn subject(event: &NetworkEvent) -> String {
        let tag = match event.priority.unwrap_or(NotificationPriority::Medium) {
            NotificationPriority::Critical => "[CRITICAL] ",
            NotificationPriority::High => "[HIGH] ",
            _ => "",
        };
        format!("{tag}{}", event.title)
    }

    fn body(event: &NetworkEvent) -> String {
        let mut body = event.message.clone();
        if let Some(device) = event.device_name.as_deref() {
            body.push_str(&format!("\n\nDevice: {device}"));
        }
        if let Some(ip) = event.device_ip.as_deref() {
            body.push_str(&format!("\nIP: {ip}"));
        }
        if let (Some(prev), Some(curr)) =
            (event.previous_state.as_deref(), event.current_state.as_deref())
        {
            body.push_str(&format!("\nState: {prev} -> {curr}"));
        }
        body.push_str(&format!("\nAt: {}", event.timestamp.to_rfc3339()));
        body
    }
}

#[async_trait]
impl NotificationChannelAdapter for EmailChannel {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Email
    }

    fn is_configured(&self, prefs: &NetworkPreferences) -> bool {
        prefs.email.is_configured()
    }

    async fn send(
        &self,
        prefs: &NetworkPreferences,
        event: &NetworkEvent,
        recipient: Option<&str>,
    ) -> Result<(), ChannelError> {
        let to = recipient
            .or(prefs.email.email_address.as_deref())
            .filter(|a| !a.is_empty())
            .ok_or(ChannelError::NotConfigured)?;

        self.transport
            .send_mail(to, &Self::subject(event), &Self::body(event))
            .await
    }
}

// ---------------------------------------------------------------------------
// Discord
// ---------------------------------------------------------------------------

/// Posts events to the network's configured webhook URL.
pub struct DiscordChannel {
    http: reqwest::Client,
}

impl DiscordChannel {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    fn payload(event: &NetworkEvent) -> serde_json::Value {
        let color = match event.priority.unwrap_or(NotificationPriority::Medium) {
            NotificationPriority::Critical => 0xe74c3c,
            NotificationPriority::High => 0xe67e22,
            NotificationPriority::Medium => 0xf1c40f,
            NotificationPriority::Low => 0x95a5a6,
        };
        serde_json::json!({
            "embeds": [{
                "title": event.title,
                "description": event.message,
                "color": color,
                "timestamp": event.timestamp.to_rfc3339(),
            }]
        })
    }
}

impl Default for DiscordChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannelAdapter for DiscordChannel {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Discord
    }

    fn is_configured(&self, prefs: &NetworkPreferences) -> bool {
        prefs.discord.is_configured()
    }

    async fn send(
        &self,
        prefs: &NetworkPreferences,
        event: &NetworkEvent,
        _recipient: Option<&str>,
    ) -> Result<(), ChannelError> {
        let url = prefs
            .discord
            .webhook_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(ChannelError::NotConfigured)?;

        let response = self
            .http
            .post(url)
            .json(&Self::payload(event))
            .send()
            .await
            .map_err(|e| ChannelError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "discord webhook rejected payload");
            return Err(ChannelError::Delivery(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
