use anyhow::Context;
use async_trait::async_trait;
use cloudvps_common::bus::{Notification, NotificationEnvelope, CHANNEL_NOTIFICATION_EVENTS};
use redis::AsyncCommands;
use tokio::sync::Mutex;

pub const SOURCE: &str = "cloudvps-orchestrator";

/// Outbound notifications (welcome mail, support alerts). Delivery is best
/// effort; callers log failures and carry on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log only. Used when no bus is configured.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()> {
        match &notification {
            Notification::Provisioned(p) => tracing::info!(
                "📧 [notifications] {} for {}: {} ({})",
                notification.event_type().as_str(),
                p.owner_email,
                p.instance_name,
                p.ip_address.as_deref().unwrap_or("no ip yet")
            ),
            Notification::Failed(f) => tracing::warn!(
                "📧 [notifications] {} instance={} action={} kind={}: {}",
                notification.event_type().as_str(),
                f.instance_id,
                f.action,
                f.error_kind,
                f.message
            ),
        }
        Ok(())
    }
}

/// Publishes envelopes on the notification channel for the mailer/support consumers.
pub struct RedisNotificationSink {
    client: redis::Client,
}

impl RedisNotificationSink {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

pub fn create_client(redis_url: &str) -> anyhow::Result<redis::Client> {
    redis::Client::open(redis_url).context("Failed to create Redis client")
}

#[async_trait]
impl NotificationSink for RedisNotificationSink {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()> {
        let envelope = NotificationEnvelope::new(notification, SOURCE);
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis (publisher)")?;
        let payload = serde_json::to_string(&envelope)?;
        let _: () = conn.publish(CHANNEL_NOTIFICATION_EVENTS, payload).await?;
        tracing::debug!(
            "📤 [notifications] published {} ({})",
            envelope.event_type.as_str(),
            envelope.event_id
        );
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Default)]
pub struct RecordingNotificationSink {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Notification> {
        self.events.lock().await.clone()
    }

    pub async fn provisioned(&self) -> Vec<cloudvps_common::bus::VpsProvisioned> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|n| match n {
                Notification::Provisioned(p) => Some(p.clone()),
                Notification::Failed(_) => None,
            })
            .collect()
    }

    pub async fn failures(&self) -> Vec<cloudvps_common::bus::OperationFailed> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|n| match n {
                Notification::Failed(f) => Some(f.clone()),
                Notification::Provisioned(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn publish(&self, notification: Notification) -> anyhow::Result<()> {
        self.events.lock().await.push(notification);
        Ok(())
    }
}
