use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

pub type PublishError = Box<dyn std::error::Error + Send + Sync>;

/// Notification payload mirrored onto the bus when a ticket is created.
/// Consumers downstream of the intake path only; the triage pipeline does
/// not depend on this being delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketCreatedPayload {
    pub event_id: String,
    pub ticket_id: i32,
    pub user_id: Option<i32>,
    pub subject: String,
    pub description: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TicketPublisher: Send + Sync {
    async fn publish_created(&self, payload: &TicketCreatedPayload) -> Result<(), PublishError>;
}

pub struct RedisStreamPublisher {
    client: redis::Client,
    stream: String,
}

impl RedisStreamPublisher {
    pub fn new(redis_url: &str, stream: String) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            stream,
        })
    }
}

#[async_trait]
impl TicketPublisher for RedisStreamPublisher {
    async fn publish_created(&self, payload: &TicketCreatedPayload) -> Result<(), PublishError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let body = serde_json::to_string(payload)?;
        let _: String = conn
            .xadd(
                &self.stream,
                "*",
                &[
                    ("ticket_id", payload.ticket_id.to_string()),
                    ("payload", body),
                ],
            )
            .await?;
        Ok(())
    }
}

/// Sink that drops notifications, used when `REDIS_URL` is set empty.
pub struct NullPublisher;

#[async_trait]
impl TicketPublisher for NullPublisher {
    async fn publish_created(&self, _payload: &TicketCreatedPayload) -> Result<(), PublishError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_publisher_accepts_payloads() {
        let payload = TicketCreatedPayload {
            event_id: "evt-1".into(),
            ticket_id: 1,
            user_id: None,
            subject: "Login broken".into(),
            description: "Cannot sign in".into(),
            source: "web".into(),
            created_at: Utc::now(),
        };
        assert!(NullPublisher.publish_created(&payload).await.is_ok());
    }
}
