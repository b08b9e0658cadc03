use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// One outbox row: a single event addressed to a single subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_type: String,
    pub action_id: Uuid,
    pub dedupe_key: String,
    pub target_url: String,
    pub payload: serde_json::Value,
    /// pending, processing, delivered or failed
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    pub const MAX_ATTEMPTS: i32 = 8;

    pub fn new(
        event_type: &str,
        action_id: Uuid,
        dedupe_key: String,
        target_url: &str,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.to_string(),
            action_id,
            dedupe_key,
            target_url: target_url.to_string(),
            payload,
            status: "pending".to_string(),
            attempts: 0,
            max_attempts: Self::MAX_ATTEMPTS,
            next_retry_at: now,
            last_error: None,
            created_at: now,
            delivered_at: None,
        }
    }
}
