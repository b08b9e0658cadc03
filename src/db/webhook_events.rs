use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{StoreError, event_backoff};
use crate::models::WebhookEvent;

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    event_type: String,
    action_id: Uuid,
    dedupe_key: String,
    target_url: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl From<EventRow> for WebhookEvent {
    fn from(row: EventRow) -> Self {
        WebhookEvent {
            id: row.id,
            event_type: row.event_type,
            action_id: row.action_id,
            dedupe_key: row.dedupe_key,
            target_url: row.target_url,
            payload: row.payload,
            status: row.status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
        }
    }
}

pub async fn enqueue(pool: &PgPool, event: &WebhookEvent) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO webhook_events
             (id, event_type, action_id, dedupe_key, target_url, payload, status,
              attempts, max_attempts, next_retry_at, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8, $9)
         ON CONFLICT (dedupe_key, target_url) DO NOTHING",
    )
    .bind(event.id)
    .bind(&event.event_type)
    .bind(event.action_id)
    .bind(&event.dedupe_key)
    .bind(&event.target_url)
    .bind(&event.payload)
    .bind(event.max_attempts)
    .bind(event.next_retry_at)
    .bind(event.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Atomically claim the next ready event using SELECT FOR UPDATE SKIP LOCKED.
pub async fn claim_next(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Option<WebhookEvent>, StoreError> {
    let row = sqlx::query_as::<_, EventRow>(
        "UPDATE webhook_events SET status = 'processing', attempts = attempts + 1
         WHERE id = (
             SELECT id FROM webhook_events
             WHERE (status = 'pending' OR (status = 'failed' AND attempts < max_attempts))
               AND next_retry_at <= $1
             ORDER BY next_retry_at ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED
         )
         RETURNING *",
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(WebhookEvent::from))
}

pub async fn mark_delivered(pool: &PgPool, id: Uuid) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE webhook_events SET status = 'delivered', delivered_at = now() WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark as failed with exponential backoff. Once attempts reach
/// max_attempts the row stays 'failed' and is never claimed again.
pub async fn mark_failed(
    pool: &PgPool,
    id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let attempts = sqlx::query_scalar::<_, i32>("SELECT attempts FROM webhook_events WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

    sqlx::query(
        "UPDATE webhook_events
         SET status = 'failed', last_error = $2, next_retry_at = $3
         WHERE id = $1",
    )
    .bind(id)
    .bind(error)
    .bind(now + event_backoff(attempts))
    .execute(pool)
    .await?;
    Ok(())
}
