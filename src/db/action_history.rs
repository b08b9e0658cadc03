use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreError;
use crate::models::ActionHistory;

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    action_id: Uuid,
    status: String,
    executed_at: DateTime<Utc>,
    executed_by: String,
    result: Option<serde_json::Value>,
    details: serde_json::Value,
}

impl TryFrom<HistoryRow> for ActionHistory {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(ActionHistory {
            id: row.id,
            action_id: row.action_id,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            executed_at: row.executed_at,
            executed_by: row.executed_by,
            result: row.result,
            details: row.details,
        })
    }
}

/// Append one entry. The table rejects UPDATE and DELETE at the database level.
pub async fn create(pool: &PgPool, entry: &ActionHistory) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO action_history (id, action_id, status, executed_at, executed_by, result, details)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(entry.id)
    .bind(entry.action_id)
    .bind(entry.status.as_str())
    .bind(entry.executed_at)
    .bind(&entry.executed_by)
    .bind(&entry.result)
    .bind(&entry.details)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_by_action(
    pool: &PgPool,
    action_id: Uuid,
) -> Result<Vec<ActionHistory>, StoreError> {
    sqlx::query_as::<_, HistoryRow>(
        "SELECT * FROM action_history WHERE action_id = $1 ORDER BY executed_at ASC, id ASC",
    )
    .bind(action_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(ActionHistory::try_from)
    .collect()
}

pub async fn latest(pool: &PgPool, action_id: Uuid) -> Result<Option<ActionHistory>, StoreError> {
    sqlx::query_as::<_, HistoryRow>(
        "SELECT * FROM action_history WHERE action_id = $1
         ORDER BY executed_at DESC, id DESC LIMIT 1",
    )
    .bind(action_id)
    .fetch_optional(pool)
    .await?
    .map(ActionHistory::try_from)
    .transpose()
}
