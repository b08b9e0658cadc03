use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreError;
use super::actions::is_unique_violation;
use crate::models::Approval;

#[derive(Debug, sqlx::FromRow)]
struct ApprovalRow {
    id: Uuid,
    action_id: Uuid,
    approver_id: Uuid,
    approver_name: Option<String>,
    status: String,
    comments: Option<String>,
    requested_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
}

impl TryFrom<ApprovalRow> for Approval {
    type Error = StoreError;

    fn try_from(row: ApprovalRow) -> Result<Self, Self::Error> {
        Ok(Approval {
            id: row.id,
            action_id: row.action_id,
            approver_id: row.approver_id,
            approver_name: row.approver_name,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            comments: row.comments,
            requested_at: row.requested_at,
            responded_at: row.responded_at,
        })
    }
}

pub async fn create(pool: &PgPool, approval: &Approval) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO approvals
             (id, action_id, approver_id, approver_name, status, comments, requested_at, responded_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(approval.id)
    .bind(approval.action_id)
    .bind(approval.approver_id)
    .bind(&approval.approver_name)
    .bind(approval.status.as_str())
    .bind(&approval.comments)
    .bind(approval.requested_at)
    .bind(approval.responded_at)
    .execute(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Duplicate(format!(
                "vote by {} on {}",
                approval.approver_id, approval.action_id
            ))
        } else {
            StoreError::Database(e)
        }
    })?;
    Ok(())
}

pub async fn list_by_action(pool: &PgPool, action_id: Uuid) -> Result<Vec<Approval>, StoreError> {
    sqlx::query_as::<_, ApprovalRow>(
        "SELECT * FROM approvals WHERE action_id = $1 ORDER BY requested_at ASC",
    )
    .bind(action_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(Approval::try_from)
    .collect()
}
