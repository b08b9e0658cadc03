use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{ActionFilter, ClaimOutcome, StoreError};
use crate::models::{Action, ActionParameters, ResourceRef};

/// Raw `actions` row. Enum columns are TEXT and nested structures JSONB.
#[derive(Debug, sqlx::FromRow)]
pub struct ActionRow {
    pub id: Uuid,
    pub recommendation_id: Option<Uuid>,
    pub workflow_execution_id: Option<Uuid>,
    pub action_type: String,
    pub provider: String,
    pub account_id: Option<String>,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_key: Option<String>,
    pub parameters: serde_json::Value,
    pub description: Option<String>,
    pub status: String,
    pub approval_status: String,
    pub version: i64,
    pub risk: String,
    pub cost_impact: f64,
    pub estimated_savings: Option<f64>,
    pub resource_tags: serde_json::Value,
    pub required_approvers: serde_json::Value,
    pub min_approvals: i32,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub apply_started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub attempts: i32,
    pub cancel_requested: bool,
    pub needs_manual_intervention: bool,
    pub snapshot: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
}

impl TryFrom<ActionRow> for Action {
    type Error = StoreError;

    fn try_from(row: ActionRow) -> Result<Self, Self::Error> {
        let action_type = row.action_type.parse().map_err(StoreError::Corrupt)?;
        let provider = row.provider.parse().map_err(StoreError::Corrupt)?;
        let resource = match (row.resource_id, row.resource_type) {
            (Some(id), Some(kind)) => Some(ResourceRef::new(provider, &id, &kind)),
            _ => None,
        };
        let parameters = ActionParameters::parse(action_type, &row.parameters)
            .map_err(|e| StoreError::Corrupt(format!("action {}: {e}", row.id)))?;

        Ok(Action {
            id: row.id,
            recommendation_id: row.recommendation_id,
            workflow_execution_id: row.workflow_execution_id,
            action_type,
            provider,
            account_id: row.account_id,
            resource,
            parameters,
            description: row.description,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            approval_status: row.approval_status.parse().map_err(StoreError::Corrupt)?,
            version: row.version,
            risk: row.risk.parse().map_err(StoreError::Corrupt)?,
            cost_impact: row.cost_impact,
            estimated_savings: row.estimated_savings,
            resource_tags: serde_json::from_value(row.resource_tags)?,
            required_approvers: serde_json::from_value(row.required_approvers)?,
            min_approvals: row.min_approvals,
            scheduled_time: row.scheduled_time,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            apply_started_at: row.apply_started_at,
            heartbeat_at: row.heartbeat_at,
            completed_at: row.completed_at,
            claimed_by: row.claimed_by,
            attempts: row.attempts,
            cancel_requested: row.cancel_requested,
            needs_manual_intervention: row.needs_manual_intervention,
            snapshot: row.snapshot.map(serde_json::from_value).transpose()?,
            result: row.result.map(serde_json::from_value).transpose()?,
        })
    }
}

fn to_actions(rows: Vec<ActionRow>) -> Result<Vec<Action>, StoreError> {
    rows.into_iter().map(Action::try_from).collect()
}

pub async fn insert(pool: &PgPool, action: &Action) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO actions (
             id, recommendation_id, workflow_execution_id, action_type, provider, account_id,
             resource_id, resource_type, resource_key, parameters, description, status,
             approval_status, version, risk, cost_impact, estimated_savings, resource_tags,
             required_approvers, min_approvals, scheduled_time, created_by, created_at, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                   $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)",
    )
    .bind(action.id)
    .bind(action.recommendation_id)
    .bind(action.workflow_execution_id)
    .bind(action.action_type.as_str())
    .bind(action.provider.as_str())
    .bind(&action.account_id)
    .bind(action.resource.as_ref().map(|r| r.resource_id.as_str()))
    .bind(action.resource.as_ref().map(|r| r.resource_type.as_str()))
    .bind(action.resource_key())
    .bind(action.parameters.to_value())
    .bind(&action.description)
    .bind(action.status.as_str())
    .bind(action.approval_status.as_str())
    .bind(action.version)
    .bind(action.risk.as_str())
    .bind(action.cost_impact)
    .bind(action.estimated_savings)
    .bind(serde_json::to_value(&action.resource_tags)?)
    .bind(serde_json::to_value(&action.required_approvers)?)
    .bind(action.min_approvals)
    .bind(action.scheduled_time)
    .bind(action.created_by)
    .bind(action.created_at)
    .bind(action.updated_at)
    .execute(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Duplicate(format!("action {}", action.id))
        } else {
            StoreError::Database(e)
        }
    })?;
    Ok(())
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Action>, StoreError> {
    sqlx::query_as::<_, ActionRow>("SELECT * FROM actions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(Action::try_from)
        .transpose()
}

pub async fn list(pool: &PgPool, filter: &ActionFilter) -> Result<Vec<Action>, StoreError> {
    let rows = sqlx::query_as::<_, ActionRow>(
        "SELECT * FROM actions
         WHERE ($1::text IS NULL OR status = $1)
           AND ($2::uuid IS NULL OR workflow_execution_id = $2)
         ORDER BY created_at DESC, id DESC
         LIMIT $3 OFFSET $4",
    )
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.workflow_execution_id)
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(pool)
    .await?;
    to_actions(rows)
}

/// Compare-and-swap write of every mutable column.
pub async fn update(pool: &PgPool, action: &Action) -> Result<Action, StoreError> {
    let row = sqlx::query_as::<_, ActionRow>(
        "UPDATE actions SET
             status = $3, approval_status = $4, required_approvers = $5, min_approvals = $6,
             scheduled_time = $7, started_at = $8, apply_started_at = $9, completed_at = $10,
             claimed_by = $11, attempts = $12, needs_manual_intervention = $13,
             snapshot = $14, result = $15, description = $16,
             version = version + 1, updated_at = now()
         WHERE id = $1 AND version = $2
         RETURNING *",
    )
    .bind(action.id)
    .bind(action.version)
    .bind(action.status.as_str())
    .bind(action.approval_status.as_str())
    .bind(serde_json::to_value(&action.required_approvers)?)
    .bind(action.min_approvals)
    .bind(action.scheduled_time)
    .bind(action.started_at)
    .bind(action.apply_started_at)
    .bind(action.completed_at)
    .bind(&action.claimed_by)
    .bind(action.attempts)
    .bind(action.needs_manual_intervention)
    .bind(action.snapshot.as_ref().map(serde_json::to_value).transpose()?)
    .bind(action.result.as_ref().map(serde_json::to_value).transpose()?)
    .bind(&action.description)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Action::try_from(row),
        None => Err(missing_or_conflict(pool, action.id).await),
    }
}

async fn missing_or_conflict(pool: &PgPool, id: Uuid) -> StoreError {
    match sqlx::query_scalar::<_, i64>("SELECT version FROM actions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
    {
        Ok(Some(_)) => StoreError::VersionConflict(id),
        Ok(None) => StoreError::NotFound(id),
        Err(e) => StoreError::Database(e),
    }
}

/// Optimistic claim. The `NOT EXISTS` guard serialises work per resource;
/// the partial unique index on `resource_key` closes the race between two
/// claims that both pass the guard.
pub async fn claim(
    pool: &PgPool,
    id: Uuid,
    expected_version: i64,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome, StoreError> {
    let result = sqlx::query_as::<_, ActionRow>(
        "UPDATE actions SET
             status = 'executing', claimed_by = $3, started_at = $4, heartbeat_at = $4,
             apply_started_at = NULL, version = version + 1, updated_at = $4
         WHERE id = $1 AND version = $2
           AND status IN ('approved', 'scheduled')
           AND approval_status = 'approved'
           AND (resource_key IS NULL OR NOT EXISTS (
               SELECT 1 FROM actions other
               WHERE other.resource_key = actions.resource_key
                 AND other.status = 'executing'
                 AND other.id <> actions.id
           ))
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .bind(worker_id)
    .bind(now)
    .fetch_optional(pool)
    .await;

    match result {
        Ok(Some(row)) => Ok(ClaimOutcome::Claimed(Action::try_from(row)?)),
        Ok(None) => {
            let busy = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (
                     SELECT 1 FROM actions a JOIN actions other
                       ON other.resource_key = a.resource_key
                      AND other.status = 'executing'
                      AND other.id <> a.id
                     WHERE a.id = $1 AND a.version = $2
                 )",
            )
            .bind(id)
            .bind(expected_version)
            .fetch_one(pool)
            .await?;
            Ok(if busy {
                ClaimOutcome::ResourceBusy
            } else {
                ClaimOutcome::Conflict
            })
        }
        Err(e) if is_unique_violation(&e) => Ok(ClaimOutcome::ResourceBusy),
        Err(e) => Err(e.into()),
    }
}

pub async fn release(pool: &PgPool, id: Uuid, expected_version: i64) -> Result<Action, StoreError> {
    let row = sqlx::query_as::<_, ActionRow>(
        "UPDATE actions SET
             status = 'approved', claimed_by = NULL, started_at = NULL, heartbeat_at = NULL,
             apply_started_at = NULL, version = version + 1, updated_at = now()
         WHERE id = $1 AND version = $2 AND status = 'executing'
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Action::try_from(row),
        None => Err(missing_or_conflict(pool, id).await),
    }
}

pub async fn list_due(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Action>, StoreError> {
    let rows = sqlx::query_as::<_, ActionRow>(
        "SELECT * FROM actions
         WHERE status IN ('approved', 'scheduled')
           AND approval_status = 'approved'
           AND (scheduled_time IS NULL OR scheduled_time <= $1)
         ORDER BY COALESCE(scheduled_time, created_at) ASC
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    to_actions(rows)
}

pub async fn heartbeat(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE actions SET heartbeat_at = $3
         WHERE id = $1 AND claimed_by = $2 AND status = 'executing'",
    )
    .bind(id)
    .bind(worker_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn request_cancel(pool: &PgPool, id: Uuid) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE actions SET cancel_requested = true WHERE id = $1 AND status = 'executing'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 1 {
        return Ok(true);
    }
    match find_by_id(pool, id).await? {
        Some(_) => Ok(false),
        None => Err(StoreError::NotFound(id)),
    }
}

pub async fn list_stale_executing(
    pool: &PgPool,
    before: DateTime<Utc>,
) -> Result<Vec<Action>, StoreError> {
    let rows = sqlx::query_as::<_, ActionRow>(
        "SELECT * FROM actions
         WHERE status = 'executing'
           AND COALESCE(heartbeat_at, started_at, updated_at) < $1",
    )
    .bind(before)
    .fetch_all(pool)
    .await?;
    to_actions(rows)
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
