use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreError;
use crate::models::{Workflow, WorkflowExecution};

#[derive(Debug, sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    steps: serde_json::Value,
    trigger_config: serde_json::Value,
    status: String,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_triggered_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        Ok(Workflow {
            id: row.id,
            name: row.name,
            description: row.description,
            steps: serde_json::from_value(row.steps)?,
            trigger: serde_json::from_value(row.trigger_config)?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_triggered_at: row.last_triggered_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    workflow_id: Uuid,
    status: String,
    current_step: i32,
    step_results: serde_json::Value,
    wake_at: Option<DateTime<Utc>>,
    waiting_action_id: Option<Uuid>,
    steps_visited: i32,
    version: i64,
    triggered_by: String,
    error: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(WorkflowExecution {
            id: row.id,
            workflow_id: row.workflow_id,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            current_step: usize::try_from(row.current_step)
                .map_err(|_| StoreError::Corrupt(format!("negative step index in {}", row.id)))?,
            step_results: serde_json::from_value(row.step_results)?,
            wake_at: row.wake_at,
            waiting_action_id: row.waiting_action_id,
            steps_visited: row.steps_visited,
            version: row.version,
            triggered_by: row.triggered_by,
            error: row.error,
            started_at: row.started_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

pub async fn create(pool: &PgPool, wf: &Workflow) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO workflows
             (id, name, description, steps, trigger_config, status, created_by, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(wf.id)
    .bind(&wf.name)
    .bind(&wf.description)
    .bind(serde_json::to_value(&wf.steps)?)
    .bind(serde_json::to_value(&wf.trigger)?)
    .bind(wf.status.as_str())
    .bind(wf.created_by)
    .bind(wf.created_at)
    .bind(wf.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Workflow>, StoreError> {
    sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(Workflow::try_from)
        .transpose()
}

pub async fn list(pool: &PgPool) -> Result<Vec<Workflow>, StoreError> {
    sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows ORDER BY created_at ASC")
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(Workflow::try_from)
        .collect()
}

pub async fn mark_triggered(
    pool: &PgPool,
    id: Uuid,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE workflows SET last_triggered_at = $2, updated_at = $2 WHERE id = $1",
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(id));
    }
    Ok(())
}

pub async fn create_execution(pool: &PgPool, ex: &WorkflowExecution) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO workflow_executions
             (id, workflow_id, status, current_step, step_results, wake_at, waiting_action_id,
              steps_visited, version, triggered_by, error, started_at, updated_at, completed_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(ex.id)
    .bind(ex.workflow_id)
    .bind(ex.status.as_str())
    .bind(step_index(ex)?)
    .bind(serde_json::to_value(&ex.step_results)?)
    .bind(ex.wake_at)
    .bind(ex.waiting_action_id)
    .bind(ex.steps_visited)
    .bind(ex.version)
    .bind(&ex.triggered_by)
    .bind(&ex.error)
    .bind(ex.started_at)
    .bind(ex.updated_at)
    .bind(ex.completed_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_execution(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<WorkflowExecution>, StoreError> {
    sqlx::query_as::<_, ExecutionRow>("SELECT * FROM workflow_executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(WorkflowExecution::try_from)
        .transpose()
}

pub async fn update_execution(
    pool: &PgPool,
    ex: &WorkflowExecution,
) -> Result<WorkflowExecution, StoreError> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        "UPDATE workflow_executions SET
             status = $3, current_step = $4, step_results = $5, wake_at = $6,
             waiting_action_id = $7, steps_visited = $8, error = $9, completed_at = $10,
             version = version + 1, updated_at = now()
         WHERE id = $1 AND version = $2
         RETURNING *",
    )
    .bind(ex.id)
    .bind(ex.version)
    .bind(ex.status.as_str())
    .bind(step_index(ex)?)
    .bind(serde_json::to_value(&ex.step_results)?)
    .bind(ex.wake_at)
    .bind(ex.waiting_action_id)
    .bind(ex.steps_visited)
    .bind(&ex.error)
    .bind(ex.completed_at)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => WorkflowExecution::try_from(row),
        None => match find_execution(pool, ex.id).await? {
            Some(_) => Err(StoreError::VersionConflict(ex.id)),
            None => Err(StoreError::NotFound(ex.id)),
        },
    }
}

pub async fn list_active_executions(pool: &PgPool) -> Result<Vec<WorkflowExecution>, StoreError> {
    sqlx::query_as::<_, ExecutionRow>(
        "SELECT * FROM workflow_executions WHERE status = 'in_progress' ORDER BY started_at ASC",
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(WorkflowExecution::try_from)
    .collect()
}

fn step_index(ex: &WorkflowExecution) -> Result<i32, StoreError> {
    i32::try_from(ex.current_step)
        .map_err(|_| StoreError::Corrupt(format!("step index out of range in {}", ex.id)))
}
