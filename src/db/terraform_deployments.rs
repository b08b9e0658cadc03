use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreError;
use crate::models::TerraformDeployment;

#[derive(Debug, sqlx::FromRow)]
struct DeploymentRow {
    id: Uuid,
    action_id: Uuid,
    name: String,
    provider: String,
    template_id: String,
    variables: serde_json::Value,
    status: String,
    workdir: String,
    plan_output: Option<String>,
    output: Option<serde_json::Value>,
    logs: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for TerraformDeployment {
    type Error = StoreError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        Ok(TerraformDeployment {
            id: row.id,
            action_id: row.action_id,
            name: row.name,
            provider: row.provider.parse().map_err(StoreError::Corrupt)?,
            template_id: row.template_id,
            variables: row.variables,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            workdir: row.workdir,
            plan_output: row.plan_output,
            output: row.output,
            logs: row.logs,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub async fn create(pool: &PgPool, d: &TerraformDeployment) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO terraform_deployments
             (id, action_id, name, provider, template_id, variables, status, workdir,
              plan_output, output, logs, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(d.id)
    .bind(d.action_id)
    .bind(&d.name)
    .bind(d.provider.as_str())
    .bind(&d.template_id)
    .bind(&d.variables)
    .bind(d.status.as_str())
    .bind(&d.workdir)
    .bind(&d.plan_output)
    .bind(&d.output)
    .bind(&d.logs)
    .bind(d.created_at)
    .bind(d.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<TerraformDeployment>, StoreError> {
    sqlx::query_as::<_, DeploymentRow>("SELECT * FROM terraform_deployments WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(TerraformDeployment::try_from)
        .transpose()
}

pub async fn update(pool: &PgPool, d: &TerraformDeployment) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE terraform_deployments
         SET status = $2, plan_output = $3, output = $4, logs = $5, updated_at = now()
         WHERE id = $1",
    )
    .bind(d.id)
    .bind(d.status.as_str())
    .bind(&d.plan_output)
    .bind(&d.output)
    .bind(&d.logs)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(d.id));
    }
    Ok(())
}
