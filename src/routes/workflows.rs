use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::engine::workflow::NewWorkflow;
use crate::error::AppError;
use crate::models::{Workflow, WorkflowExecution};
use crate::state::SharedState;

pub async fn create(
    auth: AuthUser,
    State(state): State<SharedState>,
    Json(req): Json<NewWorkflow>,
) -> Result<(StatusCode, Json<Workflow>), AppError> {
    let workflow = state.workflows.create_workflow(req, auth.user_id).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn list(
    _auth: AuthUser,
    State(state): State<SharedState>,
) -> Result<Json<Vec<Workflow>>, AppError> {
    Ok(Json(state.workflows.list_workflows().await?))
}

pub async fn get(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Workflow>, AppError> {
    Ok(Json(state.workflows.get_workflow(id).await?))
}

pub async fn execute(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<WorkflowExecution>), AppError> {
    let execution = state
        .workflows
        .start(id, &auth.user_id.to_string())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

pub async fn get_execution(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowExecution>, AppError> {
    Ok(Json(state.workflows.get_execution(id).await?))
}

pub async fn cancel_execution(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowExecution>, AppError> {
    Ok(Json(
        state.workflows.cancel_execution(id, auth.user_id).await?,
    ))
}
