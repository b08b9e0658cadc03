use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::ActionFilter;
use crate::engine::recommendation::Recommendation;
use crate::engine::service::{BatchScheduleResult, StatusView};
use crate::error::AppError;
use crate::models::{Action, ActionHistory, ActionStatus, Approval, ApprovalStatus, CreateAction};
use crate::state::SharedState;

const MAX_PAGE: i64 = 200;

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct VoteBody {
    pub comments: Option<String>,
}

#[derive(Deserialize)]
pub struct ScheduleBody {
    pub scheduled_time: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct BatchScheduleBody {
    pub action_ids: Vec<Uuid>,
    pub scheduled_time: DateTime<Utc>,
}

pub async fn create(
    auth: AuthUser,
    State(state): State<SharedState>,
    Json(req): Json<CreateAction>,
) -> Result<(StatusCode, Json<Action>), AppError> {
    let action = state.actions.create(req, auth.user_id).await?;
    Ok((StatusCode::CREATED, Json(action)))
}

pub async fn from_recommendation(
    auth: AuthUser,
    State(state): State<SharedState>,
    Json(rec): Json<Recommendation>,
) -> Result<(StatusCode, Json<Action>), AppError> {
    let action = state.actions.from_recommendation(&rec, auth.user_id).await?;
    Ok((StatusCode::CREATED, Json(action)))
}

pub async fn list(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Action>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<ActionStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let filter = ActionFilter {
        status,
        limit: params.limit.unwrap_or(50).clamp(1, MAX_PAGE),
        offset: params.offset.unwrap_or(0).max(0),
        ..ActionFilter::default()
    };
    Ok(Json(state.actions.list(&filter).await?))
}

pub async fn get(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Action>, AppError> {
    Ok(Json(state.actions.get(id).await?))
}

pub async fn status(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusView>, AppError> {
    Ok(Json(state.actions.status(id).await?))
}

pub async fn history(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ActionHistory>>, AppError> {
    Ok(Json(state.actions.history(id).await?))
}

pub async fn approvals(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Approval>>, AppError> {
    Ok(Json(state.actions.approvals(id).await?))
}

pub async fn approve(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    body: Option<Json<VoteBody>>,
) -> Result<Json<Action>, AppError> {
    vote(auth, state, id, ApprovalStatus::Approved, body).await
}

pub async fn reject(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    body: Option<Json<VoteBody>>,
) -> Result<Json<Action>, AppError> {
    vote(auth, state, id, ApprovalStatus::Rejected, body).await
}

async fn vote(
    auth: AuthUser,
    state: SharedState,
    id: Uuid,
    decision: ApprovalStatus,
    body: Option<Json<VoteBody>>,
) -> Result<Json<Action>, AppError> {
    let comments = body.and_then(|Json(b)| b.comments);
    let action = state
        .actions
        .vote(id, &auth.voter(), decision, comments)
        .await?;
    Ok(Json(action))
}

pub async fn schedule(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<Action>, AppError> {
    Ok(Json(state.actions.schedule(id, body.scheduled_time).await?))
}

pub async fn schedule_batch(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Json(body): Json<BatchScheduleBody>,
) -> Result<Json<Vec<BatchScheduleResult>>, AppError> {
    if body.action_ids.is_empty() {
        return Err(AppError::BadRequest("action_ids must not be empty".to_string()));
    }
    if body.action_ids.len() > MAX_PAGE as usize {
        return Err(AppError::BadRequest(format!(
            "at most {MAX_PAGE} actions can be scheduled at once"
        )));
    }
    Ok(Json(
        state
            .actions
            .schedule_batch(&body.action_ids, body.scheduled_time)
            .await,
    ))
}

pub async fn execute(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Action>), AppError> {
    let action = state.actions.execute(id).await?;
    Ok((StatusCode::ACCEPTED, Json(action)))
}

pub async fn cancel(
    auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Action>, AppError> {
    Ok(Json(state.actions.cancel(id, auth.user_id).await?))
}
