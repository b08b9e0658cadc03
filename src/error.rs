use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::db::StoreError;
use crate::engine::EngineError;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    BadRequest(String),
    Conflict(String),
    Unprocessable(String),
    ServiceUnavailable(String),
    Internal(String),
    Database(sqlx::Error),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not Found: {msg}"),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {msg}"),
            AppError::BadRequest(msg) => write!(f, "Bad Request: {msg}"),
            AppError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            AppError::Unprocessable(msg) => write!(f, "Unprocessable: {msg}"),
            AppError::ServiceUnavailable(msg) => write!(f, "Service Unavailable: {msg}"),
            AppError::Internal(msg) => write!(f, "Internal Error: {msg}"),
            AppError::Database(err) => write!(f, "Database Error: {err}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Database(err) => {
                tracing::error!("Database error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => AppError::NotFound(format!("Record {id} not found")),
            StoreError::VersionConflict(_) => AppError::Conflict(err.to_string()),
            StoreError::Duplicate(_) => AppError::Conflict(err.to_string()),
            StoreError::Database(e) => AppError::Database(e),
            StoreError::Serialization(_) | StoreError::Corrupt(_) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(_) | EngineError::UnsupportedOperation(_) => {
                AppError::BadRequest(err.to_string())
            }
            EngineError::NotFound(_) => AppError::NotFound(err.to_string()),
            EngineError::InvalidState(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::DuplicateVote(_)
            | EngineError::ApprovalDenied(_) => AppError::Conflict(err.to_string()),
            EngineError::SelfApproval | EngineError::NotAnApprover(_) => {
                AppError::Forbidden(err.to_string())
            }
            EngineError::Saturated => AppError::ServiceUnavailable(err.to_string()),
            EngineError::Store(e) => e.into(),
            EngineError::Provider(_)
            | EngineError::VerificationFailed(_)
            | EngineError::RollbackFailed(_) => AppError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionStatus;
    use uuid::Uuid;

    fn status_of(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn engine_errors_map_to_status_codes() {
        assert_eq!(status_of(EngineError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(EngineError::action_not_found(Uuid::now_v7())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(EngineError::InvalidTransition {
                from: ActionStatus::Completed,
                to: ActionStatus::Executing,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(EngineError::DuplicateVote(Uuid::now_v7())),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(EngineError::SelfApproval), StatusCode::FORBIDDEN);
        assert_eq!(status_of(EngineError::Saturated), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_of(EngineError::Store(StoreError::VersionConflict(Uuid::now_v7()))),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn server_errors_hide_details() {
        let resp = AppError::Internal("secret detail".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
