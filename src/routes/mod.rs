pub mod actions;
pub mod executors;
pub mod terraform;
pub mod workflows;

use axum::Router;
use axum::routing::{get, post, put};

use crate::state::SharedState;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        // Actions
        .route("/api/v1/actions", get(actions::list).post(actions::create))
        .route(
            "/api/v1/actions/from-recommendation",
            post(actions::from_recommendation),
        )
        .route("/api/v1/actions/schedule", post(actions::schedule_batch))
        .route("/api/v1/actions/{id}", get(actions::get))
        .route("/api/v1/actions/{id}/status", get(actions::status))
        .route("/api/v1/actions/{id}/history", get(actions::history))
        .route("/api/v1/actions/{id}/approvals", get(actions::approvals))
        .route("/api/v1/actions/{id}/approve", put(actions::approve))
        .route("/api/v1/actions/{id}/reject", put(actions::reject))
        .route("/api/v1/actions/{id}/schedule", put(actions::schedule))
        .route("/api/v1/actions/{id}/execute", post(actions::execute))
        .route("/api/v1/actions/{id}/cancel", post(actions::cancel))
        // Workflows
        .route(
            "/api/v1/workflows",
            get(workflows::list).post(workflows::create),
        )
        .route("/api/v1/workflows/{id}", get(workflows::get))
        .route("/api/v1/workflows/{id}/execute", post(workflows::execute))
        .route(
            "/api/v1/workflow-executions/{id}",
            get(workflows::get_execution),
        )
        .route(
            "/api/v1/workflow-executions/{id}/cancel",
            post(workflows::cancel_execution),
        )
        // Terraform
        .route(
            "/api/v1/terraform/deployments/{id}",
            get(terraform::get_deployment),
        )
        // Executors
        .route("/api/v1/executors", get(executors::list))
}
