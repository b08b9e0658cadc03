use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::auth::AuthUser;
use crate::cloud::catalog;
use crate::models::{ActionType, Provider};
use crate::state::SharedState;

#[derive(Serialize)]
pub struct ExecutorInfo {
    pub provider: Provider,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub description: String,
    pub resource_types: Vec<&'static str>,
}

pub async fn list(_auth: AuthUser, State(state): State<SharedState>) -> Json<Vec<ExecutorInfo>> {
    let executors = state
        .executors
        .list()
        .into_iter()
        .map(|e| ExecutorInfo {
            provider: e.provider(),
            action_type: e.action_type(),
            description: e.description(),
            resource_types: catalog::accepted_types(e.action_type(), e.provider()),
        })
        .collect();
    Json(executors)
}
