use axum::Json;
use axum::extract::{Path, State};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::TerraformDeployment;
use crate::state::SharedState;

pub async fn get_deployment(
    _auth: AuthUser,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TerraformDeployment>, AppError> {
    state
        .store
        .get_deployment(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Deployment {id} not found")))
}
