use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::map_store_error;
use crate::services::reconciler::DeploymentListResponse;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/deployments/host/{host_id}", get(deployments_for_host))
        .route(
            "/deployments/account/{user_host_account_id}",
            get(deployments_for_account),
        )
}

#[utoipa::path(
    get,
    path = "/api/deployments/host/{host_id}",
    tag = "deployments",
    params(("host_id" = Uuid, Path, description = "Managed host id")),
    responses((status = 200, description = "Deployment history", body = DeploymentListResponse))
)]
pub(crate) async fn deployments_for_host(
    State(state): State<AppState>,
    Path(host_id): Path<Uuid>,
) -> Result<Json<DeploymentListResponse>, (StatusCode, String)> {
    let deployments = state
        .engine
        .deployments_for_host(host_id)
        .await
        .map_err(map_store_error)?;
    Ok(Json(DeploymentListResponse { deployments }))
}

#[utoipa::path(
    get,
    path = "/api/deployments/account/{user_host_account_id}",
    tag = "deployments",
    params(("user_host_account_id" = Uuid, Path, description = "User host account id")),
    responses((status = 200, description = "Deployment history", body = DeploymentListResponse))
)]
pub(crate) async fn deployments_for_account(
    State(state): State<AppState>,
    Path(user_host_account_id): Path<Uuid>,
) -> Result<Json<DeploymentListResponse>, (StatusCode, String)> {
    let deployments = state
        .engine
        .deployments_for_account(user_host_account_id)
        .await
        .map_err(map_store_error)?;
    Ok(Json(DeploymentListResponse { deployments }))
}
