use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::error::map_store_error;
use crate::services::reconciler::{
    EmergencyRevokeRequest, EnqueueAllRequest, EnqueueAllResponse, EnqueueApplyRequest,
    EnqueueApplyResponse, QueueDepthResponse, RevokeSummary,
};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queue/apply", post(enqueue_apply))
        .route("/queue/apply-all", post(enqueue_apply_all))
        .route("/queue/emergency-revoke", post(emergency_revoke))
        .route("/queue/depth", get(queue_depth))
}

#[utoipa::path(
    post,
    path = "/api/queue/apply",
    tag = "queue",
    request_body = EnqueueApplyRequest,
    responses(
        (status = 200, description = "Queued", body = EnqueueApplyResponse),
        (status = 404, description = "Mapping unknown or inactive")
    )
)]
pub(crate) async fn enqueue_apply(
    State(state): State<AppState>,
    Json(payload): Json<EnqueueApplyRequest>,
) -> Result<Json<EnqueueApplyResponse>, (StatusCode, String)> {
    let item_id = state
        .engine
        .enqueue_apply(payload.user_host_account_id, payload.priority)
        .await
        .map_err(map_store_error)?;
    let Some(item_id) = item_id else {
        return Err((
            StatusCode::NOT_FOUND,
            "user_host_account unknown or inactive".to_string(),
        ));
    };
    Ok(Json(EnqueueApplyResponse {
        item_id: item_id.to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/queue/apply-all",
    tag = "queue",
    request_body = EnqueueAllRequest,
    responses((status = 200, description = "Queued count", body = EnqueueAllResponse))
)]
pub(crate) async fn enqueue_apply_all(
    State(state): State<AppState>,
    Json(payload): Json<EnqueueAllRequest>,
) -> Result<Json<EnqueueAllResponse>, (StatusCode, String)> {
    let queued = state
        .engine
        .enqueue_apply_all(payload.host_id, payload.priority)
        .await
        .map_err(map_store_error)?;
    Ok(Json(EnqueueAllResponse { queued }))
}

#[utoipa::path(
    post,
    path = "/api/queue/emergency-revoke",
    tag = "queue",
    request_body = EmergencyRevokeRequest,
    responses(
        (status = 200, description = "Revoke summary", body = RevokeSummary),
        (status = 400, description = "Invalid fingerprint")
    )
)]
pub(crate) async fn emergency_revoke(
    State(state): State<AppState>,
    Json(payload): Json<EmergencyRevokeRequest>,
) -> Result<Json<RevokeSummary>, (StatusCode, String)> {
    let fingerprint = payload.fingerprint.trim();
    if fingerprint.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "fingerprint is required".to_string()));
    }
    let summary = state
        .engine
        .emergency_revoke(fingerprint)
        .await
        .map_err(map_store_error)?;
    Ok(Json(summary))
}

#[utoipa::path(
    get,
    path = "/api/queue/depth",
    tag = "queue",
    responses((status = 200, description = "Queue depth by status", body = QueueDepthResponse))
)]
pub(crate) async fn queue_depth(
    State(state): State<AppState>,
) -> Result<Json<QueueDepthResponse>, (StatusCode, String)> {
    let depth = state.engine.queue_depth().await.map_err(map_store_error)?;
    Ok(Json(QueueDepthResponse { depth }))
}
