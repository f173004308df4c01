use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "keyfleet-core",
        description = "authorized_keys reconciliation engine"
    ),
    paths(
        crate::routes::health::healthz_handler,
        crate::routes::queue::enqueue_apply,
        crate::routes::queue::enqueue_apply_all,
        crate::routes::queue::emergency_revoke,
        crate::routes::queue::queue_depth,
        crate::routes::deployments::deployments_for_host,
        crate::routes::deployments::deployments_for_account,
    ),
    components(schemas(
        crate::routes::health::HealthResponse,
        crate::services::reconciler::ApplyPriority,
        crate::services::reconciler::DeploymentStatus,
        crate::services::reconciler::DeploymentPublic,
        crate::services::reconciler::DeploymentListResponse,
        crate::services::reconciler::EnqueueApplyRequest,
        crate::services::reconciler::EnqueueApplyResponse,
        crate::services::reconciler::EnqueueAllRequest,
        crate::services::reconciler::EnqueueAllResponse,
        crate::services::reconciler::EmergencyRevokeRequest,
        crate::services::reconciler::RevokeSummary,
        crate::services::reconciler::QueueDepthResponse,
    )),
    tags(
        (name = "queue", description = "Apply queue operations"),
        (name = "deployments", description = "Deployment ledger visibility"),
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to serialize OpenAPI document");
        serde_json::json!({})
    })
}

pub(crate) async fn openapi_handler() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_handler))
}
