pub mod deployments;
pub mod health;
pub mod queue;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(queue::router())
                .merge(deployments::router())
                .merge(crate::openapi::router()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        router(crate::test_support::test_state())
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let resp = app()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn queue_depth_is_zero_filled_when_empty() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .uri("/api/queue/depth")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["depth"]["queued"], 0);
        assert_eq!(json["depth"]["running"], 0);
        assert_eq!(json["depth"]["failed"], 0);
    }

    #[tokio::test]
    async fn enqueue_apply_rejects_unknown_mapping() {
        let body = serde_json::json!({
            "user_host_account_id": uuid::Uuid::new_v4(),
            "priority": "user",
        });
        let resp = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/queue/apply")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn emergency_revoke_requires_a_fingerprint() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/queue/emergency-revoke")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"fingerprint": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deployment_history_for_unknown_host_is_empty() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/deployments/host/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["deployments"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .uri("/api/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json["paths"]["/api/queue/apply"].is_object());
    }
}
