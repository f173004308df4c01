use crate::config::EngineConfig;
use crate::services::reconciler::ReconcileEngine;
use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub db: PgPool,
    pub engine: Arc<ReconcileEngine>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
