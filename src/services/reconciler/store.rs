use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::types::{
    ActiveKey, ApplyPriority, ApplyQueueItem, DeploymentRow, MappingContext, MappingRecord,
    NewDeployment, RevokedKey,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(
        "generation conflict for account {user_host_account_id}: generation {attempted} already recorded"
    )]
    GenerationConflict {
        user_host_account_id: Uuid,
        attempted: i64,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The apply queue and deployment ledger are the engine's only mutable
/// shared state; everything under "key/policy reads" is owned by the
/// portal subsystems and read-only here (timestamp/status stamps aside).
#[async_trait]
pub trait ReconcileStore: Send + Sync {
    // Key/policy reads.
    async fn list_active_keys(&self, user_id: Uuid) -> StoreResult<Vec<ActiveKey>>;
    async fn list_active_mappings(&self, host_id: Option<Uuid>) -> StoreResult<Vec<MappingRecord>>;
    async fn list_active_mappings_for_user(&self, user_id: Uuid)
        -> StoreResult<Vec<MappingRecord>>;
    async fn mapping_context(
        &self,
        user_host_account_id: Uuid,
    ) -> StoreResult<Option<MappingContext>>;

    // Apply queue. Enqueue coalesces to one queued row per account; the
    // claim transition is the pool's sole serialization point.
    async fn enqueue(
        &self,
        user_host_account_id: Uuid,
        priority: ApplyPriority,
    ) -> StoreResult<Uuid>;
    async fn claim_next(&self) -> StoreResult<Option<ApplyQueueItem>>;
    async fn release_expired_leases(&self, lease: Duration) -> StoreResult<u64>;
    async fn mark_item_completed(&self, item_id: Uuid) -> StoreResult<()>;
    async fn mark_item_cancelled(&self, item_id: Uuid, reason: &str) -> StoreResult<()>;
    async fn requeue_item(
        &self,
        item_id: Uuid,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()>;
    async fn mark_item_failed(&self, item_id: Uuid, retry_count: i32, error: &str)
        -> StoreResult<()>;
    async fn prune_finished_items(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;
    async fn queue_depth_by_status(&self) -> StoreResult<BTreeMap<String, i64>>;

    // Deployment ledger.
    async fn last_successful_deployment(
        &self,
        host_id: Uuid,
        user_host_account_id: Uuid,
    ) -> StoreResult<Option<DeploymentRow>>;
    async fn record_deployment(&self, new: NewDeployment) -> StoreResult<DeploymentRow>;
    async fn deployments_for_host(&self, host_id: Uuid, limit: i64)
        -> StoreResult<Vec<DeploymentRow>>;
    async fn deployments_for_account(
        &self,
        user_host_account_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<DeploymentRow>>;

    // Bookkeeping stamps on externally-owned rows.
    async fn mark_keys_applied(&self, key_ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<()>;
    async fn touch_host_seen(&self, host_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
    async fn revoke_keys_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Vec<RevokedKey>>;
    async fn expire_overdue_keys(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}
