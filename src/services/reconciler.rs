mod applier;
mod engine;
mod memory;
mod notify;
mod pg;
mod render;
mod runner;
mod schema;
mod store;
mod types;

use std::sync::Arc;

pub use applier::{
    authorized_keys_path, install_command, shell_quote, ApplyError, ApplyTarget, RemoteApplier,
    Ssh2Applier,
};
pub use memory::MemoryStore;
pub use notify::{ChannelNotifier, LogNotifier, NotificationEvent, Notifier};
pub use pg::PgStore;
pub use render::{
    key_fingerprint_sha256, render_authorized_keys, RenderedAuthorizedKeys,
    EMPTY_CONTENT_CHECKSUM,
};
pub use runner::{backoff_delay, ReconcileWorkerPool};
pub use schema::ensure_schema;
pub use store::{ReconcileStore, StoreError};
pub use types::{
    ActiveKey, ApplyPriority, ApplyQueueItem, DeploymentListResponse, DeploymentPublic,
    DeploymentRow, DeploymentStatus, EmergencyRevokeRequest, EnqueueAllRequest,
    EnqueueAllResponse, EnqueueApplyRequest, EnqueueApplyResponse, ErrorClass, HostRecord,
    MappingContext, MappingRecord, NewDeployment, QueueDepthResponse, QueueStatus, RevokeSummary,
    RevokedKey, TerminalFailure,
};

/// Front door for the admin/API layer: enqueue operations, the emergency
/// revoke fast path, and ledger/queue visibility. The worker pool in
/// `runner` consumes what this enqueues.
pub struct ReconcileEngine {
    store: Arc<dyn ReconcileStore>,
    notifier: Arc<dyn Notifier>,
    history_limit: i64,
}
