use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ApplyPriority {
    Routine,
    User,
    Emergency,
}

impl ApplyPriority {
    pub fn as_i16(&self) -> i16 {
        match self {
            ApplyPriority::Routine => 0,
            ApplyPriority::User => 50,
            ApplyPriority::Emergency => 100,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            v if v >= 100 => ApplyPriority::Emergency,
            v if v >= 50 => ApplyPriority::User,
            _ => ApplyPriority::Routine,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyPriority::Routine => "routine",
            ApplyPriority::User => "user",
            ApplyPriority::Emergency => "emergency",
        }
    }
}

impl Default for ApplyPriority {
    fn default() -> Self {
        ApplyPriority::User
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Running => "running",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }
}

/// Failure taxonomy driving retry behavior. Transport failures retry up to
/// the ceiling, config failures retry once, invariant violations requeue
/// once and alert, inconsistent jobs cancel outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transport,
    Config,
    Invariant,
    Inconsistent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transport => "transport",
            ErrorClass::Config => "config",
            ErrorClass::Invariant => "invariant",
            ErrorClass::Inconsistent => "inconsistent",
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct HostRecord {
    pub id: Uuid,
    pub hostname: String,
    pub address: String,
    pub os_family: String,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct MappingRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub host_id: Uuid,
    pub remote_username: String,
    pub status: String,
}

/// A mapping joined with everything `run_one` needs: the target host and
/// the owning user's portal status.
#[derive(Debug, Clone)]
pub struct MappingContext {
    pub mapping: MappingRecord,
    pub host: HostRecord,
    pub user_status: String,
}

impl MappingContext {
    pub fn is_active(&self) -> bool {
        self.mapping.status == "active" && self.user_status == "active"
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ActiveKey {
    pub id: Uuid,
    pub public_key: String,
    pub authorized_keys_options: Option<String>,
    pub comment: Option<String>,
    pub fingerprint_sha256: String,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ApplyQueueItem {
    pub id: Uuid,
    pub user_host_account_id: Uuid,
    pub priority: i16,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApplyQueueItem {
    pub fn status_enum(&self) -> QueueStatus {
        match self.status.as_str() {
            "queued" => QueueStatus::Queued,
            "running" => QueueStatus::Running,
            "completed" => QueueStatus::Completed,
            "cancelled" => QueueStatus::Cancelled,
            "failed" => QueueStatus::Failed,
            other => {
                tracing::warn!(status = %other, item_id = %self.id, "unknown queue status; treating as failed");
                QueueStatus::Failed
            }
        }
    }

    pub fn priority_enum(&self) -> ApplyPriority {
        ApplyPriority::from_i16(self.priority)
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct DeploymentRow {
    pub id: Uuid,
    pub host_id: Uuid,
    pub user_host_account_id: Uuid,
    pub generation: i64,
    pub status: String,
    pub checksum: Option<String>,
    pub key_count: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: i32,
}

impl DeploymentRow {
    pub fn status_enum(&self) -> DeploymentStatus {
        match self.status.as_str() {
            "pending" => DeploymentStatus::Pending,
            "running" => DeploymentStatus::Running,
            "success" => DeploymentStatus::Success,
            "cancelled" => DeploymentStatus::Cancelled,
            "failed" => DeploymentStatus::Failed,
            other => {
                tracing::warn!(status = %other, deployment_id = %self.id, "unknown deployment status; treating as failed");
                DeploymentStatus::Failed
            }
        }
    }

    pub fn to_public(&self) -> DeploymentPublic {
        DeploymentPublic {
            id: self.id.to_string(),
            host_id: self.host_id.to_string(),
            user_host_account_id: self.user_host_account_id.to_string(),
            generation: self.generation,
            status: self.status_enum(),
            checksum: self.checksum.clone(),
            key_count: self.key_count,
            started_at: self.started_at.to_rfc3339(),
            finished_at: self.finished_at.map(|ts| ts.to_rfc3339()),
            error: self.error.clone(),
            retry_count: self.retry_count,
        }
    }
}

/// One reconciliation attempt, before the store assigns id and generation.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub host_id: Uuid,
    pub user_host_account_id: Uuid,
    pub status: DeploymentStatus,
    pub checksum: Option<String>,
    pub key_count: i32,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
    pub retry_count: i32,
}

#[derive(Debug, Clone)]
pub struct RevokedKey {
    pub key_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct DeploymentPublic {
    pub id: String,
    pub host_id: String,
    pub user_host_account_id: String,
    pub generation: i64,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub key_count: i32,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct EnqueueApplyRequest {
    pub user_host_account_id: Uuid,
    #[serde(default)]
    pub priority: ApplyPriority,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct EnqueueApplyResponse {
    pub item_id: String,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct EnqueueAllRequest {
    #[serde(default = "EnqueueAllRequest::default_priority")]
    pub priority: ApplyPriority,
    /// Narrow the bulk apply to one host's mappings.
    #[serde(default)]
    pub host_id: Option<Uuid>,
}

impl EnqueueAllRequest {
    fn default_priority() -> ApplyPriority {
        ApplyPriority::Routine
    }
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct EnqueueAllResponse {
    pub queued: u64,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct EmergencyRevokeRequest {
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct RevokeSummary {
    pub fingerprint: String,
    pub revoked_count: u64,
    pub affected_users: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct QueueDepthResponse {
    pub depth: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct DeploymentListResponse {
    pub deployments: Vec<DeploymentPublic>,
}

/// Payload handed to the notification subsystem when a job exhausts its
/// retry budget.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct TerminalFailure {
    pub user_id: Uuid,
    pub host_id: Uuid,
    pub error: String,
    pub retry_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bands_order() {
        assert!(ApplyPriority::Emergency.as_i16() > ApplyPriority::User.as_i16());
        assert!(ApplyPriority::User.as_i16() > ApplyPriority::Routine.as_i16());
        assert_eq!(
            ApplyPriority::from_i16(ApplyPriority::Emergency.as_i16()),
            ApplyPriority::Emergency
        );
        assert_eq!(ApplyPriority::from_i16(7), ApplyPriority::Routine);
    }

    #[test]
    fn queue_status_terminality() {
        assert!(!QueueStatus::Queued.is_terminal());
        assert!(!QueueStatus::Running.is_terminal());
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(QueueStatus::Cancelled.is_terminal());
    }
}
