use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::store::{ReconcileStore, StoreResult};
use super::types::{
    ActiveKey, ApplyPriority, ApplyQueueItem, DeploymentRow, HostRecord, MappingContext,
    MappingRecord, NewDeployment, RevokedKey,
};

struct StoredUser {
    username: String,
    status: String,
}

struct StoredHost {
    record: HostRecord,
    last_seen_at: Option<DateTime<Utc>>,
}

struct StoredKey {
    user_id: Uuid,
    public_key: String,
    authorized_keys_options: Option<String>,
    comment: Option<String>,
    fingerprint_sha256: String,
    status: String,
    expires_at: Option<DateTime<Utc>>,
    last_applied_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, StoredUser>,
    hosts: HashMap<Uuid, StoredHost>,
    keys: HashMap<Uuid, StoredKey>,
    mappings: HashMap<Uuid, MappingRecord>,
    mapping_order: Vec<Uuid>,
    queue: HashMap<Uuid, ApplyQueueItem>,
    deployments: Vec<DeploymentRow>,
}

/// Store backed by process memory. Single-node deployments and the test
/// suite run against this; the mutex gives it the same atomic claim
/// transition the Postgres store gets from its advisory lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovering reconcile store from poisoned lock");
                poisoned.into_inner()
            }
        }
    }

    pub fn seed_user(&self, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().users.insert(
            id,
            StoredUser {
                username: username.to_string(),
                status: "active".to_string(),
            },
        );
        id
    }

    pub fn seed_host(&self, hostname: &str, address: &str, os_family: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().hosts.insert(
            id,
            StoredHost {
                record: HostRecord {
                    id,
                    hostname: hostname.to_string(),
                    address: address.to_string(),
                    os_family: os_family.to_string(),
                },
                last_seen_at: None,
            },
        );
        id
    }

    pub fn seed_key(
        &self,
        user_id: Uuid,
        public_key: &str,
        fingerprint_sha256: &str,
        authorized_keys_options: Option<&str>,
        comment: Option<&str>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().keys.insert(
            id,
            StoredKey {
                user_id,
                public_key: public_key.to_string(),
                authorized_keys_options: authorized_keys_options.map(str::to_string),
                comment: comment.map(str::to_string),
                fingerprint_sha256: fingerprint_sha256.to_string(),
                status: "active".to_string(),
                expires_at: None,
                last_applied_at: None,
            },
        );
        id
    }

    pub fn seed_mapping(&self, user_id: Uuid, host_id: Uuid, remote_username: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.lock();
        inner.mappings.insert(
            id,
            MappingRecord {
                id,
                user_id,
                host_id,
                remote_username: remote_username.to_string(),
                status: "active".to_string(),
            },
        );
        inner.mapping_order.push(id);
        id
    }

    pub fn set_mapping_status(&self, mapping_id: Uuid, status: &str) {
        if let Some(mapping) = self.lock().mappings.get_mut(&mapping_id) {
            mapping.status = status.to_string();
        }
    }

    /// Test hook: model an external decommission purging the mapping.
    pub fn remove_mapping(&self, mapping_id: Uuid) {
        let mut inner = self.lock();
        inner.mappings.remove(&mapping_id);
        inner.mapping_order.retain(|id| *id != mapping_id);
    }

    pub fn set_user_status(&self, user_id: Uuid, status: &str) {
        if let Some(user) = self.lock().users.get_mut(&user_id) {
            user.status = status.to_string();
        }
    }

    pub fn set_key_status(&self, key_id: Uuid, status: &str) {
        if let Some(key) = self.lock().keys.get_mut(&key_id) {
            key.status = status.to_string();
        }
    }

    pub fn set_key_expiry(&self, key_id: Uuid, expires_at: Option<DateTime<Utc>>) {
        if let Some(key) = self.lock().keys.get_mut(&key_id) {
            key.expires_at = expires_at;
        }
    }

    pub fn username(&self, user_id: Uuid) -> Option<String> {
        self.lock()
            .users
            .get(&user_id)
            .map(|user| user.username.clone())
    }

    pub fn key_status(&self, key_id: Uuid) -> Option<String> {
        self.lock().keys.get(&key_id).map(|key| key.status.clone())
    }

    pub fn key_last_applied(&self, key_id: Uuid) -> Option<DateTime<Utc>> {
        self.lock().keys.get(&key_id).and_then(|key| key.last_applied_at)
    }

    pub fn host_last_seen(&self, host_id: Uuid) -> Option<DateTime<Utc>> {
        self.lock().hosts.get(&host_id).and_then(|host| host.last_seen_at)
    }

    pub fn queue_item(&self, item_id: Uuid) -> Option<ApplyQueueItem> {
        self.lock().queue.get(&item_id).cloned()
    }

    pub fn queued_item_for_account(&self, user_host_account_id: Uuid) -> Option<ApplyQueueItem> {
        self.lock()
            .queue
            .values()
            .find(|item| {
                item.user_host_account_id == user_host_account_id && item.status == "queued"
            })
            .cloned()
    }

    /// Test hook: pull a retry-scheduled item back into the due window.
    pub fn force_due(&self, item_id: Uuid) {
        if let Some(item) = self.lock().queue.get_mut(&item_id) {
            item.scheduled_at = Utc::now() - Duration::seconds(1);
        }
    }

    /// Test hook: age a running item's lease so the sweep sees it expired.
    pub fn age_lease(&self, item_id: Uuid, by: Duration) {
        if let Some(item) = self.lock().queue.get_mut(&item_id) {
            if let Some(started_at) = item.started_at {
                item.started_at = Some(started_at - by);
            }
        }
    }
}

#[async_trait]
impl ReconcileStore for MemoryStore {
    async fn list_active_keys(&self, user_id: Uuid) -> StoreResult<Vec<ActiveKey>> {
        let now = Utc::now();
        let inner = self.lock();
        let mut keys: Vec<ActiveKey> = inner
            .keys
            .iter()
            .filter(|(_, key)| {
                key.user_id == user_id
                    && key.status == "active"
                    && key.expires_at.map(|ts| ts > now).unwrap_or(true)
            })
            .map(|(id, key)| ActiveKey {
                id: *id,
                public_key: key.public_key.clone(),
                authorized_keys_options: key.authorized_keys_options.clone(),
                comment: key.comment.clone(),
                fingerprint_sha256: key.fingerprint_sha256.clone(),
            })
            .collect();
        keys.sort_by(|a, b| a.fingerprint_sha256.cmp(&b.fingerprint_sha256));
        Ok(keys)
    }

    async fn list_active_mappings(&self, host_id: Option<Uuid>) -> StoreResult<Vec<MappingRecord>> {
        let inner = self.lock();
        Ok(inner
            .mapping_order
            .iter()
            .filter_map(|id| inner.mappings.get(id))
            .filter(|mapping| mapping.status == "active")
            .filter(|mapping| host_id.map(|host| mapping.host_id == host).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_active_mappings_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Vec<MappingRecord>> {
        let inner = self.lock();
        Ok(inner
            .mapping_order
            .iter()
            .filter_map(|id| inner.mappings.get(id))
            .filter(|mapping| mapping.status == "active" && mapping.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn mapping_context(
        &self,
        user_host_account_id: Uuid,
    ) -> StoreResult<Option<MappingContext>> {
        let inner = self.lock();
        let Some(mapping) = inner.mappings.get(&user_host_account_id) else {
            return Ok(None);
        };
        let Some(host) = inner.hosts.get(&mapping.host_id) else {
            return Ok(None);
        };
        let Some(user) = inner.users.get(&mapping.user_id) else {
            return Ok(None);
        };
        Ok(Some(MappingContext {
            mapping: mapping.clone(),
            host: host.record.clone(),
            user_status: user.status.clone(),
        }))
    }

    async fn enqueue(
        &self,
        user_host_account_id: Uuid,
        priority: ApplyPriority,
    ) -> StoreResult<Uuid> {
        let now = Utc::now();
        let mut inner = self.lock();
        if let Some(existing) = inner
            .queue
            .values_mut()
            .find(|item| item.user_host_account_id == user_host_account_id && item.status == "queued")
        {
            existing.priority = existing.priority.max(priority.as_i16());
            existing.scheduled_at = existing.scheduled_at.min(now);
            return Ok(existing.id);
        }
        let id = Uuid::new_v4();
        inner.queue.insert(
            id,
            ApplyQueueItem {
                id,
                user_host_account_id,
                priority: priority.as_i16(),
                status: "queued".to_string(),
                scheduled_at: now,
                started_at: None,
                finished_at: None,
                retry_count: 0,
                error: None,
                created_at: now,
            },
        );
        Ok(id)
    }

    async fn claim_next(&self) -> StoreResult<Option<ApplyQueueItem>> {
        let now = Utc::now();
        let mut inner = self.lock();
        let running_accounts: Vec<Uuid> = inner
            .queue
            .values()
            .filter(|item| item.status == "running")
            .map(|item| item.user_host_account_id)
            .collect();
        let next_id = inner
            .queue
            .values()
            .filter(|item| {
                item.status == "queued"
                    && item.scheduled_at <= now
                    && !running_accounts.contains(&item.user_host_account_id)
            })
            .min_by_key(|item| (Reverse(item.priority), item.scheduled_at, item.created_at))
            .map(|item| item.id);
        let Some(next_id) = next_id else {
            return Ok(None);
        };
        let item = inner.queue.get_mut(&next_id).expect("claimed item exists");
        item.status = "running".to_string();
        item.started_at = Some(now);
        Ok(Some(item.clone()))
    }

    async fn release_expired_leases(&self, lease: Duration) -> StoreResult<u64> {
        let cutoff = Utc::now() - lease;
        let mut released = 0;
        let mut inner = self.lock();
        for item in inner.queue.values_mut() {
            if item.status == "running"
                && item.started_at.map(|ts| ts < cutoff).unwrap_or(false)
            {
                item.status = "queued".to_string();
                item.started_at = None;
                item.scheduled_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn mark_item_completed(&self, item_id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(item) = inner.queue.get_mut(&item_id) {
            item.status = "completed".to_string();
            item.finished_at = Some(Utc::now());
            item.error = None;
        }
        Ok(())
    }

    async fn mark_item_cancelled(&self, item_id: Uuid, reason: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(item) = inner.queue.get_mut(&item_id) {
            item.status = "cancelled".to_string();
            item.finished_at = Some(Utc::now());
            item.error = Some(reason.to_string());
        }
        Ok(())
    }

    async fn requeue_item(
        &self,
        item_id: Uuid,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(item) = inner.queue.get_mut(&item_id) {
            item.status = "queued".to_string();
            item.started_at = None;
            item.scheduled_at = scheduled_at;
            item.retry_count = retry_count;
            item.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_item_failed(
        &self,
        item_id: Uuid,
        retry_count: i32,
        error: &str,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(item) = inner.queue.get_mut(&item_id) {
            item.status = "failed".to_string();
            item.finished_at = Some(Utc::now());
            item.retry_count = retry_count;
            item.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn prune_finished_items(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock();
        let before = inner.queue.len();
        inner.queue.retain(|_, item| {
            !(matches!(item.status.as_str(), "completed" | "failed" | "cancelled")
                && item.finished_at.map(|ts| ts < older_than).unwrap_or(false))
        });
        Ok((before - inner.queue.len()) as u64)
    }

    async fn queue_depth_by_status(&self) -> StoreResult<BTreeMap<String, i64>> {
        let inner = self.lock();
        let mut depth = BTreeMap::new();
        for item in inner.queue.values() {
            *depth.entry(item.status.clone()).or_insert(0) += 1;
        }
        Ok(depth)
    }

    async fn last_successful_deployment(
        &self,
        host_id: Uuid,
        user_host_account_id: Uuid,
    ) -> StoreResult<Option<DeploymentRow>> {
        let inner = self.lock();
        Ok(inner
            .deployments
            .iter()
            .filter(|row| {
                row.host_id == host_id
                    && row.user_host_account_id == user_host_account_id
                    && row.status == "success"
            })
            .max_by_key(|row| row.generation)
            .cloned())
    }

    async fn record_deployment(&self, new: NewDeployment) -> StoreResult<DeploymentRow> {
        let mut inner = self.lock();
        let generation = inner
            .deployments
            .iter()
            .filter(|row| {
                row.host_id == new.host_id
                    && row.user_host_account_id == new.user_host_account_id
            })
            .map(|row| row.generation)
            .max()
            .unwrap_or(0)
            + 1;
        let row = DeploymentRow {
            id: Uuid::new_v4(),
            host_id: new.host_id,
            user_host_account_id: new.user_host_account_id,
            generation,
            status: new.status.as_str().to_string(),
            checksum: new.checksum,
            key_count: new.key_count,
            started_at: new.started_at,
            finished_at: Some(Utc::now()),
            error: new.error,
            retry_count: new.retry_count,
        };
        inner.deployments.push(row.clone());
        Ok(row)
    }

    async fn deployments_for_host(
        &self,
        host_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<DeploymentRow>> {
        let inner = self.lock();
        let mut rows: Vec<DeploymentRow> = inner
            .deployments
            .iter()
            .filter(|row| row.host_id == host_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then(b.generation.cmp(&a.generation))
        });
        rows.truncate(limit.clamp(1, 1_000) as usize);
        Ok(rows)
    }

    async fn deployments_for_account(
        &self,
        user_host_account_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<DeploymentRow>> {
        let inner = self.lock();
        let mut rows: Vec<DeploymentRow> = inner
            .deployments
            .iter()
            .filter(|row| row.user_host_account_id == user_host_account_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.generation.cmp(&a.generation));
        rows.truncate(limit.clamp(1, 1_000) as usize);
        Ok(rows)
    }

    async fn mark_keys_applied(&self, key_ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        for key_id in key_ids {
            if let Some(key) = inner.keys.get_mut(key_id) {
                key.last_applied_at = Some(at);
            }
        }
        Ok(())
    }

    async fn touch_host_seen(&self, host_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(host) = inner.hosts.get_mut(&host_id) {
            if host.last_seen_at.map(|prev| at > prev).unwrap_or(true) {
                host.last_seen_at = Some(at);
            }
        }
        Ok(())
    }

    async fn revoke_keys_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Vec<RevokedKey>> {
        let mut inner = self.lock();
        let mut revoked = Vec::new();
        for (id, key) in inner.keys.iter_mut() {
            if key.fingerprint_sha256 == fingerprint && key.status != "revoked" {
                key.status = "revoked".to_string();
                revoked.push(RevokedKey {
                    key_id: *id,
                    user_id: key.user_id,
                });
            }
        }
        Ok(revoked)
    }

    async fn expire_overdue_keys(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock();
        let mut expired = 0;
        for key in inner.keys.values_mut() {
            if key.status == "active" && key.expires_at.map(|ts| ts <= now).unwrap_or(false) {
                key.status = "expired".to_string();
                expired += 1;
            }
        }
        Ok(expired)
    }
}
