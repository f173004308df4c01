use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::store::{ReconcileStore, StoreError, StoreResult};
use super::types::{
    ActiveKey, ApplyPriority, ApplyQueueItem, DeploymentRow, HostRecord, MappingContext,
    MappingRecord, NewDeployment, RevokedKey,
};

const QUEUE_ITEM_COLUMNS: &str = "id, user_host_account_id, priority, status, scheduled_at, \
     started_at, finished_at, retry_count, error, created_at";

const DEPLOYMENT_COLUMNS: &str = "id, host_id, user_host_account_id, generation, status, \
     checksum, key_count, started_at, finished_at, error, retry_count";

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn advisory_lock_key(namespace: &str, value: &str) -> i64 {
    fn fnv1a_64(input: &str) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in input.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }

    let combined = format!("{namespace}:{value}");
    fnv1a_64(&combined) as i64
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl ReconcileStore for PgStore {
    async fn list_active_keys(&self, user_id: Uuid) -> StoreResult<Vec<ActiveKey>> {
        let keys: Vec<ActiveKey> = sqlx::query_as(
            r#"
            SELECT id, public_key, authorized_keys_options, comment, fingerprint_sha256
            FROM ssh_keys
            WHERE user_id = $1
              AND status = 'active'
              AND (expires_at IS NULL OR expires_at > now())
            ORDER BY fingerprint_sha256 ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(keys)
    }

    async fn list_active_mappings(&self, host_id: Option<Uuid>) -> StoreResult<Vec<MappingRecord>> {
        let mappings: Vec<MappingRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, host_id, remote_username, status
            FROM user_host_accounts
            WHERE status = 'active'
              AND ($1::uuid IS NULL OR host_id = $1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(host_id)
        .fetch_all(&self.db)
        .await?;
        Ok(mappings)
    }

    async fn list_active_mappings_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Vec<MappingRecord>> {
        let mappings: Vec<MappingRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, host_id, remote_username, status
            FROM user_host_accounts
            WHERE status = 'active' AND user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(mappings)
    }

    async fn mapping_context(
        &self,
        user_host_account_id: Uuid,
    ) -> StoreResult<Option<MappingContext>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: Uuid,
            user_id: Uuid,
            host_id: Uuid,
            remote_username: String,
            status: String,
            hostname: String,
            address: String,
            os_family: String,
            user_status: String,
        }

        let row: Option<Row> = sqlx::query_as(
            r#"
            SELECT
                uha.id, uha.user_id, uha.host_id, uha.remote_username, uha.status,
                h.hostname, h.address, h.os_family,
                u.status AS user_status
            FROM user_host_accounts uha
            JOIN managed_hosts h ON h.id = uha.host_id
            JOIN users u ON u.id = uha.user_id
            WHERE uha.id = $1
            LIMIT 1
            "#,
        )
        .bind(user_host_account_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| MappingContext {
            mapping: MappingRecord {
                id: row.id,
                user_id: row.user_id,
                host_id: row.host_id,
                remote_username: row.remote_username,
                status: row.status,
            },
            host: HostRecord {
                id: row.host_id,
                hostname: row.hostname,
                address: row.address,
                os_family: row.os_family,
            },
            user_status: row.user_status,
        }))
    }

    async fn enqueue(
        &self,
        user_host_account_id: Uuid,
        priority: ApplyPriority,
    ) -> StoreResult<Uuid> {
        // Upsert-by-account: duplicate enqueues collapse onto the pending
        // row, keeping its earliest schedule and the highest priority.
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO apply_queue (
                id, user_host_account_id, priority, status, scheduled_at, retry_count, created_at
            ) VALUES ($1, $2, $3, 'queued', now(), 0, now())
            ON CONFLICT (user_host_account_id) WHERE status = 'queued'
            DO UPDATE SET
                priority = GREATEST(apply_queue.priority, EXCLUDED.priority),
                scheduled_at = LEAST(apply_queue.scheduled_at, EXCLUDED.scheduled_at)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_host_account_id)
        .bind(priority.as_i16())
        .fetch_one(&self.db)
        .await?;
        Ok(row.0)
    }

    async fn claim_next(&self) -> StoreResult<Option<ApplyQueueItem>> {
        let mut tx = self.db.begin().await?;

        // Claims are the sole serialization point; the advisory lock keeps
        // the running-account exclusion race-free across workers.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key("apply_queue", "claim"))
            .execute(&mut *tx)
            .await?;

        let claimed: Option<ApplyQueueItem> = sqlx::query_as(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM apply_queue
                WHERE status = 'queued'
                  AND scheduled_at <= now()
                  AND user_host_account_id NOT IN (
                    SELECT user_host_account_id FROM apply_queue WHERE status = 'running'
                  )
                ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE apply_queue
            SET status = 'running',
                started_at = now()
            WHERE id IN (SELECT id FROM next)
            RETURNING {QUEUE_ITEM_COLUMNS}
            "#
        ))
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(claimed)
    }

    async fn release_expired_leases(&self, lease: Duration) -> StoreResult<u64> {
        // Crashed-worker recovery: the lease is the running status plus
        // started_at, nothing in memory. retry_count stays untouched.
        let result = sqlx::query(
            r#"
            UPDATE apply_queue
            SET status = 'queued',
                started_at = NULL,
                scheduled_at = now()
            WHERE status = 'running'
              AND started_at < now() - make_interval(secs => $1::int)
            "#,
        )
        .bind(lease.num_seconds().max(0) as i32)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_item_completed(&self, item_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE apply_queue
            SET status = 'completed',
                finished_at = now(),
                error = NULL
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_item_cancelled(&self, item_id: Uuid, reason: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE apply_queue
            SET status = 'cancelled',
                finished_at = now(),
                error = $2
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(reason)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn requeue_item(
        &self,
        item_id: Uuid,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE apply_queue
            SET status = 'queued',
                started_at = NULL,
                scheduled_at = $3,
                retry_count = $2,
                error = $4
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(retry_count)
        .bind(scheduled_at)
        .bind(error)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_item_failed(
        &self,
        item_id: Uuid,
        retry_count: i32,
        error: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE apply_queue
            SET status = 'failed',
                finished_at = now(),
                retry_count = $2,
                error = $3
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(retry_count)
        .bind(error)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn prune_finished_items(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM apply_queue
            WHERE status = ANY($1)
              AND finished_at IS NOT NULL
              AND finished_at < $2
            "#,
        )
        .bind(vec!["completed", "failed", "cancelled"])
        .bind(older_than)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn queue_depth_by_status(&self) -> StoreResult<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)::BIGINT
            FROM apply_queue
            GROUP BY status
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn last_successful_deployment(
        &self,
        host_id: Uuid,
        user_host_account_id: Uuid,
    ) -> StoreResult<Option<DeploymentRow>> {
        let row: Option<DeploymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS}
            FROM deployments
            WHERE host_id = $1
              AND user_host_account_id = $2
              AND status = 'success'
            ORDER BY generation DESC
            LIMIT 1
            "#
        ))
        .bind(host_id)
        .bind(user_host_account_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn record_deployment(&self, new: NewDeployment) -> StoreResult<DeploymentRow> {
        let mut tx = self.db.begin().await?;

        let last: (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(generation), 0)
            FROM deployments
            WHERE host_id = $1 AND user_host_account_id = $2
            "#,
        )
        .bind(new.host_id)
        .bind(new.user_host_account_id)
        .fetch_one(&mut *tx)
        .await?;
        let generation = last.0 + 1;

        let inserted: Result<DeploymentRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO deployments (
                id, host_id, user_host_account_id, generation, status, checksum,
                key_count, started_at, finished_at, error, retry_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), $9, $10)
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.host_id)
        .bind(new.user_host_account_id)
        .bind(generation)
        .bind(new.status.as_str())
        .bind(new.checksum.as_deref())
        .bind(new.key_count)
        .bind(new.started_at)
        .bind(new.error.as_deref())
        .bind(new.retry_count)
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(row) => {
                tx.commit().await?;
                Ok(row)
            }
            // The (host, account, generation) uniqueness constraint exists
            // to detect generation races, not to absorb them.
            Err(err) if is_unique_violation(&err) => Err(StoreError::GenerationConflict {
                user_host_account_id: new.user_host_account_id,
                attempted: generation,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn deployments_for_host(
        &self,
        host_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<DeploymentRow>> {
        let rows: Vec<DeploymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS}
            FROM deployments
            WHERE host_id = $1
            ORDER BY started_at DESC, generation DESC
            LIMIT $2
            "#
        ))
        .bind(host_id)
        .bind(limit.clamp(1, 1_000))
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn deployments_for_account(
        &self,
        user_host_account_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<DeploymentRow>> {
        let rows: Vec<DeploymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {DEPLOYMENT_COLUMNS}
            FROM deployments
            WHERE user_host_account_id = $1
            ORDER BY generation DESC
            LIMIT $2
            "#
        ))
        .bind(user_host_account_id)
        .bind(limit.clamp(1, 1_000))
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn mark_keys_applied(&self, key_ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<()> {
        if key_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE ssh_keys
            SET last_applied_at = $2
            WHERE id = ANY($1)
            "#,
        )
        .bind(key_ids.to_vec())
        .bind(at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn touch_host_seen(&self, host_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE managed_hosts
            SET last_seen_at = $2
            WHERE id = $1
              AND (last_seen_at IS NULL OR $2 > last_seen_at)
            "#,
        )
        .bind(host_id)
        .bind(at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn revoke_keys_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Vec<RevokedKey>> {
        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE ssh_keys
            SET status = 'revoked'
            WHERE fingerprint_sha256 = $1
              AND status <> 'revoked'
            RETURNING id, user_id
            "#,
        )
        .bind(fingerprint)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(key_id, user_id)| RevokedKey { key_id, user_id })
            .collect())
    }

    async fn expire_overdue_keys(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ssh_keys
            SET status = 'expired'
            WHERE status = 'active'
              AND expires_at IS NOT NULL
              AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }
}
