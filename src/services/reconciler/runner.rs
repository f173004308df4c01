use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::EngineConfig;

use super::applier::{authorized_keys_path, ApplyError, ApplyTarget, RemoteApplier};
use super::notify::Notifier;
use super::render::{render_authorized_keys, RenderedAuthorizedKeys};
use super::store::{ReconcileStore, StoreError};
use super::types::{
    ApplyQueueItem, DeploymentStatus, ErrorClass, MappingContext, NewDeployment, TerminalFailure,
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3_600);

/// Exponential backoff for the nth retry, capped. `backoff(1)` is the base
/// delay; each further retry doubles it.
pub fn backoff_delay(
    base: ChronoDuration,
    cap: ChronoDuration,
    retry_count: i32,
) -> ChronoDuration {
    let exp = (retry_count - 1).clamp(0, 16) as u32;
    let delay = base * 2_i32.pow(exp);
    if delay > cap {
        cap
    } else {
        delay
    }
}

/// Fixed-size pool pulling from the shared apply queue. The atomic
/// queued->running claim in the store is the only cross-worker
/// serialization; each worker takes one job end-to-end.
pub struct ReconcileWorkerPool {
    store: Arc<dyn ReconcileStore>,
    applier: Arc<dyn RemoteApplier>,
    notifier: Arc<dyn Notifier>,
    templates: BTreeMap<String, String>,
    apply_ssh_port: u16,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
    lease: ChronoDuration,
    max_retries: i32,
    backoff_base: ChronoDuration,
    backoff_cap: ChronoDuration,
    queue_retention: ChronoDuration,
    operation_timeout: Duration,
}

impl ReconcileWorkerPool {
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        applier: Arc<dyn RemoteApplier>,
        notifier: Arc<dyn Notifier>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            applier,
            notifier,
            templates: config.authorized_keys_templates.clone(),
            apply_ssh_port: config.apply_ssh_port,
            semaphore: Arc::new(Semaphore::new(config.worker_count.max(1))),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            lease: ChronoDuration::seconds(config.lease_seconds as i64),
            max_retries: config.max_retries,
            backoff_base: ChronoDuration::seconds(config.retry_backoff_base_seconds as i64),
            backoff_cap: ChronoDuration::seconds(config.retry_backoff_cap_seconds as i64),
            queue_retention: ChronoDuration::days(config.queue_retention_days as i64),
            operation_timeout: Duration::from_secs(config.operation_timeout_seconds),
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut last_maintenance = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }

                if let Err(err) = self.store.release_expired_leases(self.lease).await {
                    tracing::warn!(error = %err, "lease sweep failed");
                }

                if last_maintenance.elapsed() >= MAINTENANCE_INTERVAL {
                    last_maintenance = tokio::time::Instant::now();
                    self.run_maintenance().await;
                }

                while let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                    let item = match self.store.claim_next().await {
                        Ok(item) => item,
                        Err(err) => {
                            tracing::warn!(error = %err, "queue claim failed");
                            drop(permit);
                            break;
                        }
                    };
                    let Some(item) = item else {
                        drop(permit);
                        break;
                    };

                    let pool = self.clone();
                    let span = tracing::info_span!(
                        "reconcile_job",
                        item_id = %item.id,
                        account_id = %item.user_host_account_id,
                        retry_count = item.retry_count,
                    );
                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            if let Err(err) = pool.run_one(item).await {
                                tracing::warn!(error = %err, "reconcile worker error");
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        });
    }

    /// Claim and run due jobs until the queue is drained, inline on the
    /// caller's task.
    pub async fn drain_once(&self) -> Result<u32, StoreError> {
        let mut processed = 0;
        while let Some(item) = self.store.claim_next().await? {
            self.run_one(item).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn run_maintenance(&self) {
        let now = Utc::now();
        match self.store.expire_overdue_keys(now).await {
            Ok(expired) if expired > 0 => {
                tracing::info!(expired, "expired overdue keys");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "key expiry sweep failed"),
        }
        match self.store.prune_finished_items(now - self.queue_retention).await {
            Ok(pruned) if pruned > 0 => {
                tracing::info!(pruned, "pruned finished queue items");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "queue prune failed"),
        }
    }

    async fn run_one(&self, item: ApplyQueueItem) -> Result<(), StoreError> {
        let started_at = Utc::now();

        let Some(context) = self.store.mapping_context(item.user_host_account_id).await? else {
            tracing::warn!(
                item_id = %item.id,
                account_id = %item.user_host_account_id,
                "mapping no longer exists; cancelling job"
            );
            return self
                .store
                .mark_item_cancelled(item.id, "user_host_account no longer exists")
                .await;
        };

        if !context.is_active() {
            self.record_attempt(
                &item,
                &context,
                DeploymentStatus::Cancelled,
                None,
                0,
                Some("mapping or owning user disabled"),
                item.retry_count,
                started_at,
            )
            .await;
            return self
                .store
                .mark_item_cancelled(item.id, "mapping or owning user disabled")
                .await;
        }

        // Always recompute desired state; enqueued payloads are never
        // replayed, so coalesced or duplicate enqueues are harmless.
        let keys = self.store.list_active_keys(context.mapping.user_id).await?;
        let rendered = render_authorized_keys(&keys);

        let baseline = self
            .store
            .last_successful_deployment(context.host.id, context.mapping.id)
            .await?;
        let needs_write = baseline
            .as_ref()
            .and_then(|row| row.checksum.as_deref())
            != Some(rendered.checksum.as_str());

        let apply_result = if needs_write {
            let target = ApplyTarget {
                hostname: context.host.hostname.clone(),
                address: context.host.address.clone(),
                port: self.apply_ssh_port,
                remote_username: context.mapping.remote_username.clone(),
                authorized_keys_path: authorized_keys_path(
                    &self.templates,
                    &context.host.os_family,
                    &context.mapping.remote_username,
                ),
            };
            self.invoke_applier(target, rendered.content.clone()).await
        } else {
            Ok(())
        };

        match apply_result {
            Ok(()) => {
                let recorded = self
                    .store
                    .record_deployment(NewDeployment {
                        host_id: context.host.id,
                        user_host_account_id: context.mapping.id,
                        status: DeploymentStatus::Success,
                        checksum: Some(rendered.checksum.clone()),
                        key_count: rendered.key_count as i32,
                        started_at,
                        error: None,
                        retry_count: item.retry_count,
                    })
                    .await;
                match recorded {
                    Ok(row) => {
                        let now = Utc::now();
                        if needs_write {
                            self.store.mark_keys_applied(&rendered.key_ids, now).await?;
                            self.store.touch_host_seen(context.host.id, now).await?;
                        }
                        self.store.mark_item_completed(item.id).await?;
                        tracing::info!(
                            host = %context.host.hostname,
                            account = %context.mapping.remote_username,
                            generation = row.generation,
                            key_count = rendered.key_count,
                            no_op = !needs_write,
                            "reconciliation succeeded"
                        );
                        Ok(())
                    }
                    Err(StoreError::GenerationConflict {
                        user_host_account_id,
                        attempted,
                    }) => {
                        let err = ApplyError {
                            class: ErrorClass::Invariant,
                            message: format!(
                                "generation {attempted} already recorded for account {user_host_account_id}"
                            ),
                        };
                        self.handle_failure(&item, &context, &rendered, err, started_at, false)
                            .await
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => {
                self.handle_failure(&item, &context, &rendered, err, started_at, true)
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        item: &ApplyQueueItem,
        context: &MappingContext,
        rendered: &RenderedAuthorizedKeys,
        err: ApplyError,
        started_at: DateTime<Utc>,
        record: bool,
    ) -> Result<(), StoreError> {
        if err.class == ErrorClass::Inconsistent {
            return self.store.mark_item_cancelled(item.id, &err.message).await;
        }

        let retry_count = item.retry_count + 1;
        let ceiling = match err.class {
            ErrorClass::Transport => self.max_retries,
            // Config and invariant failures get one retry to rule out a
            // transient cause, never an open-ended loop.
            ErrorClass::Config | ErrorClass::Invariant => self.max_retries.min(2),
            ErrorClass::Inconsistent => unreachable!("handled above"),
        };

        if record {
            self.record_attempt(
                item,
                context,
                DeploymentStatus::Failed,
                Some(rendered.checksum.as_str()),
                rendered.key_count as i32,
                Some(err.message.as_str()),
                retry_count,
                started_at,
            )
            .await;
        }

        match err.class {
            ErrorClass::Invariant => tracing::error!(
                item_id = %item.id,
                account_id = %context.mapping.id,
                error = %err.message,
                "invariant violation during reconciliation"
            ),
            _ => tracing::warn!(
                item_id = %item.id,
                host = %context.host.hostname,
                class = err.class.as_str(),
                retry_count,
                error = %err.message,
                "reconciliation attempt failed"
            ),
        }

        if retry_count >= ceiling {
            self.store
                .mark_item_failed(item.id, retry_count, &err.message)
                .await?;
            self.notifier
                .terminal_failure(&TerminalFailure {
                    user_id: context.mapping.user_id,
                    host_id: context.host.id,
                    error: err.message,
                    retry_count,
                })
                .await;
        } else {
            let delay = backoff_delay(self.backoff_base, self.backoff_cap, retry_count);
            self.store
                .requeue_item(item.id, retry_count, Utc::now() + delay, &err.message)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_attempt(
        &self,
        item: &ApplyQueueItem,
        context: &MappingContext,
        status: DeploymentStatus,
        checksum: Option<&str>,
        key_count: i32,
        error: Option<&str>,
        retry_count: i32,
        started_at: DateTime<Utc>,
    ) {
        let recorded = self
            .store
            .record_deployment(NewDeployment {
                host_id: context.host.id,
                user_host_account_id: context.mapping.id,
                status,
                checksum: checksum.map(str::to_string),
                key_count,
                started_at,
                error: error.map(str::to_string),
                retry_count,
            })
            .await;
        if let Err(err) = recorded {
            tracing::error!(
                item_id = %item.id,
                account_id = %context.mapping.id,
                error = %err,
                "failed to record deployment attempt"
            );
        }
    }

    async fn invoke_applier(
        &self,
        target: ApplyTarget,
        content: String,
    ) -> Result<(), ApplyError> {
        let applier = self.applier.clone();
        // Session timeouts bound the transport; this outer timeout bounds
        // the whole attempt even if libssh2 stalls.
        let budget = self.operation_timeout + Duration::from_secs(5);
        let task = tokio::task::spawn_blocking(move || applier.apply(&target, content.as_bytes()));
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ApplyError::transport(format!(
                "applier task failed: {join_err}"
            ))),
            Err(_) => Err(ApplyError::transport(format!(
                "apply timed out after {}s",
                budget.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::reconciler::{
        ApplyPriority, ChannelNotifier, MemoryStore, NotificationEvent, EMPTY_CONTENT_CHECKSUM,
    };
    use crate::test_support::{test_config, FakeApplier};
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    struct Rig {
        store: Arc<MemoryStore>,
        applier: Arc<FakeApplier>,
        pool: Arc<ReconcileWorkerPool>,
        events: UnboundedReceiver<NotificationEvent>,
        user_id: Uuid,
        host_id: Uuid,
        account_id: Uuid,
    }

    fn rig_with(config: EngineConfig) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let applier = FakeApplier::new();
        let (notifier, events) = ChannelNotifier::new();
        let user_id = store.seed_user("alice");
        let host_id = store.seed_host("node-1", "10.0.0.1", "linux");
        let account_id = store.seed_mapping(user_id, host_id, "alice");
        let pool = Arc::new(ReconcileWorkerPool::new(
            store.clone(),
            applier.clone(),
            Arc::new(notifier),
            &config,
        ));
        Rig {
            store,
            applier,
            pool,
            events,
            user_id,
            host_id,
            account_id,
        }
    }

    fn rig() -> Rig {
        let mut config = test_config();
        // Immediate retries keep drain_once deterministic.
        config.retry_backoff_base_seconds = 0;
        rig_with(config)
    }

    const LIVE_PATH: &str = "/home/alice/.ssh/authorized_keys";

    async fn account_deployments(rig: &Rig) -> Vec<super::super::types::DeploymentRow> {
        let mut rows = rig
            .store
            .deployments_for_account(rig.account_id, 100)
            .await
            .unwrap();
        rows.sort_by_key(|row| row.generation);
        rows
    }

    #[tokio::test]
    async fn applying_unchanged_state_skips_the_remote_write() {
        let mut rig = rig();
        rig.store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);

        rig.store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        assert_eq!(rig.pool.drain_once().await.unwrap(), 1);

        rig.store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        assert_eq!(rig.pool.drain_once().await.unwrap(), 1);

        let rows = account_deployments(&rig).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].generation, 1);
        assert_eq!(rows[1].generation, 2);
        assert_eq!(rows[0].checksum, rows[1].checksum);
        assert_eq!(rows[0].status, "success");
        assert_eq!(rows[1].status, "success");
        // Exactly one remote write: the second pass was a no-op.
        assert_eq!(rig.applier.publish_count(), 1);
        assert!(rig.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn revoke_then_resync_walks_generations_forward() {
        let rig = rig();
        let f1 = rig
            .store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);
        rig.store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA2", "fp-two", None, None);

        rig.store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();

        let rows = account_deployments(&rig).await;
        let c1 = rows[0].checksum.clone().unwrap();
        assert_eq!(rows[0].key_count, 2);

        rig.store.set_key_status(f1, "revoked");
        rig.store
            .enqueue(rig.account_id, ApplyPriority::Emergency)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();

        let rows = account_deployments(&rig).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].generation, 2);
        assert_eq!(rows[1].status, "success");
        assert_eq!(rows[1].key_count, 1);
        let c2 = rows[1].checksum.clone().unwrap();
        assert_ne!(c1, c2);

        // No state change: another pass records generation 3 with the same
        // checksum and leaves the remote file alone.
        rig.store
            .enqueue(rig.account_id, ApplyPriority::Routine)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();

        let rows = account_deployments(&rig).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].generation, 3);
        assert_eq!(rows[2].checksum.as_deref(), Some(c2.as_str()));
        assert_eq!(rig.applier.publish_count(), 2);

        let generations: Vec<i64> = rows.iter().map(|row| row.generation).collect();
        assert_eq!(generations, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn revoking_the_last_key_deploys_an_empty_file() {
        let rig = rig();
        let key = rig
            .store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);

        rig.store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();
        assert!(!rig.applier.live_content(LIVE_PATH).unwrap().is_empty());

        rig.store.set_key_status(key, "revoked");
        rig.store
            .enqueue(rig.account_id, ApplyPriority::Emergency)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();

        assert_eq!(rig.applier.live_content(LIVE_PATH).unwrap(), b"");
        let rows = account_deployments(&rig).await;
        assert_eq!(
            rows.last().unwrap().checksum.as_deref(),
            Some(EMPTY_CONTENT_CHECKSUM)
        );
        assert_eq!(rows.last().unwrap().key_count, 0);
    }

    #[tokio::test]
    async fn transport_failures_stop_at_the_retry_ceiling() {
        let mut rig = rig();
        rig.store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);
        for _ in 0..5 {
            rig.applier
                .script_failure(ApplyError::transport("connection timed out"));
        }

        let item_id = rig
            .store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();

        let item = rig.store.queue_item(item_id).unwrap();
        assert_eq!(item.status, "failed");
        assert_eq!(item.retry_count, 3);

        let rows = account_deployments(&rig).await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.status == "failed"));
        assert_eq!(
            rows.iter().map(|row| row.generation).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        match rig.events.try_recv().unwrap() {
            NotificationEvent::TerminalFailure(failure) => {
                assert_eq!(failure.user_id, rig.user_id);
                assert_eq!(failure.host_id, rig.host_id);
                assert_eq!(failure.retry_count, 3);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
        assert!(rig.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn retry_is_scheduled_with_backoff_delay() {
        let mut config = test_config();
        config.retry_backoff_base_seconds = 60;
        let rig = rig_with(config);
        rig.store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);
        rig.applier
            .script_failure(ApplyError::transport("connection reset"));

        let item_id = rig
            .store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();

        let item = rig.store.queue_item(item_id).unwrap();
        assert_eq!(item.status, "queued");
        assert_eq!(item.retry_count, 1);
        assert!(item.scheduled_at > Utc::now() + ChronoDuration::seconds(50));
        // Not due yet, so nothing claims it.
        assert!(rig.store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn config_failures_get_exactly_one_retry() {
        let mut rig = rig();
        rig.store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);
        for _ in 0..5 {
            rig.applier
                .script_failure(ApplyError::config("auth failed for apply user"));
        }

        let item_id = rig
            .store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();

        let item = rig.store.queue_item(item_id).unwrap();
        assert_eq!(item.status, "failed");
        assert_eq!(item.retry_count, 2);
        assert_eq!(account_deployments(&rig).await.len(), 2);
        assert!(matches!(
            rig.events.try_recv().unwrap(),
            NotificationEvent::TerminalFailure(_)
        ));
    }

    #[tokio::test]
    async fn crash_mid_write_never_corrupts_the_live_file() {
        let rig = rig();
        let key = rig
            .store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);

        rig.store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();
        let before = rig.applier.live_content(LIVE_PATH).unwrap();

        // Desired state changes, but every upload dies partway through.
        rig.store.set_key_status(key, "revoked");
        rig.store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA2", "fp-two", None, None);
        rig.applier.set_crash_mid_write(true);

        rig.store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();

        // Rename-only-after-full-write: the live file still holds the last
        // published content, staged bytes notwithstanding.
        assert_eq!(rig.applier.live_content(LIVE_PATH).unwrap(), before);
        assert_eq!(rig.applier.publish_count(), 1);
        assert!(rig.applier.staged_content(&format!("{LIVE_PATH}.tmp")).is_some());

        rig.applier.set_crash_mid_write(false);
        rig.store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();
        assert_ne!(rig.applier.live_content(LIVE_PATH).unwrap(), before);
        assert_eq!(rig.applier.publish_count(), 2);
    }

    #[tokio::test]
    async fn disabled_mapping_cancels_instead_of_retrying() {
        let mut rig = rig();
        rig.store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);
        let item_id = rig
            .store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.store.set_mapping_status(rig.account_id, "disabled");

        rig.pool.drain_once().await.unwrap();

        let item = rig.store.queue_item(item_id).unwrap();
        assert_eq!(item.status, "cancelled");
        let rows = account_deployments(&rig).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "cancelled");
        assert_eq!(rig.applier.publish_count(), 0);
        assert!(rig.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn vanished_mapping_cancels_without_a_ledger_row() {
        let rig = rig();
        let item_id = rig
            .store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.store.remove_mapping(rig.account_id);

        rig.pool.drain_once().await.unwrap();

        let item = rig.store.queue_item(item_id).unwrap();
        assert_eq!(item.status, "cancelled");
        assert!(account_deployments(&rig).await.is_empty());
    }

    #[tokio::test]
    async fn successful_writes_stamp_keys_and_host() {
        let rig = rig();
        let key = rig
            .store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);

        rig.store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();

        let applied_at = rig.store.key_last_applied(key).expect("stamped key");
        let seen_at = rig.store.host_last_seen(rig.host_id).expect("stamped host");

        // A no-op pass records a deployment but leaves the stamps alone.
        rig.store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();
        rig.pool.drain_once().await.unwrap();
        assert_eq!(rig.store.key_last_applied(key), Some(applied_at));
        assert_eq!(rig.store.host_last_seen(rig.host_id), Some(seen_at));
    }

    #[tokio::test]
    async fn started_pool_drains_the_queue_in_the_background() {
        let rig = {
            let mut config = test_config();
            config.poll_interval_ms = 50;
            rig_with(config)
        };
        rig.store
            .seed_key(rig.user_id, "ssh-ed25519 AAAA1", "fp-one", None, None);
        let item_id = rig
            .store
            .enqueue(rig.account_id, ApplyPriority::User)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        rig.pool.clone().start(cancel.clone());

        let mut completed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if rig.store.queue_item(item_id).unwrap().status == "completed" {
                completed = true;
                break;
            }
        }
        cancel.cancel();
        assert!(completed, "queue item never completed");
        assert_eq!(rig.applier.publish_count(), 1);
    }

    #[test]
    fn backoff_gaps_double_until_the_cap() {
        let base = ChronoDuration::seconds(60);
        let cap = ChronoDuration::seconds(3_600);
        let gaps: Vec<i64> = (1..=7)
            .map(|retry| backoff_delay(base, cap, retry).num_seconds())
            .collect();
        assert_eq!(gaps, vec![60, 120, 240, 480, 960, 1_920, 3_600]);
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(backoff_delay(base, cap, 30).num_seconds(), 3_600);
    }
}
