use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::notify::Notifier;
use super::store::{ReconcileStore, StoreResult};
use super::types::{ApplyPriority, DeploymentPublic, QueueStatus, RevokeSummary};
use super::ReconcileEngine;

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        notifier: Arc<dyn Notifier>,
        history_limit: i64,
    ) -> Self {
        Self {
            store,
            notifier,
            history_limit,
        }
    }

    /// Enqueue a reconciliation for one mapping. Returns `None` when the
    /// mapping is unknown or no longer active.
    pub async fn enqueue_apply(
        &self,
        user_host_account_id: Uuid,
        priority: ApplyPriority,
    ) -> StoreResult<Option<Uuid>> {
        match self.store.mapping_context(user_host_account_id).await? {
            Some(context) if context.is_active() => {
                let item_id = self.store.enqueue(user_host_account_id, priority).await?;
                tracing::info!(
                    account_id = %user_host_account_id,
                    priority = priority.as_str(),
                    "enqueued reconciliation"
                );
                Ok(Some(item_id))
            }
            _ => Ok(None),
        }
    }

    /// Enqueue every active mapping, optionally narrowed to one host.
    pub async fn enqueue_apply_all(
        &self,
        host_id: Option<Uuid>,
        priority: ApplyPriority,
    ) -> StoreResult<u64> {
        let mappings = self.store.list_active_mappings(host_id).await?;
        let mut queued = 0;
        for mapping in &mappings {
            self.store.enqueue(mapping.id, priority).await?;
            queued += 1;
        }
        tracing::info!(queued, priority = priority.as_str(), "bulk apply enqueued");
        Ok(queued)
    }

    /// Fingerprint-targeted kill switch: revoke every matching key, then
    /// push one emergency job per affected mapping so the fleet converges
    /// in a single queue pass.
    pub async fn emergency_revoke(&self, fingerprint: &str) -> StoreResult<RevokeSummary> {
        let fingerprint = fingerprint.trim().to_lowercase();
        let revoked = self.store.revoke_keys_by_fingerprint(&fingerprint).await?;

        let mut affected_users: Vec<Uuid> = revoked.iter().map(|key| key.user_id).collect();
        affected_users.sort_unstable();
        affected_users.dedup();

        for user_id in &affected_users {
            for mapping in self.store.list_active_mappings_for_user(*user_id).await? {
                self.store
                    .enqueue(mapping.id, ApplyPriority::Emergency)
                    .await?;
            }
        }

        let summary = RevokeSummary {
            fingerprint,
            revoked_count: revoked.len() as u64,
            affected_users,
        };
        self.notifier.emergency_revoke_completed(&summary).await;
        Ok(summary)
    }

    /// Queue depth per status, zero-filled so the metrics surface sees
    /// every band even when the queue is empty.
    pub async fn queue_depth(&self) -> StoreResult<BTreeMap<String, i64>> {
        let mut depth: BTreeMap<String, i64> = [
            QueueStatus::Queued,
            QueueStatus::Running,
            QueueStatus::Completed,
            QueueStatus::Failed,
            QueueStatus::Cancelled,
        ]
        .iter()
        .map(|status| (status.as_str().to_string(), 0))
        .collect();
        for (status, count) in self.store.queue_depth_by_status().await? {
            depth.insert(status, count);
        }
        Ok(depth)
    }

    pub async fn deployments_for_host(&self, host_id: Uuid) -> StoreResult<Vec<DeploymentPublic>> {
        let rows = self
            .store
            .deployments_for_host(host_id, self.history_limit)
            .await?;
        Ok(rows.iter().map(|row| row.to_public()).collect())
    }

    pub async fn deployments_for_account(
        &self,
        user_host_account_id: Uuid,
    ) -> StoreResult<Vec<DeploymentPublic>> {
        let rows = self
            .store
            .deployments_for_account(user_host_account_id, self.history_limit)
            .await?;
        Ok(rows.iter().map(|row| row.to_public()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ApplyPriority, ChannelNotifier, MemoryStore, NotificationEvent};
    use super::*;

    struct Rig {
        store: Arc<MemoryStore>,
        engine: ReconcileEngine,
        events: tokio::sync::mpsc::UnboundedReceiver<NotificationEvent>,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let (notifier, events) = ChannelNotifier::new();
        let engine = ReconcileEngine::new(store.clone(), Arc::new(notifier), 100);
        Rig {
            store,
            engine,
            events,
        }
    }

    #[tokio::test]
    async fn enqueue_apply_rejects_unknown_and_disabled_mappings() {
        let rig = rig();
        assert!(rig
            .engine
            .enqueue_apply(Uuid::new_v4(), ApplyPriority::User)
            .await
            .unwrap()
            .is_none());

        let user = rig.store.seed_user("alice");
        let host = rig.store.seed_host("node-1", "10.0.0.1", "linux");
        let mapping = rig.store.seed_mapping(user, host, "alice");
        rig.store.set_mapping_status(mapping, "disabled");
        assert!(rig
            .engine
            .enqueue_apply(mapping, ApplyPriority::User)
            .await
            .unwrap()
            .is_none());

        rig.store.set_mapping_status(mapping, "active");
        assert!(rig
            .engine
            .enqueue_apply(mapping, ApplyPriority::User)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn emergency_revoke_marks_keys_and_enqueues_at_top_priority() {
        let mut rig = rig();
        let alice = rig.store.seed_user("alice");
        let bob = rig.store.seed_user("bob");
        let host = rig.store.seed_host("node-1", "10.0.0.1", "linux");
        let alice_mapping = rig.store.seed_mapping(alice, host, "alice");
        let bob_mapping = rig.store.seed_mapping(bob, host, "bob");

        // Same compromised key registered by two users.
        let material = "ssh-ed25519 QUJDREVGRw== shared@laptop";
        let fingerprint = super::super::key_fingerprint_sha256(material).expect("fingerprint");
        let k1 = rig
            .store
            .seed_key(alice, material, &fingerprint, None, None);
        let k2 = rig.store.seed_key(bob, material, &fingerprint, None, None);

        let summary = rig
            .engine
            .emergency_revoke(&fingerprint.to_uppercase())
            .await
            .unwrap();
        assert_eq!(summary.fingerprint, fingerprint);
        assert_eq!(summary.revoked_count, 2);
        assert_eq!(summary.affected_users.len(), 2);

        assert_eq!(rig.store.key_status(k1).as_deref(), Some("revoked"));
        assert_eq!(rig.store.key_status(k2).as_deref(), Some("revoked"));

        for mapping in [alice_mapping, bob_mapping] {
            let item = rig
                .store
                .queued_item_for_account(mapping)
                .expect("emergency item queued");
            assert_eq!(item.priority_enum(), ApplyPriority::Emergency);
        }

        match rig.events.try_recv().unwrap() {
            NotificationEvent::EmergencyRevoke(emitted) => {
                assert_eq!(emitted.revoked_count, 2);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn revoking_an_unknown_fingerprint_is_a_clean_no_op() {
        let mut rig = rig();
        let summary = rig.engine.emergency_revoke("missing").await.unwrap();
        assert_eq!(summary.revoked_count, 0);
        assert!(summary.affected_users.is_empty());
        // Summary is still emitted so the caller sees the outcome.
        assert!(rig.events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn bulk_apply_enqueues_every_active_mapping() {
        let rig = rig();
        let user = rig.store.seed_user("alice");
        let host_a = rig.store.seed_host("node-1", "10.0.0.1", "linux");
        let host_b = rig.store.seed_host("node-2", "10.0.0.2", "linux");
        rig.store.seed_mapping(user, host_a, "alice");
        rig.store.seed_mapping(user, host_b, "alice");
        let disabled = rig.store.seed_mapping(user, host_b, "ops");
        rig.store.set_mapping_status(disabled, "disabled");

        let queued = rig
            .engine
            .enqueue_apply_all(None, ApplyPriority::Routine)
            .await
            .unwrap();
        assert_eq!(queued, 2);

        let scoped = rig
            .engine
            .enqueue_apply_all(Some(host_a), ApplyPriority::Routine)
            .await
            .unwrap();
        assert_eq!(scoped, 1);
    }

    #[tokio::test]
    async fn queue_depth_is_zero_filled_across_statuses() {
        let rig = rig();
        let depth = rig.engine.queue_depth().await.unwrap();
        assert_eq!(depth.len(), 5);
        assert!(depth.values().all(|count| *count == 0));

        let user = rig.store.seed_user("alice");
        let host = rig.store.seed_host("node-1", "10.0.0.1", "linux");
        let mapping = rig.store.seed_mapping(user, host, "alice");
        rig.engine
            .enqueue_apply(mapping, ApplyPriority::User)
            .await
            .unwrap();

        let depth = rig.engine.queue_depth().await.unwrap();
        assert_eq!(depth.get("queued"), Some(&1));
        assert_eq!(depth.get("running"), Some(&0));
    }
}
