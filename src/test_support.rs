use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{default_authorized_keys_templates, EngineConfig};
use crate::db;
use crate::services::reconciler::{
    ApplyError, ApplyTarget, LogNotifier, MemoryStore, ReconcileEngine, RemoteApplier,
};
use crate::state::AppState;

pub fn test_config() -> EngineConfig {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let data_root = tempdir.keep();

    EngineConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        worker_count: 4,
        poll_interval_ms: 500,
        lease_seconds: 180,
        max_retries: 3,
        retry_backoff_base_seconds: 60,
        retry_backoff_cap_seconds: 3_600,
        queue_retention_days: 7,
        history_limit: 100,
        apply_ssh_user: "root".to_string(),
        apply_ssh_key_path: data_root.join("apply_key"),
        apply_ssh_port: 22,
        ssh_known_hosts_path: data_root.join("known_hosts"),
        strict_host_key_check: false,
        connect_timeout_seconds: 10,
        operation_timeout_seconds: 60,
        authorized_keys_templates: default_authorized_keys_templates(),
    }
}

pub fn test_state() -> AppState {
    test_state_with(Arc::new(MemoryStore::new()))
}

pub fn test_state_with(store: Arc<MemoryStore>) -> AppState {
    let config = test_config();
    // Lazy pool: never connected by the in-memory-backed routes.
    let pool = db::connect_lazy(&config.database_url).expect("connect_lazy");
    let engine = Arc::new(ReconcileEngine::new(
        store,
        Arc::new(LogNotifier),
        config.history_limit,
    ));
    AppState {
        config,
        db: pool,
        engine,
    }
}

#[derive(Default)]
struct FakeState {
    live: HashMap<String, Vec<u8>>,
    staged: HashMap<String, Vec<u8>>,
    publishes: u32,
    scripted: VecDeque<ApplyError>,
    crash_mid_write: bool,
}

/// Scripted transport double. Models the remote contract the real applier
/// honors: uploads land in a staging area and only a completed apply
/// renames them over the live path.
#[derive(Default)]
pub struct FakeApplier {
    inner: Mutex<FakeState>,
}

impl FakeApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock().expect("fake applier lock")
    }

    /// Queue a failure for the next apply call; repeat to script several.
    pub fn script_failure(&self, err: ApplyError) {
        self.lock().scripted.push_back(err);
    }

    /// Every subsequent apply dies after a partial upload.
    pub fn set_crash_mid_write(&self, on: bool) {
        self.lock().crash_mid_write = on;
    }

    pub fn live_content(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().live.get(path).cloned()
    }

    pub fn staged_content(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().staged.get(path).cloned()
    }

    pub fn publish_count(&self) -> u32 {
        self.lock().publishes
    }
}

impl RemoteApplier for FakeApplier {
    fn apply(&self, target: &ApplyTarget, content: &[u8]) -> Result<(), ApplyError> {
        let mut state = self.lock();
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        let temp_path = target.temp_path();
        if state.crash_mid_write {
            let written = content.len() / 2;
            state.staged.insert(temp_path, content[..written].to_vec());
            return Err(ApplyError::transport("connection reset during upload"));
        }
        state.staged.insert(temp_path.clone(), content.to_vec());
        let staged = state.staged.remove(&temp_path).expect("staged upload");
        state
            .live
            .insert(target.authorized_keys_path.clone(), staged);
        state.publishes += 1;
        Ok(())
    }
}
