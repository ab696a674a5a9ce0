//! Component wiring
//!
//! Builds the identity tracker, proxy pool, admission controller, outcome
//! recorder, orchestrator and statistics aggregator from one tuning config,
//! and owns identity/proxy snapshot persistence.
//!
//! Identities are restored from the whole-map snapshot and then from the
//! per-record identity store, which the recorder writes on every outcome.
//! A stored record wins when its last operation is newer than the
//! snapshot's.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::admission::{AdmissionController, DelayCalculator, OutcomeRecorder};
use crate::clock::Clock;
use crate::config::TuningConfig;
use crate::identity::{IdentityHealthTracker, IdentityStore, ManagedIdentity, NewIdentity};
use crate::jobs::{ExecutionCapability, JobOrchestrator, JobStore, WorkerPool};
use crate::logging::AuditLogger;
use crate::persist::{read_json, write_json_atomic};
use crate::proxy::{ProxyEndpoint, ProxyPoolManager};
use crate::stats::StatisticsAggregator;
use crate::types::{GatehouseError, Result};

const IDENTITY_SNAPSHOT: &str = "identities.json";
const PROXY_SNAPSHOT: &str = "proxies.json";

/// Fully wired engine
pub struct Engine {
    pub clock: Arc<dyn Clock>,
    pub tracker: Arc<IdentityHealthTracker>,
    pub proxies: Arc<ProxyPoolManager>,
    pub admission: Arc<AdmissionController>,
    pub recorder: Arc<OutcomeRecorder>,
    pub identities: Arc<dyn IdentityStore>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub stats: Arc<StatisticsAggregator>,
    pub audit: AuditLogger,
}

impl Engine {
    pub fn new(
        tuning: &TuningConfig,
        store: Arc<dyn JobStore>,
        identities: Arc<dyn IdentityStore>,
        executor: Arc<dyn ExecutionCapability>,
        clock: Arc<dyn Clock>,
        audit: AuditLogger,
    ) -> Self {
        let tracker = Arc::new(IdentityHealthTracker::new(
            tuning.identity.clone(),
            Arc::clone(&clock),
        ));
        let proxies = Arc::new(ProxyPoolManager::new(tuning.proxy.clone(), Arc::clone(&clock)));
        let stats = Arc::new(StatisticsAggregator::new(
            Arc::clone(&tracker),
            Arc::clone(&proxies),
            Arc::clone(&store),
        ));
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&tracker),
            Arc::clone(&proxies),
            DelayCalculator::new(tuning.delay.clone()),
            tuning.admission.clone(),
            stats.clone(),
            Arc::clone(&clock),
        ));
        let recorder = Arc::new(
            OutcomeRecorder::new(Arc::clone(&tracker), Arc::clone(&proxies), audit.clone())
                .with_identity_store(Arc::clone(&identities)),
        );
        let orchestrator = Arc::new(
            JobOrchestrator::new(
                tuning.jobs.clone(),
                store,
                Arc::clone(&admission),
                Arc::clone(&recorder),
                executor,
                Arc::clone(&proxies),
                Arc::clone(&clock),
            )
            .with_audit(audit.clone()),
        );

        Self {
            clock,
            tracker,
            proxies,
            admission,
            recorder,
            identities,
            orchestrator,
            stats,
            audit,
        }
    }

    /// Start job workers and expose their counters to statistics
    pub fn start_workers(&self, worker_count: usize) -> Result<WorkerPool> {
        let pool = self.orchestrator.spawn_workers(worker_count)?;
        self.stats.attach_workers(self.orchestrator.worker_counters());
        Ok(pool)
    }

    /// Restore identity and proxy state
    ///
    /// Reads the snapshots written by [`Engine::save_snapshots`], then
    /// overlays identity records saved since the last snapshot.
    pub async fn load_snapshots(&self, data_dir: &Path) -> Result<(usize, usize)> {
        let snapshot = read_json::<Vec<ManagedIdentity>>(&data_dir.join(IDENTITY_SNAPSHOT))
            .await?
            .unwrap_or_default();
        let mut records: HashMap<String, ManagedIdentity> =
            snapshot.into_iter().map(|r| (r.id.clone(), r)).collect();

        let mut newer = 0;
        for record in self.identities.list().await? {
            let replaces = records
                .get(&record.id)
                .map_or(true, |known| record.last_operation_at > known.last_operation_at);
            if replaces {
                newer += 1;
                records.insert(record.id.clone(), record);
            }
        }
        if newer > 0 {
            info!(records = newer, "Identity records newer than the snapshot");
        }

        let identities = if records.is_empty() {
            0
        } else {
            self.tracker.import(records.into_values().collect())
        };
        let proxies = match read_json::<Vec<ProxyEndpoint>>(&data_dir.join(PROXY_SNAPSHOT)).await? {
            Some(records) => self.proxies.import(records),
            None => 0,
        };
        Ok((identities, proxies))
    }

    pub async fn save_snapshots(&self, data_dir: &Path) -> Result<()> {
        write_json_atomic(&data_dir.join(IDENTITY_SNAPSHOT), &self.tracker.export()).await?;
        write_json_atomic(&data_dir.join(PROXY_SNAPSHOT), &self.proxies.export()).await?;
        Ok(())
    }

    /// Register identities from a JSON seed file; known ids are skipped
    pub async fn seed_identities(&self, path: &Path) -> Result<usize> {
        let seeds = read_json::<Vec<NewIdentity>>(path)
            .await?
            .ok_or_else(|| GatehouseError::Config(format!("identity file {} not found", path.display())))?;

        let mut registered = 0;
        for seed in seeds {
            if self.tracker.get_status(&seed.id).is_ok() {
                continue;
            }
            let id = seed.id.clone();
            match self.tracker.register(seed) {
                Ok(_) => registered += 1,
                Err(e) => warn!(identity_id = %id, error = %e, "Skipping identity seed"),
            }
        }
        Ok(registered)
    }
}

/// Periodically persist identity and proxy state
pub fn spawn_snapshot_task(
    engine: Arc<Engine>,
    data_dir: std::path::PathBuf,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(
        interval_secs = interval.as_secs(),
        dir = %data_dir.display(),
        "Snapshot task started"
    );

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = engine.save_snapshots(&data_dir).await {
                error!(error = %e, "Failed to write snapshots");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::identity::{FileIdentityStore, InMemoryIdentityStore};
    use crate::jobs::{ExecutionError, ExecutionRequest, ExecutionSuccess, InMemoryJobStore};
    use crate::proxy::import_proxies;
    use crate::types::{Operation, OperationResult, OperationType, SpeedTier};
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl ExecutionCapability for NoopExecutor {
        async fn execute(
            &self,
            _request: &ExecutionRequest,
        ) -> std::result::Result<ExecutionSuccess, ExecutionError> {
            Ok(ExecutionSuccess { response_time_ms: 1 })
        }
    }

    fn engine() -> Engine {
        engine_with(Arc::new(InMemoryIdentityStore::new()))
    }

    fn engine_with(identities: Arc<dyn IdentityStore>) -> Engine {
        Engine::new(
            &TuningConfig::default(),
            Arc::new(InMemoryJobStore::new()),
            identities,
            Arc::new(NoopExecutor),
            Arc::new(SystemClock),
            AuditLogger::new(),
        )
    }

    async fn record_success(engine: &Engine, key: &str) -> bool {
        let proxy = engine.proxies.list()[0].id.clone();
        engine
            .recorder
            .record_attempt(
                "acct",
                &proxy,
                Some(key),
                &Operation::new(OperationType::Message, SpeedTier::Fast),
                &OperationResult::succeeded(20, 20),
            )
            .await
            .unwrap()
            .is_some()
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let first = engine();
        first.tracker.register(NewIdentity::new("acct").with_daily_limit(7)).unwrap();
        first.tracker.restrict("acct", "review").unwrap();
        import_proxies(&first.proxies, "10.0.0.1:8080\n10.0.0.2:8080", None).unwrap();
        first.save_snapshots(dir.path()).await.unwrap();

        let second = engine();
        let (identities, proxies) = second.load_snapshots(dir.path()).await.unwrap();
        assert_eq!((identities, proxies), (1, 2));
        let status = second.tracker.get_status("acct").unwrap();
        assert_eq!(status.daily_limit, 7);
        assert_eq!(status.state, crate::identity::IdentityState::Restricted);
    }

    #[tokio::test]
    async fn test_missing_snapshots_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(engine().load_snapshots(dir.path()).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_seed_skips_known_identities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        std::fs::write(&path, r#"[{"id": "a"}, {"id": "b", "daily_limit": 10}, {"id": "a"}]"#).unwrap();

        let engine = engine();
        assert_eq!(engine.seed_identities(&path).await.unwrap(), 2);
        assert_eq!(engine.seed_identities(&path).await.unwrap(), 0);
        assert_eq!(engine.tracker.get_status("b").unwrap().daily_limit, 10);
    }

    #[tokio::test]
    async fn test_daily_counts_survive_restart_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let identity_dir = dir.path().join("identities");

        let first = engine_with(Arc::new(FileIdentityStore::open(&identity_dir).await.unwrap()));
        first.tracker.register(NewIdentity::new("acct").with_daily_limit(5)).unwrap();
        import_proxies(&first.proxies, "10.0.0.1:8080", None).unwrap();
        // snapshot taken before any activity
        first.save_snapshots(dir.path()).await.unwrap();
        for key in ["job-1:0:1", "job-1:1:1", "job-1:2:1"] {
            assert!(record_success(&first, key).await);
        }
        drop(first);

        let second = engine_with(Arc::new(FileIdentityStore::open(&identity_dir).await.unwrap()));
        assert_eq!(second.load_snapshots(dir.path()).await.unwrap(), (1, 1));
        let status = second.tracker.get_status("acct").unwrap();
        assert_eq!(status.daily_action_count, 3);
        assert_eq!(status.daily_remaining, 2);
        assert_eq!(status.total_operations, 3);

        // replaying the last attempt after the restart changes nothing
        assert!(!record_success(&second, "job-1:2:1").await);
        assert_eq!(second.tracker.get_status("acct").unwrap().daily_action_count, 3);
    }

    #[tokio::test]
    async fn test_snapshot_wins_when_not_older() {
        let dir = tempfile::tempdir().unwrap();
        let identities = Arc::new(InMemoryIdentityStore::new());

        let first = engine_with(identities.clone());
        first.tracker.register(NewIdentity::new("acct")).unwrap();
        import_proxies(&first.proxies, "10.0.0.1:8080", None).unwrap();
        assert!(record_success(&first, "job-1:0:1").await);
        first.tracker.restrict("acct", "review").unwrap();
        first.save_snapshots(dir.path()).await.unwrap();

        let second = engine_with(identities);
        second.load_snapshots(dir.path()).await.unwrap();
        let status = second.tracker.get_status("acct").unwrap();
        assert_eq!(status.state, crate::identity::IdentityState::Restricted);
        assert_eq!(status.total_operations, 1);
    }
}
