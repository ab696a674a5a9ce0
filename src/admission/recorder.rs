//! Outcome Recorder
//!
//! The single feedback point: every approved operation, whatever its outcome,
//! is folded back into the identity tracker and then the proxy pool.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::identity::{IdentityHealthTracker, IdentityStatus, IdentityStore, InMemoryIdentityStore};
use crate::logging::AuditLogger;
use crate::proxy::{HealthStatus, ProxyOutcome, ProxyPoolManager};
use crate::types::{GatehouseError, Operation, OperationResult, Result};

/// Post-record state of both sides of the feedback loop
#[derive(Debug, Clone)]
pub struct RecordedOutcome {
    pub identity: IdentityStatus,
    pub proxy_health: HealthStatus,
}

pub struct OutcomeRecorder {
    tracker: Arc<IdentityHealthTracker>,
    proxies: Arc<ProxyPoolManager>,
    identities: Arc<dyn IdentityStore>,
    audit: AuditLogger,
}

impl OutcomeRecorder {
    pub fn new(
        tracker: Arc<IdentityHealthTracker>,
        proxies: Arc<ProxyPoolManager>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            tracker,
            proxies,
            identities: Arc::new(InMemoryIdentityStore::new()),
            audit,
        }
    }

    /// Durable home for identity records written on every outcome
    pub fn with_identity_store(mut self, identities: Arc<dyn IdentityStore>) -> Self {
        self.identities = identities;
        self
    }

    /// Apply `result` to the identity, then release the proxy with it
    ///
    /// Both updates are attempted exactly once. The proxy is released even
    /// when the identity update fails so the lease never leaks.
    pub async fn record(
        &self,
        identity_id: &str,
        proxy_endpoint_id: &str,
        operation: &Operation,
        result: &OperationResult,
    ) -> Result<RecordedOutcome> {
        self.record_attempt(identity_id, proxy_endpoint_id, None, operation, result)
            .await?
            .ok_or_else(|| GatehouseError::Internal("unkeyed outcome treated as a replay".into()))
    }

    /// Record a job attempt, skipping a replay of the identity's last one
    ///
    /// Returns `None` when `attempt_key` was already applied; neither side is
    /// touched then. Otherwise the identity record is saved before returning,
    /// and a save failure is returned after both in-memory updates landed.
    pub async fn record_attempt(
        &self,
        identity_id: &str,
        proxy_endpoint_id: &str,
        attempt_key: Option<&str>,
        operation: &Operation,
        result: &OperationResult,
    ) -> Result<Option<RecordedOutcome>> {
        let identity = match self.tracker.apply_attempt(identity_id, attempt_key, result) {
            Ok(None) => {
                debug!(
                    identity_id = %identity_id,
                    attempt = ?attempt_key,
                    "Outcome already recorded"
                );
                return Ok(None);
            }
            Ok(Some(status)) => Ok(status),
            Err(e) => Err(e),
        };
        let proxy = self.proxies.release(proxy_endpoint_id, ProxyOutcome::from(result));

        self.audit
            .log_outcome(identity_id, proxy_endpoint_id, operation, result)
            .await;

        let identity = identity?;
        self.persist_identity(identity_id).await?;

        let proxy_health = match proxy {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    identity_id = %identity_id,
                    endpoint_id = %proxy_endpoint_id,
                    error = %e,
                    "Released unknown proxy endpoint"
                );
                return Err(e);
            }
        };

        debug!(
            identity_id = %identity_id,
            endpoint_id = %proxy_endpoint_id,
            success = result.success,
            state = identity.state.as_str(),
            daily_action_count = identity.daily_action_count,
            "Recorded operation outcome"
        );

        Ok(Some(RecordedOutcome {
            identity,
            proxy_health,
        }))
    }

    /// Write the identity's current record to the identity store
    pub async fn persist_identity(&self, identity_id: &str) -> Result<()> {
        let record = self.tracker.export_one(identity_id)?;
        self.identities.save(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::identity::{IdentityTuning, NewIdentity};
    use crate::proxy::{ProxyCriteria, ProxyDescriptor, ProxyProtocol, ProxyTuning};
    use crate::types::{ErrorType, GatehouseError, OperationType, SpeedTier};

    fn setup() -> (Arc<IdentityHealthTracker>, Arc<ProxyPoolManager>, OutcomeRecorder, String) {
        let clock = Arc::new(SystemClock);
        let tracker = Arc::new(IdentityHealthTracker::new(IdentityTuning::default(), clock.clone()));
        let proxies = Arc::new(ProxyPoolManager::new(ProxyTuning::default(), clock));
        tracker.register(NewIdentity::new("acct")).unwrap();
        let proxy = proxies
            .register(ProxyDescriptor {
                host: "10.0.0.9".into(),
                port: 3128,
                protocol: ProxyProtocol::Http,
                username: None,
                password: None,
                owner_identity: None,
            })
            .unwrap();
        let recorder = OutcomeRecorder::new(tracker.clone(), proxies.clone(), AuditLogger::new());
        (tracker, proxies, recorder, proxy)
    }

    fn op() -> Operation {
        Operation::new(OperationType::Join, SpeedTier::Fast)
    }

    #[tokio::test]
    async fn test_record_updates_both_sides() {
        let (tracker, proxies, recorder, proxy) = setup();
        proxies.acquire(&ProxyCriteria::for_identity("acct")).unwrap();

        let outcome = recorder
            .record("acct", &proxy, &op(), &OperationResult::failed(ErrorType::Permanent, 40))
            .await
            .unwrap();

        assert_eq!(outcome.identity.consecutive_failures, 1);
        assert_eq!(tracker.get_status("acct").unwrap().total_operations, 1);
        let view = proxies.get(&proxy).unwrap();
        assert_eq!(view.consecutive_failures, 1);
        assert_eq!(view.in_flight, 0);
    }

    #[tokio::test]
    async fn test_keyed_attempt_recorded_once_and_persisted() {
        let (tracker, proxies, recorder, proxy) = setup();
        let store = Arc::new(InMemoryIdentityStore::new());
        let recorder = recorder.with_identity_store(store.clone());
        proxies.acquire(&ProxyCriteria::for_identity("acct")).unwrap();

        let result = OperationResult::succeeded(30, 30);
        let first = recorder
            .record_attempt("acct", &proxy, Some("job-1:0:1"), &op(), &result)
            .await
            .unwrap();
        assert!(first.is_some());
        let replay = recorder
            .record_attempt("acct", &proxy, Some("job-1:0:1"), &op(), &result)
            .await
            .unwrap();
        assert!(replay.is_none());

        assert_eq!(tracker.get_status("acct").unwrap().total_operations, 1);
        assert_eq!(proxies.export()[0].total_successes, 1);
        let saved = store.list().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].daily_action_count, 1);
        assert_eq!(saved[0].last_attempt_key.as_deref(), Some("job-1:0:1"));
    }

    #[tokio::test]
    async fn test_unknown_identity_still_releases_proxy() {
        let (_tracker, proxies, recorder, proxy) = setup();
        proxies.acquire(&ProxyCriteria::default()).unwrap();

        let err = recorder
            .record("ghost", &proxy, &op(), &OperationResult::succeeded(5, 5))
            .await
            .unwrap_err();

        assert!(matches!(err, GatehouseError::NotFound(_)));
        assert_eq!(proxies.get(&proxy).unwrap().in_flight, 0);
    }
}
