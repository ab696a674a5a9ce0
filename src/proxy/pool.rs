//! Proxy Pool Manager
//!
//! Tracks health of network egress endpoints and hands them out to
//! admission checks.
//!
//! ## Selection
//!
//! Candidates are endpoints owned by the requesting identity, or the shared
//! pool when the identity owns none that are usable. Unhealthy endpoints are
//! never handed out. Degraded ones are skipped unless `allow_degraded` is
//! set, so by default an all-degraded pool is exhausted.
//!
//! - **round_robin**: rotate over candidates in id order
//! - **least_failures**: fewest consecutive failures
//! - **performance_weighted**: healthy before degraded, then lowest response
//!   time moving average
//!
//! Ties are broken by least-recently-used.
//!
//! ## Health transitions
//!
//! ```text
//! healthy ──(failures >= degraded)──▶ degraded ──(failures >= unhealthy)──▶ unhealthy
//!    ▲                                                                         │
//!    └───────────────────────── success streak ────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::types::{GatehouseError, OperationResult, Result};

// ============================================================================
// Tuning
// ============================================================================

/// Strategy used by [`ProxyPoolManager::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum SelectionStrategy {
    RoundRobin,
    LeastFailures,
    #[default]
    PerformanceWeighted,
}

/// Tunables for proxy health and selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyTuning {
    pub strategy: SelectionStrategy,
    /// Smoothing factor for the response time moving average (0.0 - 1.0)
    pub ema_alpha: f64,
    /// Consecutive failures before a healthy endpoint is degraded
    pub degraded_failure_threshold: u32,
    /// Consecutive failures before an endpoint is unhealthy
    pub unhealthy_failure_threshold: u32,
    /// Consecutive successes that restore any endpoint to healthy
    pub recovery_success_streak: u32,
    /// Fall back to degraded endpoints; off by default
    pub allow_degraded: bool,
}

impl Default for ProxyTuning {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            ema_alpha: 0.3,
            degraded_failure_threshold: 3,
            unhealthy_failure_threshold: 6,
            recovery_success_streak: 3,
            allow_degraded: false,
        }
    }
}

impl ProxyTuning {
    pub fn validate(&self) -> Result<()> {
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(GatehouseError::Config("ema_alpha must be within (0.0, 1.0]".into()));
        }
        if self.degraded_failure_threshold == 0
            || self.degraded_failure_threshold > self.unhealthy_failure_threshold
        {
            return Err(GatehouseError::Config(
                "degraded_failure_threshold must be positive and not exceed unhealthy_failure_threshold"
                    .into(),
            ));
        }
        if self.recovery_success_streak == 0 {
            return Err(GatehouseError::Config(
                "recovery_success_streak must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks5" | "socks5h" | "socks" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

/// Health classification of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Health as a factor in 0.0 - 1.0, used by risk and delay computation
    pub fn health_factor(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Connection details of an endpoint, as supplied by the import collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Identity this endpoint is dedicated to; shared when absent
    #[serde(default)]
    pub owner_identity: Option<String>,
}

impl ProxyDescriptor {
    pub fn endpoint_id(&self) -> String {
        format!("{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

/// Persistent record of an egress endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub id: String,
    pub descriptor: ProxyDescriptor,
    pub health_status: HealthStatus,
    pub consecutive_failures: u32,
    pub success_streak: u32,
    /// Exponential moving average; `None` until the first sample
    pub avg_response_time_ms: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub in_flight: u32,
    #[serde(default)]
    pub total_successes: u64,
    #[serde(default)]
    pub total_failures: u64,
}

impl ProxyEndpoint {
    fn new(descriptor: ProxyDescriptor) -> Self {
        Self {
            id: descriptor.endpoint_id(),
            descriptor,
            health_status: HealthStatus::Healthy,
            consecutive_failures: 0,
            success_streak: 0,
            avg_response_time_ms: None,
            last_checked_at: None,
            last_used_at: None,
            in_flight: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

/// Public view of an endpoint without credentials
#[derive(Debug, Clone, Serialize)]
pub struct ProxyView {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub owner_identity: Option<String>,
    pub health_status: HealthStatus,
    pub consecutive_failures: u32,
    pub avg_response_time_ms: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub in_flight: u32,
}

impl From<&ProxyEndpoint> for ProxyView {
    fn from(endpoint: &ProxyEndpoint) -> Self {
        Self {
            id: endpoint.id.clone(),
            host: endpoint.descriptor.host.clone(),
            port: endpoint.descriptor.port,
            protocol: endpoint.descriptor.protocol,
            owner_identity: endpoint.descriptor.owner_identity.clone(),
            health_status: endpoint.health_status,
            consecutive_failures: endpoint.consecutive_failures,
            avg_response_time_ms: endpoint.avg_response_time_ms,
            last_checked_at: endpoint.last_checked_at,
            last_used_at: endpoint.last_used_at,
            in_flight: endpoint.in_flight,
        }
    }
}

/// Criteria for [`ProxyPoolManager::acquire`]
#[derive(Debug, Clone, Default)]
pub struct ProxyCriteria {
    /// Identity the endpoint will act for
    pub identity_id: Option<String>,
    /// Overrides the configured strategy
    pub strategy: Option<SelectionStrategy>,
}

impl ProxyCriteria {
    pub fn for_identity(identity_id: &str) -> Self {
        Self {
            identity_id: Some(identity_id.to_string()),
            strategy: None,
        }
    }
}

/// Reservation handed out by `acquire`
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyLease {
    pub endpoint_id: String,
    pub health_status: HealthStatus,
    pub avg_response_time_ms: Option<f64>,
}

impl ProxyLease {
    pub fn health(&self) -> f64 {
        self.health_status.health_factor()
    }
}

/// Outcome fed back on release or probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProxyOutcome {
    pub success: bool,
    pub response_time_ms: u64,
}

impl From<&OperationResult> for ProxyOutcome {
    fn from(result: &OperationResult) -> Self {
        Self {
            success: result.success,
            response_time_ms: result.response_time_ms,
        }
    }
}

/// Pool-wide health rollup
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyHealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    /// Percentage of endpoints that are healthy (0 - 100)
    pub healthy_pct: f64,
    pub avg_response_time_ms: Option<f64>,
    pub acquisitions: u64,
    pub exhaustions: u64,
}

// ============================================================================
// Pool manager
// ============================================================================

struct PoolStats {
    acquisitions: AtomicU64,
    exhaustions: AtomicU64,
    releases: AtomicU64,
    probes: AtomicU64,
}

/// Owner of proxy health state
pub struct ProxyPoolManager {
    endpoints: DashMap<String, ProxyEndpoint>,
    tuning: ProxyTuning,
    clock: Arc<dyn Clock>,
    rr_cursor: AtomicUsize,
    /// Serializes select-and-mark so LRU tie-breaking sees prior reservations
    selection: Mutex<()>,
    stats: PoolStats,
}

impl ProxyPoolManager {
    pub fn new(tuning: ProxyTuning, clock: Arc<dyn Clock>) -> Self {
        Self {
            endpoints: DashMap::new(),
            tuning,
            clock,
            rr_cursor: AtomicUsize::new(0),
            selection: Mutex::new(()),
            stats: PoolStats {
                acquisitions: AtomicU64::new(0),
                exhaustions: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                probes: AtomicU64::new(0),
            },
        }
    }

    pub fn tuning(&self) -> &ProxyTuning {
        &self.tuning
    }

    /// Register a new endpoint; returns its id
    pub fn register(&self, descriptor: ProxyDescriptor) -> Result<String> {
        if descriptor.host.trim().is_empty() || descriptor.port == 0 {
            return Err(GatehouseError::BadRequest(format!(
                "invalid proxy endpoint {}:{}",
                descriptor.host, descriptor.port
            )));
        }

        let endpoint = ProxyEndpoint::new(descriptor);
        let id = endpoint.id.clone();

        match self.endpoints.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(GatehouseError::BadRequest(
                format!("proxy endpoint {} already registered", id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(
                    endpoint_id = %id,
                    owner = ?endpoint.descriptor.owner_identity,
                    "Registered proxy endpoint"
                );
                slot.insert(endpoint);
                Ok(id)
            }
        }
    }

    /// Remove an endpoint from the pool
    pub fn unregister(&self, endpoint_id: &str) -> bool {
        self.endpoints.remove(endpoint_id).is_some()
    }

    /// Select and reserve an endpoint
    ///
    /// Fails with `PoolExhausted` when no usable endpoint exists; callers treat
    /// that as a retry-later signal.
    pub fn acquire(&self, criteria: &ProxyCriteria) -> Result<ProxyLease> {
        let _guard = self.selection.lock().unwrap_or_else(|e| e.into_inner());
        let strategy = criteria.strategy.unwrap_or(self.tuning.strategy);

        let usable = |endpoint: &ProxyEndpoint| match endpoint.health_status {
            HealthStatus::Healthy => true,
            HealthStatus::Degraded => self.tuning.allow_degraded,
            HealthStatus::Unhealthy => false,
        };

        let mut owned: Vec<ProxyEndpoint> = Vec::new();
        let mut shared: Vec<ProxyEndpoint> = Vec::new();
        for entry in self.endpoints.iter() {
            let endpoint = entry.value();
            if !usable(endpoint) {
                continue;
            }
            match (&endpoint.descriptor.owner_identity, &criteria.identity_id) {
                (None, _) => shared.push(endpoint.clone()),
                (Some(owner), Some(identity)) if owner == identity => owned.push(endpoint.clone()),
                _ => {}
            }
        }
        let mut candidates = if owned.is_empty() { shared } else { owned };

        if candidates.is_empty() {
            self.stats.exhaustions.fetch_add(1, Ordering::Relaxed);
            debug!(identity_id = ?criteria.identity_id, "No usable proxy endpoint");
            return Err(GatehouseError::PoolExhausted(format!(
                "no usable proxy for {}",
                criteria.identity_id.as_deref().unwrap_or("shared pool")
            )));
        }

        let chosen_id = match strategy {
            SelectionStrategy::RoundRobin => {
                candidates.sort_by(|a, b| a.id.cmp(&b.id));
                let index = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[index].id.clone()
            }
            SelectionStrategy::LeastFailures => candidates
                .iter()
                .min_by(|a, b| {
                    a.consecutive_failures
                        .cmp(&b.consecutive_failures)
                        .then_with(|| a.last_used_at.cmp(&b.last_used_at))
                })
                .map(|e| e.id.clone())
                .unwrap_or_default(),
            SelectionStrategy::PerformanceWeighted => candidates
                .iter()
                .min_by(|a, b| {
                    a.health_status
                        .rank()
                        .cmp(&b.health_status.rank())
                        .then_with(|| compare_latency(a, b))
                        .then_with(|| a.last_used_at.cmp(&b.last_used_at))
                })
                .map(|e| e.id.clone())
                .unwrap_or_default(),
        };

        let mut entry = self
            .endpoints
            .get_mut(&chosen_id)
            .ok_or_else(|| GatehouseError::proxy_not_found(&chosen_id))?;
        let endpoint = entry.value_mut();
        endpoint.last_used_at = Some(self.clock.now());
        endpoint.in_flight += 1;
        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);

        debug!(
            endpoint_id = %endpoint.id,
            strategy = ?strategy,
            health = endpoint.health_status.as_str(),
            "Acquired proxy endpoint"
        );

        Ok(ProxyLease {
            endpoint_id: endpoint.id.clone(),
            health_status: endpoint.health_status,
            avg_response_time_ms: endpoint.avg_response_time_ms,
        })
    }

    /// Return a reservation that was never used; health is untouched
    pub fn cancel_lease(&self, endpoint_id: &str) -> Result<()> {
        let mut entry = self
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| GatehouseError::proxy_not_found(endpoint_id))?;
        let endpoint = entry.value_mut();
        endpoint.in_flight = endpoint.in_flight.saturating_sub(1);
        Ok(())
    }

    /// Release a reservation and fold the operation outcome into health
    pub fn release(&self, endpoint_id: &str, outcome: ProxyOutcome) -> Result<HealthStatus> {
        let mut entry = self
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| GatehouseError::proxy_not_found(endpoint_id))?;
        let endpoint = entry.value_mut();
        endpoint.in_flight = endpoint.in_flight.saturating_sub(1);
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        Ok(self.apply_outcome(endpoint, outcome))
    }

    /// Fold a background probe outcome into health
    ///
    /// Probe failures count exactly like operational failures.
    pub fn record_probe(&self, endpoint_id: &str, outcome: ProxyOutcome) -> Result<HealthStatus> {
        let mut entry = self
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| GatehouseError::proxy_not_found(endpoint_id))?;
        self.stats.probes.fetch_add(1, Ordering::Relaxed);
        Ok(self.apply_outcome(entry.value_mut(), outcome))
    }

    fn apply_outcome(&self, endpoint: &mut ProxyEndpoint, outcome: ProxyOutcome) -> HealthStatus {
        let tuning = &self.tuning;
        let previous = endpoint.health_status;
        endpoint.last_checked_at = Some(self.clock.now());

        if outcome.success {
            // Failures carry no usable latency; only successes feed the average
            let sample = outcome.response_time_ms as f64;
            endpoint.avg_response_time_ms = Some(match endpoint.avg_response_time_ms {
                Some(avg) => tuning.ema_alpha * sample + (1.0 - tuning.ema_alpha) * avg,
                None => sample,
            });
            endpoint.total_successes += 1;
            endpoint.consecutive_failures = 0;
            endpoint.success_streak += 1;
            if endpoint.success_streak >= tuning.recovery_success_streak {
                endpoint.health_status = HealthStatus::Healthy;
            }
        } else {
            endpoint.total_failures += 1;
            endpoint.success_streak = 0;
            endpoint.consecutive_failures += 1;
            if endpoint.consecutive_failures >= tuning.unhealthy_failure_threshold {
                endpoint.health_status = HealthStatus::Unhealthy;
            } else if endpoint.consecutive_failures >= tuning.degraded_failure_threshold
                && endpoint.health_status == HealthStatus::Healthy
            {
                endpoint.health_status = HealthStatus::Degraded;
            }
        }

        if endpoint.health_status != previous {
            warn!(
                endpoint_id = %endpoint.id,
                from = previous.as_str(),
                to = endpoint.health_status.as_str(),
                consecutive_failures = endpoint.consecutive_failures,
                "Proxy health changed"
            );
        }

        endpoint.health_status
    }

    pub fn get(&self, endpoint_id: &str) -> Result<ProxyView> {
        self.endpoints
            .get(endpoint_id)
            .map(|e| ProxyView::from(e.value()))
            .ok_or_else(|| GatehouseError::proxy_not_found(endpoint_id))
    }

    /// All endpoints, sorted by id
    pub fn list(&self) -> Vec<ProxyView> {
        let mut views: Vec<ProxyView> = self
            .endpoints
            .iter()
            .map(|e| ProxyView::from(e.value()))
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Connection details of one endpoint, credentials included
    pub fn descriptor(&self, endpoint_id: &str) -> Result<ProxyDescriptor> {
        self.endpoints
            .get(endpoint_id)
            .map(|e| e.value().descriptor.clone())
            .ok_or_else(|| GatehouseError::proxy_not_found(endpoint_id))
    }

    /// Connection details of every endpoint, for probing
    pub fn descriptors(&self) -> Vec<(String, ProxyDescriptor)> {
        self.endpoints
            .iter()
            .map(|e| (e.key().clone(), e.value().descriptor.clone()))
            .collect()
    }

    pub fn health_summary(&self) -> ProxyHealthSummary {
        let mut summary = ProxyHealthSummary {
            acquisitions: self.stats.acquisitions.load(Ordering::Relaxed),
            exhaustions: self.stats.exhaustions.load(Ordering::Relaxed),
            ..Default::default()
        };
        let mut latency_sum = 0.0;
        let mut latency_samples = 0usize;

        for entry in self.endpoints.iter() {
            let endpoint = entry.value();
            summary.total += 1;
            match endpoint.health_status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
            }
            if let Some(avg) = endpoint.avg_response_time_ms {
                latency_sum += avg;
                latency_samples += 1;
            }
        }

        if summary.total > 0 {
            summary.healthy_pct = summary.healthy as f64 * 100.0 / summary.total as f64;
        }
        if latency_samples > 0 {
            summary.avg_response_time_ms = Some(latency_sum / latency_samples as f64);
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Raw records for persistence
    pub fn export(&self) -> Vec<ProxyEndpoint> {
        let mut records: Vec<ProxyEndpoint> =
            self.endpoints.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Load persisted records; reservations do not survive a restart
    pub fn import(&self, records: Vec<ProxyEndpoint>) -> usize {
        let count = records.len();
        for mut record in records {
            record.in_flight = 0;
            self.endpoints.insert(record.id.clone(), record);
        }
        info!("Loaded {} proxy endpoints", count);
        count
    }
}

/// Unmeasured endpoints sort first so they get measured
fn compare_latency(a: &ProxyEndpoint, b: &ProxyEndpoint) -> CmpOrdering {
    let a = a.avg_response_time_ms.unwrap_or(0.0);
    let b = b.avg_response_time_ms.unwrap_or(0.0);
    a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn descriptor(host: &str) -> ProxyDescriptor {
        ProxyDescriptor {
            host: host.to_string(),
            port: 8080,
            protocol: ProxyProtocol::Http,
            username: None,
            password: None,
            owner_identity: None,
        }
    }

    fn pool_with(tuning: ProxyTuning, hosts: &[&str]) -> (ProxyPoolManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        ));
        let pool = ProxyPoolManager::new(tuning, clock.clone());
        for host in hosts {
            pool.register(descriptor(host)).unwrap();
        }
        (pool, clock)
    }

    fn fail() -> ProxyOutcome {
        ProxyOutcome {
            success: false,
            response_time_ms: 1000,
        }
    }

    fn ok(ms: u64) -> ProxyOutcome {
        ProxyOutcome {
            success: true,
            response_time_ms: ms,
        }
    }

    #[test]
    fn test_empty_pool_is_exhausted() {
        let (pool, _) = pool_with(ProxyTuning::default(), &[]);
        assert!(matches!(
            pool.acquire(&ProxyCriteria::default()),
            Err(GatehouseError::PoolExhausted(_))
        ));
        assert_eq!(pool.health_summary().exhaustions, 1);
    }

    #[test]
    fn test_health_transitions() {
        let (pool, _) = pool_with(ProxyTuning::default(), &["a"]);
        let id = "http://a:8080";

        for _ in 0..2 {
            assert_eq!(pool.release(id, fail()).unwrap(), HealthStatus::Healthy);
        }
        assert_eq!(pool.release(id, fail()).unwrap(), HealthStatus::Degraded);
        for _ in 0..2 {
            assert_eq!(pool.release(id, fail()).unwrap(), HealthStatus::Degraded);
        }
        assert_eq!(pool.release(id, fail()).unwrap(), HealthStatus::Unhealthy);

        assert!(matches!(
            pool.acquire(&ProxyCriteria::default()),
            Err(GatehouseError::PoolExhausted(_))
        ));

        // Probes recover the endpoint after a success streak
        pool.record_probe(id, ok(100)).unwrap();
        pool.record_probe(id, ok(100)).unwrap();
        assert_eq!(pool.record_probe(id, ok(100)).unwrap(), HealthStatus::Healthy);
        assert!(pool.acquire(&ProxyCriteria::default()).is_ok());
    }

    #[test]
    fn test_ema_smoothing() {
        let (pool, _) = pool_with(ProxyTuning::default(), &["a"]);
        let id = "http://a:8080";
        pool.release(id, ok(100)).unwrap();
        pool.release(id, ok(200)).unwrap();
        let avg = pool.get(id).unwrap().avg_response_time_ms.unwrap();
        assert!((avg - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_performance_weighted_prefers_fastest_healthy() {
        let (pool, _) = pool_with(ProxyTuning::default(), &["slow", "fast", "flaky"]);
        pool.release("http://slow:8080", ok(900)).unwrap();
        pool.release("http://fast:8080", ok(50)).unwrap();
        pool.release("http://flaky:8080", ok(10)).unwrap();
        for _ in 0..3 {
            pool.release("http://flaky:8080", ok(10)).unwrap();
        }
        for _ in 0..3 {
            pool.release("http://flaky:8080", fail()).unwrap();
        }
        assert_eq!(
            pool.get("http://flaky:8080").unwrap().health_status,
            HealthStatus::Degraded
        );

        let lease = pool.acquire(&ProxyCriteria::default()).unwrap();
        assert_eq!(lease.endpoint_id, "http://fast:8080");
        assert_eq!(lease.health(), 1.0);
    }

    #[test]
    fn test_ties_broken_by_least_recently_used() {
        let tuning = ProxyTuning {
            strategy: SelectionStrategy::LeastFailures,
            ..Default::default()
        };
        let (pool, clock) = pool_with(tuning, &["a", "b"]);

        let first = pool.acquire(&ProxyCriteria::default()).unwrap();
        clock.advance(Duration::seconds(1));
        let second = pool.acquire(&ProxyCriteria::default()).unwrap();
        clock.advance(Duration::seconds(1));
        let third = pool.acquire(&ProxyCriteria::default()).unwrap();

        assert_ne!(first.endpoint_id, second.endpoint_id);
        assert_eq!(first.endpoint_id, third.endpoint_id);
    }

    #[test]
    fn test_round_robin_rotates() {
        let tuning = ProxyTuning {
            strategy: SelectionStrategy::RoundRobin,
            ..Default::default()
        };
        let (pool, _) = pool_with(tuning, &["a", "b", "c"]);
        let picks: Vec<String> = (0..4)
            .map(|_| pool.acquire(&ProxyCriteria::default()).unwrap().endpoint_id)
            .collect();
        assert_eq!(picks[0], "http://a:8080");
        assert_eq!(picks[1], "http://b:8080");
        assert_eq!(picks[2], "http://c:8080");
        assert_eq!(picks[3], "http://a:8080");
    }

    #[test]
    fn test_owned_endpoints_preferred_and_isolated() {
        let (pool, _) = pool_with(ProxyTuning::default(), &["shared"]);
        pool.register(ProxyDescriptor {
            owner_identity: Some("acct-1".into()),
            ..descriptor("private")
        })
        .unwrap();

        let lease = pool.acquire(&ProxyCriteria::for_identity("acct-1")).unwrap();
        assert_eq!(lease.endpoint_id, "http://private:8080");

        for _ in 0..5 {
            let lease = pool.acquire(&ProxyCriteria::for_identity("acct-2")).unwrap();
            assert_eq!(lease.endpoint_id, "http://shared:8080");
        }
    }

    #[test]
    fn test_degraded_only_pool_is_exhausted_by_default() {
        let (pool, _) = pool_with(ProxyTuning::default(), &["a"]);
        for _ in 0..3 {
            pool.release("http://a:8080", fail()).unwrap();
        }
        assert_eq!(pool.health_summary().degraded, 1);
        assert!(matches!(
            pool.acquire(&ProxyCriteria::default()),
            Err(GatehouseError::PoolExhausted(_))
        ));
    }

    #[test]
    fn test_degraded_fallback_is_opt_in() {
        let tuning = ProxyTuning {
            allow_degraded: true,
            ..Default::default()
        };
        let (pool, _) = pool_with(tuning, &["a"]);
        for _ in 0..3 {
            pool.release("http://a:8080", fail()).unwrap();
        }
        let lease = pool.acquire(&ProxyCriteria::default()).unwrap();
        assert_eq!(lease.health_status, HealthStatus::Degraded);
    }

    #[test]
    fn test_failures_leave_response_average_alone() {
        let (pool, _) = pool_with(ProxyTuning::default(), &["a"]);
        let id = "http://a:8080";
        pool.release(id, ok(400)).unwrap();
        pool.release(id, ProxyOutcome { success: false, response_time_ms: 0 }).unwrap();
        pool.record_probe(id, ProxyOutcome { success: false, response_time_ms: 5 }).unwrap();
        let avg = pool.get(id).unwrap().avg_response_time_ms.unwrap();
        assert!((avg - 400.0).abs() < 1e-9);

        // a fast-failing endpoint never gets an average at all
        pool.register(descriptor("b")).unwrap();
        pool.release("http://b:8080", fail()).unwrap();
        assert!(pool.get("http://b:8080").unwrap().avg_response_time_ms.is_none());
    }

    #[test]
    fn test_lease_accounting() {
        let (pool, _) = pool_with(ProxyTuning::default(), &["a"]);
        let lease = pool.acquire(&ProxyCriteria::default()).unwrap();
        assert_eq!(pool.get(&lease.endpoint_id).unwrap().in_flight, 1);
        pool.cancel_lease(&lease.endpoint_id).unwrap();
        assert_eq!(pool.get(&lease.endpoint_id).unwrap().in_flight, 0);
        assert!(pool.release("http://missing:1", ok(1)).is_err());
    }

    #[test]
    fn test_tuning_validation() {
        let bad = ProxyTuning {
            degraded_failure_threshold: 10,
            unhealthy_failure_threshold: 5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(ProxyTuning::default().validate().is_ok());
    }
}
