//! Statistics Aggregator
//!
//! Read-only rollups over the identity tracker, the proxy pool and the job
//! store, computed on every call. Also the source of the system load scalar
//! used by delay computation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, OnceLock};

use crate::admission::LoadSource;
use crate::identity::{IdentityHealthTracker, IdentityState, IdentityStatus, StateCounts};
use crate::jobs::{JobStatus, JobStore, WorkerCounters};
use crate::proxy::{ProxyHealthSummary, ProxyPoolManager};
use crate::types::Result;

/// Identity rollup
#[derive(Debug, Clone, Serialize)]
pub struct IdentityRollup {
    pub total: usize,
    #[serde(flatten)]
    pub states: StateCounts,
    pub avg_health_score: Option<f64>,
    pub quota_exhausted: usize,
}

/// Job rollup
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobRollup {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub targets_succeeded: u64,
    pub targets_failed: u64,
    pub total_attempts: u64,
    /// Mean admission delay per executed attempt
    pub avg_delay_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkerRollup {
    pub total: usize,
    pub busy: usize,
}

/// System-wide snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub generated_at: DateTime<Utc>,
    pub identities: IdentityRollup,
    pub proxies: ProxyHealthSummary,
    pub jobs: JobRollup,
    pub workers: WorkerRollup,
    /// Fraction of usable identities in cooldown (0.0 - 1.0)
    pub system_load: f64,
}

pub struct StatisticsAggregator {
    tracker: Arc<IdentityHealthTracker>,
    proxies: Arc<ProxyPoolManager>,
    jobs: Arc<dyn JobStore>,
    workers: OnceLock<Arc<WorkerCounters>>,
}

impl StatisticsAggregator {
    pub fn new(
        tracker: Arc<IdentityHealthTracker>,
        proxies: Arc<ProxyPoolManager>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            tracker,
            proxies,
            jobs,
            workers: OnceLock::new(),
        }
    }

    /// Include worker pool counters in snapshots
    pub fn attach_workers(&self, counters: Arc<WorkerCounters>) {
        let _ = self.workers.set(counters);
    }

    /// Per-identity summaries
    pub fn identity_summaries(&self) -> Vec<IdentityStatus> {
        self.tracker.list()
    }

    pub fn identity_rollup(&self) -> IdentityRollup {
        let statuses = self.tracker.list();
        let mut states = StateCounts::default();
        let mut health_sum = 0.0;
        let mut quota_exhausted = 0;
        for status in &statuses {
            match status.state {
                IdentityState::Active => states.active += 1,
                IdentityState::Warming => states.warming += 1,
                IdentityState::Cooldown => states.cooldown += 1,
                IdentityState::Restricted => states.restricted += 1,
            }
            health_sum += status.health_score;
            if status.quota_exhausted() {
                quota_exhausted += 1;
            }
        }
        IdentityRollup {
            total: statuses.len(),
            states,
            avg_health_score: (!statuses.is_empty()).then(|| health_sum / statuses.len() as f64),
            quota_exhausted,
        }
    }

    pub async fn job_rollup(&self) -> Result<JobRollup> {
        let mut rollup = JobRollup::default();
        let mut delay_sum: u64 = 0;
        for job in self.jobs.list().await? {
            rollup.total += 1;
            match job.status {
                JobStatus::Queued => rollup.queued += 1,
                JobStatus::Running => rollup.running += 1,
                JobStatus::Completed => rollup.completed += 1,
                JobStatus::Failed => rollup.failed += 1,
                JobStatus::Cancelled => rollup.cancelled += 1,
            }
            rollup.targets_succeeded += job.result.success_count as u64;
            rollup.targets_failed += job.result.failed_count as u64;
            rollup.total_attempts += job.total_attempts;
            delay_sum = delay_sum.saturating_add(job.total_delay_ms);
        }
        if rollup.total_attempts > 0 {
            rollup.avg_delay_ms = Some(delay_sum as f64 / rollup.total_attempts as f64);
        }
        Ok(rollup)
    }

    pub async fn snapshot(&self) -> Result<SystemSnapshot> {
        let identities = self.identity_rollup();
        let system_load = load_from_counts(&identities.states);
        let workers = self
            .workers
            .get()
            .map(|w| WorkerRollup {
                total: w.total(),
                busy: w.busy(),
            })
            .unwrap_or_default();

        Ok(SystemSnapshot {
            generated_at: Utc::now(),
            identities,
            proxies: self.proxies.health_summary(),
            jobs: self.job_rollup().await?,
            workers,
            system_load,
        })
    }
}

impl LoadSource for StatisticsAggregator {
    fn system_load(&self) -> f64 {
        load_from_counts(&self.tracker.state_counts())
    }
}

fn load_from_counts(counts: &StateCounts) -> f64 {
    let usable = counts.total() - counts.restricted;
    if usable == 0 {
        0.0
    } else {
        counts.cooldown as f64 / usable as f64
    }
}
