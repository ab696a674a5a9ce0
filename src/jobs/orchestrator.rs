//! Bulk Job Orchestrator
//!
//! Drives each job's targets through admission, execution and outcome
//! recording, persisting the job after every state change.
//!
//! ## Per-target flow
//!
//! ```text
//! check ──denied──► requeue after backoff / fail job
//!   │
//! approved ─► write-ahead in_flight ─► sleep(delay) ─► execute
//!                                                         │
//!              persist outcome ◄──────────────────────────┘
//!                     │
//!                   record ─► advance cursor + counters, persist
//! ```
//!
//! A worker never sleeps on a denial or a retry backoff. It persists the job
//! and hands it back to the queue after the wait, so a stalled identity
//! cannot starve other jobs.
//!
//! Targets of one identity are processed strictly one at a time across all
//! jobs: the identity lock is held from the admission check until the
//! outcome is recorded.
//!
//! When a job record cannot be saved, the latest in-memory state is parked
//! and the job is requeued; the next pass resumes from the parked copy.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::execution::{ExecutionCapability, ExecutionError, ExecutionRequest};
use super::model::{AttemptOutcome, BulkJob, InFlightAttempt, JobStatus, JobSubmission};
use super::store::JobStore;
use super::targets::{RepeatTargets, TargetSource};
use super::worker::{WorkerCounters, WorkerPool};
use crate::admission::{AdmissionController, OutcomeRecorder};
use crate::clock::Clock;
use crate::logging::AuditLogger;
use crate::proxy::ProxyPoolManager;
use crate::types::{AdmissionDecision, Disposition, ErrorType, GatehouseError, Operation, Result};

// ============================================================================
// Tuning
// ============================================================================

/// Retry and backoff bounds for job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorTuning {
    /// Execution attempts per target before it counts as failed
    pub max_attempts: u32,
    /// `risk_too_high` denials per target before it counts as failed
    pub max_denials_per_target: u32,
    /// Base backoff after a transient failure or retryable denial
    pub retry_backoff_ms: u64,
    /// Base backoff while stalled on cooldown or an empty proxy pool
    pub stall_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub execution_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for OrchestratorTuning {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_denials_per_target: 5,
            retry_backoff_ms: 2_000,
            stall_backoff_ms: 5_000,
            max_backoff_ms: 60_000,
            execution_timeout_ms: 30_000,
            queue_capacity: 1_024,
        }
    }
}

impl OrchestratorTuning {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 || self.max_denials_per_target == 0 {
            return Err(GatehouseError::Config(
                "max_attempts and max_denials_per_target must be positive".into(),
            ));
        }
        if self.retry_backoff_ms > self.max_backoff_ms || self.stall_backoff_ms > self.max_backoff_ms {
            return Err(GatehouseError::Config(
                "base backoffs must not exceed max_backoff_ms".into(),
            ));
        }
        if self.execution_timeout_ms == 0 || self.queue_capacity == 0 {
            return Err(GatehouseError::Config(
                "execution_timeout_ms and queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Exponential backoff for the n-th consecutive retry (n >= 1)
    fn backoff(&self, base_ms: u64, n: u32) -> Duration {
        let exp = n.saturating_sub(1).min(16);
        let ms = base_ms.saturating_mul(1u64 << exp).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Upper bound on a recurrence interval (one year)
const MAX_INTERVAL_SECS: u64 = 365 * 24 * 3600;

/// What a worker does with a job after one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Terminal; nothing left to schedule
    Done,
    /// Hand the job back to the queue after the wait
    Requeue(Duration),
}

pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    admission: Arc<AdmissionController>,
    recorder: Arc<OutcomeRecorder>,
    executor: Arc<dyn ExecutionCapability>,
    proxies: Arc<ProxyPoolManager>,
    targets: Arc<dyn TargetSource>,
    tuning: OrchestratorTuning,
    clock: Arc<dyn Clock>,
    audit: AuditLogger,
    queue_tx: mpsc::Sender<String>,
    queue_rx: std::sync::Mutex<Option<mpsc::Receiver<String>>>,
    /// One lock per identity; serializes check-execute-record across jobs
    identity_locks: DashMap<String, Arc<Mutex<()>>>,
    cancel_flags: DashMap<String, Arc<AtomicBool>>,
    /// Jobs currently being driven by a worker
    claimed: DashSet<String>,
    /// Latest state of jobs whose last save failed
    parked: DashMap<String, BulkJob>,
    /// Consecutive failed passes per job, for the store backoff
    store_failures: DashMap<String, u32>,
    /// Serializes job record writes between runners and `cancel`
    write_lock: Mutex<()>,
    workers: Arc<WorkerCounters>,
}

impl JobOrchestrator {
    pub fn new(
        tuning: OrchestratorTuning,
        store: Arc<dyn JobStore>,
        admission: Arc<AdmissionController>,
        recorder: Arc<OutcomeRecorder>,
        executor: Arc<dyn ExecutionCapability>,
        proxies: Arc<ProxyPoolManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(tuning.queue_capacity.max(1));
        Self {
            store,
            admission,
            recorder,
            executor,
            proxies,
            targets: Arc::new(RepeatTargets),
            tuning,
            clock,
            audit: AuditLogger::new(),
            queue_tx,
            queue_rx: std::sync::Mutex::new(Some(queue_rx)),
            identity_locks: DashMap::new(),
            cancel_flags: DashMap::new(),
            claimed: DashSet::new(),
            parked: DashMap::new(),
            store_failures: DashMap::new(),
            write_lock: Mutex::new(()),
            workers: Arc::new(WorkerCounters::default()),
        }
    }

    /// Source of fresh targets for recurring jobs
    pub fn with_target_source(mut self, targets: Arc<dyn TargetSource>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn tuning(&self) -> &OrchestratorTuning {
        &self.tuning
    }

    pub fn worker_counters(&self) -> Arc<WorkerCounters> {
        Arc::clone(&self.workers)
    }

    /// Start the worker pool; may be called once
    pub fn spawn_workers(self: &Arc<Self>, worker_count: usize) -> Result<WorkerPool> {
        let queue = self
            .queue_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| GatehouseError::Internal("job workers already started".into()))?;
        Ok(WorkerPool::start(
            Arc::clone(self),
            queue,
            worker_count,
            Arc::clone(&self.workers),
        ))
    }

    // ------------------------------------------------------------------------
    // Public contract
    // ------------------------------------------------------------------------

    /// Persist and enqueue a new job
    pub async fn submit(&self, submission: JobSubmission) -> Result<String> {
        submission.validate()?;
        self.admission.tracker().get_status(&submission.identity_id)?;

        let job = BulkJob::from_submission(submission, self.clock.now());
        info!(
            job_id = %job.id,
            identity_id = %job.identity_id,
            operation = job.operation.op_type.as_str(),
            targets = job.targets.len(),
            "Job submitted"
        );
        self.submit_job(job).await
    }

    pub async fn get_status(&self, job_id: &str) -> Result<BulkJob> {
        self.store
            .load(job_id)
            .await?
            .ok_or_else(|| GatehouseError::job_not_found(job_id))
    }

    pub async fn list(&self) -> Result<Vec<BulkJob>> {
        self.store.list().await
    }

    /// Mark a job cancelled
    ///
    /// A running job finishes its in-flight operation and skips the rest.
    pub async fn cancel(&self, job_id: &str) -> Result<BulkJob> {
        let job = {
            let _write = self.write_lock.lock().await;
            let mut job = self
                .store
                .load(job_id)
                .await?
                .ok_or_else(|| GatehouseError::job_not_found(job_id))?;

            match job.status {
                JobStatus::Cancelled => return Ok(job),
                status if status.is_terminal() => {
                    return Err(GatehouseError::BadRequest(format!(
                        "job {} is already {}",
                        job_id,
                        status.as_str()
                    )))
                }
                _ => {}
            }

            self.cancel_flag(job_id).store(true, Ordering::SeqCst);
            job.status = JobStatus::Cancelled;
            job.updated_at = self.clock.now();
            self.store.save(&job).await?;
            job
        };

        info!(job_id = %job_id, cursor = job.cursor, "Job cancelled");
        self.audit
            .log_job_state(job_id, &job.identity_id, JobStatus::Cancelled.as_str())
            .await;
        Ok(job)
    }

    /// Re-enqueue every queued or running job from its persisted cursor
    pub async fn resume_incomplete(&self) -> Result<usize> {
        let mut resumed = 0;
        for job in self.store.list().await? {
            if job.status.is_terminal() {
                continue;
            }
            info!(
                job_id = %job.id,
                status = job.status.as_str(),
                cursor = job.cursor,
                targets = job.targets.len(),
                "Resuming job"
            );
            self.enqueue(job.id.clone(), job.not_before).await?;
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Run one pass of a job; called by workers
    ///
    /// A pass ends when the job is terminal, or when it must wait (stall,
    /// retryable denial, retry backoff, failed save). Waiting jobs go back on
    /// the queue, so the worker is free for other jobs in the meantime.
    pub async fn run_job(&self, job_id: &str) -> Result<()> {
        if !self.claimed.insert(job_id.to_string()) {
            debug!(job_id = %job_id, "Job already claimed by another worker");
            return Ok(());
        }
        let pass = self.run_pass(job_id).await;
        self.claimed.remove(job_id);

        match pass {
            Ok(Pass::Done) => {
                self.cancel_flags.remove(job_id);
                self.store_failures.remove(job_id);
                Ok(())
            }
            Ok(Pass::Requeue(wait)) => {
                self.store_failures.remove(job_id);
                self.enqueue_after(job_id.to_string(), wait);
                Ok(())
            }
            Err(GatehouseError::Storage(message)) => {
                let failures = {
                    let mut count = self.store_failures.entry(job_id.to_string()).or_insert(0);
                    *count += 1;
                    *count
                };
                let wait = self.tuning.backoff(self.tuning.retry_backoff_ms, failures);
                warn!(
                    job_id = %job_id,
                    failures = failures,
                    retry_in_ms = wait.as_millis() as u64,
                    error = %message,
                    "Job store unavailable; job requeued"
                );
                self.enqueue_after(job_id.to_string(), wait);
                Err(GatehouseError::Storage(message))
            }
            Err(e) => {
                self.cancel_flags.remove(job_id);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Job loop
    // ------------------------------------------------------------------------

    async fn run_pass(&self, job_id: &str) -> Result<Pass> {
        let (mut job, parked) = match self.parked.remove(job_id) {
            Some((_, job)) => (job, true),
            None => (self.get_status(job_id).await?, false),
        };

        let pass = if parked && job.status.is_terminal() {
            // the terminal save itself failed last time
            self.conclude(&mut job).await.map(|_| Pass::Done)
        } else {
            self.drive(&mut job).await
        };

        if matches!(pass, Err(GatehouseError::Storage(_))) {
            self.parked.insert(job_id.to_string(), job);
        }
        pass
    }

    async fn drive(&self, job: &mut BulkJob) -> Result<Pass> {
        if job.status.is_terminal() {
            return Ok(Pass::Done);
        }

        let cancel = self.cancel_flag(&job.id);
        let identity_lock = self.identity_lock(&job.identity_id);

        if job.status != JobStatus::Running {
            job.status = JobStatus::Running;
            self.persist(job).await?;
            self.audit
                .log_job_state(&job.id, &job.identity_id, JobStatus::Running.as_str())
                .await;
        }

        if job.in_flight.is_some() {
            let guard = identity_lock.lock().await;
            let retry_after = self.settle_attempt(job).await?;
            drop(guard);
            if job.status.is_terminal() {
                return Ok(Pass::Done);
            }
            if let Some(wait) = retry_after {
                return Ok(Pass::Requeue(wait));
            }
        }

        loop {
            if cancel.load(Ordering::SeqCst) || job.status == JobStatus::Cancelled {
                job.status = JobStatus::Cancelled;
                self.finish(job).await?;
                return Ok(Pass::Done);
            }
            if job.is_complete() {
                job.status = JobStatus::Completed;
                self.conclude(job).await?;
                return Ok(Pass::Done);
            }

            let target = job.current_target().cloned().unwrap_or_default();
            let operation = job.operation.clone().with_target_info(target);

            let guard = identity_lock.lock().await;
            let decision = match self.admission.check(&job.identity_id, &operation) {
                Ok(decision) => decision,
                Err(e) => {
                    drop(guard);
                    warn!(job_id = %job.id, error = %e, "Admission check failed");
                    job.fail(e.to_string());
                    self.finish(job).await?;
                    return Ok(Pass::Done);
                }
            };

            match decision.reason.disposition() {
                Disposition::Proceed => {}
                Disposition::Terminal => {
                    drop(guard);
                    self.audit.log_denial(&job.identity_id, Some(&job.id), &decision).await;
                    warn!(
                        job_id = %job.id,
                        identity_id = %job.identity_id,
                        reason = %decision.reason,
                        cursor = job.cursor,
                        "Job halted by admission"
                    );
                    job.fail(decision.reason.as_str());
                    self.finish(job).await?;
                    return Ok(Pass::Done);
                }
                Disposition::Stall => {
                    drop(guard);
                    job.consecutive_stalls += 1;
                    if job.consecutive_stalls == 1 {
                        self.audit.log_denial(&job.identity_id, Some(&job.id), &decision).await;
                        info!(
                            job_id = %job.id,
                            reason = %decision.reason,
                            cursor = job.cursor,
                            "Job stalled"
                        );
                    }
                    let wait = self.stall_delay(&decision, job.consecutive_stalls);
                    self.persist(job).await?;
                    return Ok(Pass::Requeue(wait));
                }
                Disposition::Retry => {
                    drop(guard);
                    self.audit.log_denial(&job.identity_id, Some(&job.id), &decision).await;
                    job.denials_at_cursor += 1;
                    let denials = job.denials_at_cursor;
                    if denials >= self.tuning.max_denials_per_target {
                        warn!(
                            job_id = %job.id,
                            cursor = job.cursor,
                            denials = denials,
                            "Target abandoned after repeated denials"
                        );
                        job.advance(false);
                    }
                    self.persist(job).await?;
                    return Ok(Pass::Requeue(
                        self.tuning.backoff(self.tuning.retry_backoff_ms, denials),
                    ));
                }
            }

            if job.consecutive_stalls > 0 {
                info!(job_id = %job.id, cursor = job.cursor, "Job resumed after stall");
                job.consecutive_stalls = 0;
            }

            let Some(proxy_endpoint_id) = decision.proxy_endpoint_id.clone() else {
                drop(guard);
                job.fail("approved decision without a proxy");
                self.finish(job).await?;
                return Ok(Pass::Done);
            };

            // Write ahead so a crash during execution is visible on resume
            job.in_flight = Some(InFlightAttempt::new(
                job.cursor,
                job.attempts_at_cursor + 1,
                proxy_endpoint_id.clone(),
                self.clock.now(),
            ));
            job.total_attempts += 1;
            job.total_delay_ms += decision.delay_ms;
            if let Err(e) = self.persist(job).await {
                self.proxies.cancel_lease(&proxy_endpoint_id).ok();
                job.in_flight = None;
                job.total_attempts -= 1;
                job.total_delay_ms -= decision.delay_ms;
                return Err(e);
            }

            let outcome = self
                .execute(job, &operation, &decision, &proxy_endpoint_id)
                .await;
            if let Some(attempt) = job.in_flight.as_mut() {
                attempt.outcome = Some(outcome);
            }
            if let Err(e) = self.persist(job).await {
                // recording goes ahead; the identity side skips a replay of this attempt
                warn!(job_id = %job.id, error = %e, "Could not save attempt outcome");
            }

            let retry_after = self.settle_attempt(job).await?;
            drop(guard);

            if job.status.is_terminal() {
                return Ok(Pass::Done);
            }
            if let Some(wait) = retry_after {
                return Ok(Pass::Requeue(wait));
            }
        }
    }

    /// Sleep the admission delay and execute
    async fn execute(
        &self,
        job: &BulkJob,
        operation: &Operation,
        decision: &AdmissionDecision,
        proxy_endpoint_id: &str,
    ) -> AttemptOutcome {
        tokio::time::sleep(Duration::from_millis(decision.delay_ms)).await;

        let request = ExecutionRequest {
            job_id: job.id.clone(),
            identity_id: job.identity_id.clone(),
            proxy_endpoint_id: proxy_endpoint_id.to_string(),
            proxy: self.proxies.descriptor(proxy_endpoint_id).ok(),
            operation: operation.clone(),
        };

        let started = Instant::now();
        let timeout = Duration::from_millis(self.tuning.execution_timeout_ms);
        let outcome = match tokio::time::timeout(timeout, self.executor.execute(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExecutionError::transient("execution timed out")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(success) => AttemptOutcome::succeeded(duration_ms, success.response_time_ms),
            Err(err) => AttemptOutcome::failed(err.kind, err.message, duration_ms),
        }
    }

    /// Record the in-flight attempt once and fold it into the job counters
    ///
    /// An attempt without a saved outcome was cut off by a crash and counts
    /// as one unknown failure. Returns the retry backoff when the same
    /// target should be attempted again.
    async fn settle_attempt(&self, job: &mut BulkJob) -> Result<Option<Duration>> {
        let Some(attempt) = job.in_flight.take() else {
            return Ok(None);
        };
        let outcome = match attempt.outcome.clone() {
            Some(outcome) => outcome,
            None => {
                warn!(
                    job_id = %job.id,
                    target_index = attempt.target_index,
                    attempt = attempt.attempt,
                    "Recovering interrupted attempt"
                );
                AttemptOutcome::interrupted()
            }
        };

        let target = job.targets.get(attempt.target_index).cloned().unwrap_or_default();
        let operation = job.operation.clone().with_target_info(target);
        let key = attempt.key(&job.id);
        if let Err(e) = self
            .recorder
            .record_attempt(
                &job.identity_id,
                &attempt.proxy_endpoint_id,
                Some(key.as_str()),
                &operation,
                &outcome.to_result(),
            )
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to record outcome");
        }

        if attempt.target_index != job.cursor {
            return self.persist(job).await.map(|_| None);
        }

        let mut retry_after = None;
        match outcome.error() {
            None => job.advance(true),
            Some(ErrorType::Permanent) => {
                debug!(job_id = %job.id, cursor = job.cursor, error = ?outcome.message, "Target rejected");
                job.advance(false);
            }
            Some(ErrorType::Quota) => {
                job.advance(false);
                job.fail(format!(
                    "platform_quota: {}",
                    outcome.message.as_deref().unwrap_or("quota exceeded")
                ));
            }
            Some(ErrorType::Transient) | Some(ErrorType::Unknown) => {
                job.attempts_at_cursor = job.attempts_at_cursor.max(attempt.attempt);
                let attempts = job.attempts_at_cursor;
                if attempts >= self.tuning.max_attempts {
                    warn!(
                        job_id = %job.id,
                        cursor = job.cursor,
                        attempts = attempts,
                        error = ?outcome.message,
                        "Target failed after retries"
                    );
                    job.advance(false);
                } else {
                    retry_after = Some(self.tuning.backoff(self.tuning.retry_backoff_ms, attempts));
                }
            }
        }

        if job.status == JobStatus::Failed {
            self.finish(job).await?;
        } else {
            self.persist(job).await?;
        }
        Ok(retry_after)
    }

    /// Submit the next run of a completed recurring job
    async fn schedule_next_run(&self, job: &mut BulkJob) -> Result<()> {
        if job.child_job_id.is_some() {
            return Ok(());
        }
        let Some(next) = job.recurrence.as_ref().and_then(|r| r.next()) else {
            return Ok(());
        };

        let targets = match self.targets.next_batch(job).await {
            Ok(targets) if !targets.is_empty() => targets,
            Ok(_) => {
                info!(job_id = %job.id, "Recurring job has no further targets");
                return Ok(());
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Target source failed; recurrence stopped");
                return Ok(());
            }
        };

        let now = self.clock.now();
        let interval = ChronoDuration::seconds(next.interval_secs.min(MAX_INTERVAL_SECS) as i64);
        let submission = JobSubmission {
            identity_id: job.identity_id.clone(),
            operation: job.operation.clone(),
            targets,
            recurrence: Some(next),
            not_before: Some(now + interval),
        };
        let mut child = BulkJob::from_submission(submission, now);
        child.parent_job_id = Some(job.id.clone());

        job.child_job_id = Some(child.id.clone());
        if let Err(e) = self.persist(job).await {
            job.child_job_id = None;
            return Err(e);
        }

        info!(
            job_id = %job.id,
            child_job_id = %child.id,
            not_before = ?child.not_before,
            "Scheduled next run"
        );
        self.submit_job(child).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn submit_job(&self, job: BulkJob) -> Result<String> {
        self.cancel_flags.remove(&job.id);
        {
            let _write = self.write_lock.lock().await;
            self.store.save(&job).await?;
        }
        self.audit
            .log_job_state(&job.id, &job.identity_id, JobStatus::Queued.as_str())
            .await;
        self.enqueue(job.id.clone(), job.not_before).await?;
        Ok(job.id)
    }

    /// Hand a job id to the workers, now or once `not_before` passes
    async fn enqueue(&self, job_id: String, not_before: Option<DateTime<Utc>>) -> Result<()> {
        let wait = not_before
            .and_then(|at| (at - self.clock.now()).to_std().ok())
            .filter(|d| !d.is_zero());

        match wait {
            Some(wait) => {
                self.enqueue_after(job_id, wait);
                Ok(())
            }
            None => self
                .queue_tx
                .send(job_id)
                .await
                .map_err(|_| GatehouseError::Internal("job queue closed".into())),
        }
    }

    /// Send a job id to the queue once `wait` has elapsed
    fn enqueue_after(&self, job_id: String, wait: Duration) {
        let tx = self.queue_tx.clone();
        debug!(job_id = %job_id, wait_ms = wait.as_millis() as u64, "Deferring job");
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if tx.send(job_id.clone()).await.is_err() {
                warn!(job_id = %job_id, "Job queue closed before deferred start");
            }
        });
    }

    async fn persist(&self, job: &mut BulkJob) -> Result<()> {
        let _write = self.write_lock.lock().await;
        if self.is_cancelled(&job.id) && job.status != JobStatus::Failed {
            job.status = JobStatus::Cancelled;
        }
        job.updated_at = self.clock.now();
        self.store.save(job).await
    }

    /// Finish a terminal job and, once completed, schedule its next run
    async fn conclude(&self, job: &mut BulkJob) -> Result<()> {
        self.finish(job).await?;
        if job.status == JobStatus::Completed {
            self.schedule_next_run(job).await?;
        }
        Ok(())
    }

    /// Persist a terminal state and announce it
    async fn finish(&self, job: &mut BulkJob) -> Result<()> {
        self.persist(job).await?;
        info!(
            job_id = %job.id,
            status = job.status.as_str(),
            success = job.result.success_count,
            failed = job.result.failed_count,
            reason = ?job.failure_reason,
            "Job finished"
        );
        self.audit
            .log_job_state(&job.id, &job.identity_id, job.status.as_str())
            .await;
        Ok(())
    }

    fn stall_delay(&self, decision: &AdmissionDecision, stalls: u32) -> Duration {
        let backoff = self.tuning.backoff(self.tuning.stall_backoff_ms, stalls);
        match decision.snapshot.next_check_time {
            Some(at) => (at - self.clock.now())
                .to_std()
                .unwrap_or_default()
                .clamp(Duration::from_millis(self.tuning.stall_backoff_ms), Duration::from_millis(self.tuning.max_backoff_ms)),
            None => backoff,
        }
    }

    fn identity_lock(&self, identity_id: &str) -> Arc<Mutex<()>> {
        self.identity_locks
            .entry(identity_id.to_string())
            .or_default()
            .clone()
    }

    fn cancel_flag(&self, job_id: &str) -> Arc<AtomicBool> {
        self.cancel_flags
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    fn is_cancelled(&self, job_id: &str) -> bool {
        self.cancel_flags
            .get(job_id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionTuning, DelayCalculator, FixedLoad};
    use crate::clock::SystemClock;
    use crate::identity::{IdentityHealthTracker, IdentityTuning, NewIdentity};
    use crate::jobs::execution::ExecutionSuccess;
    use crate::jobs::model::Recurrence;
    use crate::jobs::store::InMemoryJobStore;
    use crate::proxy::{ProxyDescriptor, ProxyProtocol, ProxyTuning};
    use crate::types::{OperationResult, OperationType, SpeedTier};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Pops scripted outcomes per call, succeeding once the script is empty
    #[derive(Default)]
    struct ScriptedExecutor {
        script: std::sync::Mutex<VecDeque<std::result::Result<(), ExecutionError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn with(script: Vec<std::result::Result<(), ExecutionError>>) -> Self {
            Self {
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExecutionCapability for ScriptedExecutor {
        async fn execute(
            &self,
            _request: &ExecutionRequest,
        ) -> std::result::Result<ExecutionSuccess, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            next.map(|_| ExecutionSuccess { response_time_ms: 120 })
        }
    }

    struct Harness {
        tracker: Arc<IdentityHealthTracker>,
        store: Arc<InMemoryJobStore>,
        orchestrator: Arc<JobOrchestrator>,
        _pool: WorkerPool,
    }

    fn harness(executor: Arc<dyn ExecutionCapability>, admission_tuning: AdmissionTuning) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tracker = Arc::new(IdentityHealthTracker::new(IdentityTuning::default(), clock.clone()));
        let proxies = Arc::new(ProxyPoolManager::new(ProxyTuning::default(), clock.clone()));
        proxies
            .register(ProxyDescriptor {
                host: "10.1.0.1".into(),
                port: 8080,
                protocol: ProxyProtocol::Http,
                username: None,
                password: None,
                owner_identity: None,
            })
            .unwrap();
        tracker
            .register(NewIdentity::new("acct").with_warming_level(80.0))
            .unwrap();

        let admission = Arc::new(AdmissionController::new(
            tracker.clone(),
            proxies.clone(),
            DelayCalculator::default(),
            admission_tuning,
            Arc::new(FixedLoad(0.0)),
            clock.clone(),
        ));
        let recorder = Arc::new(OutcomeRecorder::new(
            tracker.clone(),
            proxies.clone(),
            AuditLogger::new(),
        ));
        let store = Arc::new(InMemoryJobStore::new());
        let orchestrator = Arc::new(JobOrchestrator::new(
            OrchestratorTuning::default(),
            store.clone(),
            admission,
            recorder,
            executor,
            proxies,
            clock,
        ));
        let pool = orchestrator.spawn_workers(2).unwrap();
        Harness {
            tracker,
            store,
            orchestrator,
            _pool: pool,
        }
    }

    fn submission(targets: usize) -> JobSubmission {
        JobSubmission::new(
            "acct",
            Operation::new(OperationType::Message, SpeedTier::Fast),
            (0..targets).map(|i| json!(format!("user-{i}"))).collect(),
        )
    }

    async fn wait_terminal(orchestrator: &JobOrchestrator, job_id: &str) -> BulkJob {
        for _ in 0..10_000 {
            let job = orchestrator.get_status(job_id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_counts_without_retry() {
        let executor = Arc::new(ScriptedExecutor::with(vec![
            Ok(()),
            Err(ExecutionError::permanent("user blocks messages")),
        ]));
        let h = harness(executor.clone(), AdmissionTuning::default());

        let id = h.orchestrator.submit(submission(3)).await.unwrap();
        let job = wait_terminal(&h.orchestrator, &id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.success_count, 2);
        assert_eq!(job.result.failed_count, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausts_retry_budget() {
        let executor = Arc::new(ScriptedExecutor::with(vec![
            Err(ExecutionError::transient("timeout")),
            Err(ExecutionError::transient("timeout")),
            Err(ExecutionError::transient("timeout")),
        ]));
        let h = harness(executor.clone(), AdmissionTuning::default());

        let id = h.orchestrator.submit(submission(1)).await.unwrap();
        let job = wait_terminal(&h.orchestrator, &id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.failed_count, 1);
        assert_eq!(job.total_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_quota_halts_job() {
        let executor = Arc::new(ScriptedExecutor::with(vec![
            Ok(()),
            Err(ExecutionError::quota("rate limited")),
        ]));
        let h = harness(executor.clone(), AdmissionTuning::default());

        let id = h.orchestrator.submit(submission(4)).await.unwrap();
        let job = wait_terminal(&h.orchestrator, &id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.result.success_count, 1);
        assert_eq!(job.result.failed_count, 1);
        assert_eq!(job.cursor, 2);
        assert!(job.failure_reason.unwrap().starts_with("platform_quota"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restricted_identity_fails_job() {
        let h = harness(Arc::new(ScriptedExecutor::default()), AdmissionTuning::default());
        h.tracker.restrict("acct", "suspended").unwrap();

        let id = h.orchestrator.submit(submission(2)).await.unwrap();
        let job = wait_terminal(&h.orchestrator, &id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("identity_restricted"));
        assert_eq!(job.result.success_count + job.result.failed_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_risk_denials_consume_budget() {
        let tuning = AdmissionTuning {
            // health weight only; a fresh identity sits at zero risk
            failure_weight: 0.0,
            proxy_weight: 0.0,
            health_weight: 1.0,
            risk_ceiling: 0.0,
            elevated_threshold: 0.0,
            slower_tier_threshold: 0.0,
            ..Default::default()
        };
        let executor = Arc::new(ScriptedExecutor::default());
        let h = harness(executor.clone(), tuning);
        // one failure puts health below 100, so risk exceeds the zero ceiling
        h.tracker
            .apply_result("acct", &OperationResult::failed(ErrorType::Transient, 1))
            .unwrap();

        let id = h.orchestrator.submit(submission(2)).await.unwrap();
        let job = wait_terminal(&h.orchestrator, &id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.failed_count, 2);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_and_terminal() {
        let h = harness(Arc::new(ScriptedExecutor::default()), AdmissionTuning::default());

        let id = h.orchestrator.submit(submission(50)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let cancelled = h.orchestrator.cancel(&id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        // the in-flight operation finishes, nothing after it runs
        tokio::time::sleep(Duration::from_secs(60)).await;
        let job = h.orchestrator.get_status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cursor >= cancelled.cursor);
        assert!(job.cursor <= cancelled.cursor + 1);
        assert!(job.cursor < 50);
        assert!(job.in_flight.is_none());

        // idempotent on cancelled, rejected on other terminal states
        assert!(h.orchestrator.cancel(&id).await.is_ok());
        let done = h.orchestrator.submit(submission(0)).await.unwrap();
        wait_terminal(&h.orchestrator, &done).await;
        assert!(matches!(
            h.orchestrator.cancel(&done).await,
            Err(GatehouseError::BadRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_job_submits_child() {
        let h = harness(Arc::new(ScriptedExecutor::default()), AdmissionTuning::default());
        let submission = submission(2).with_recurrence(Recurrence {
            interval_secs: 60,
            remaining_runs: Some(1),
        });

        let id = h.orchestrator.submit(submission).await.unwrap();
        let parent = wait_terminal(&h.orchestrator, &id).await;
        assert_eq!(parent.status, JobStatus::Completed);

        // the child link is written right after completion
        tokio::time::sleep(Duration::from_secs(1)).await;
        let parent = h.orchestrator.get_status(&id).await.unwrap();
        let child_id = parent.child_job_id.expect("child scheduled");
        let child = wait_terminal(&h.orchestrator, &child_id).await;
        assert_eq!(child.parent_job_id.as_deref(), Some(id.as_str()));
        assert_eq!(child.status, JobStatus::Completed);
        assert_eq!(child.recurrence.as_ref().unwrap().remaining_runs, Some(0));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_submit_unknown_identity_rejected() {
        let h = harness(Arc::new(ScriptedExecutor::default()), AdmissionTuning::default());
        let mut s = submission(1);
        s.identity_id = "ghost".into();
        assert!(matches!(
            h.orchestrator.submit(s).await,
            Err(GatehouseError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.get_status("missing").await,
            Err(GatehouseError::NotFound(_))
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let tuning = OrchestratorTuning::default();
        assert_eq!(tuning.backoff(2_000, 1), Duration::from_secs(2));
        assert_eq!(tuning.backoff(2_000, 2), Duration::from_secs(4));
        assert_eq!(tuning.backoff(2_000, 30), Duration::from_secs(60));
        assert!(tuning.validate().is_ok());
    }
}
