//! Bulk job records
//!
//! A job is the durable unit of work: an identity, an operation template and
//! an ordered target list walked by `cursor`. Everything needed to resume is
//! in the record itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorType, GatehouseError, Operation, OperationResult, Result};

/// Job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-target outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub success_count: u32,
    pub failed_count: u32,
}

/// Self-resubmission schedule for continuous jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    /// Pause between a run completing and the next one starting
    pub interval_secs: u64,
    /// Further runs after this one; `None` repeats until cancelled
    #[serde(default)]
    pub remaining_runs: Option<u32>,
}

impl Recurrence {
    /// Schedule for the next child, `None` when no runs remain
    pub fn next(&self) -> Option<Recurrence> {
        match self.remaining_runs {
            Some(0) => None,
            Some(n) => Some(Recurrence {
                interval_secs: self.interval_secs,
                remaining_runs: Some(n - 1),
            }),
            None => Some(self.clone()),
        }
    }
}

/// Attempt written ahead of an execution call
///
/// The record moves through three persisted stages: written ahead with no
/// outcome, carrying the execution outcome, and cleared once the outcome is
/// folded into the job's counters. Resume picks up from whichever stage the
/// last save reached; the identity tracker drops a replay of an attempt it
/// already applied by [`InFlightAttempt::key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightAttempt {
    pub target_index: usize,
    /// 1-based attempt number at this target
    pub attempt: u32,
    pub proxy_endpoint_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub outcome: Option<AttemptOutcome>,
}

impl InFlightAttempt {
    pub fn new(
        target_index: usize,
        attempt: u32,
        proxy_endpoint_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            target_index,
            attempt,
            proxy_endpoint_id: proxy_endpoint_id.into(),
            started_at,
            outcome: None,
        }
    }

    /// Identifies this attempt to the identity tracker across restarts
    pub fn key(&self, job_id: &str) -> String {
        format!("{}:{}:{}", job_id, self.target_index, self.attempt)
    }
}

/// Finished execution of an in-flight attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub success: bool,
    #[serde(default)]
    pub error_type: Option<ErrorType>,
    #[serde(default)]
    pub message: Option<String>,
    pub duration_ms: u64,
    pub response_time_ms: u64,
}

impl AttemptOutcome {
    pub fn succeeded(duration_ms: u64, response_time_ms: u64) -> Self {
        Self {
            success: true,
            error_type: None,
            message: None,
            duration_ms,
            response_time_ms,
        }
    }

    pub fn failed(error_type: ErrorType, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            error_type: Some(error_type),
            message: Some(message.into()),
            duration_ms,
            response_time_ms: 0,
        }
    }

    /// Stand-in for an execution cut off by a crash
    pub fn interrupted() -> Self {
        Self::failed(ErrorType::Unknown, "interrupted before an outcome was saved", 0)
    }

    /// Error class of a failure; `None` on success
    pub fn error(&self) -> Option<ErrorType> {
        if self.success {
            None
        } else {
            Some(self.error_type.unwrap_or(ErrorType::Unknown))
        }
    }

    pub fn to_result(&self) -> OperationResult {
        match self.error() {
            None => OperationResult::succeeded(self.duration_ms, self.response_time_ms),
            Some(kind) => OperationResult::failed(kind, self.duration_ms),
        }
    }
}

/// Job submission as accepted by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub identity_id: String,
    pub operation: Operation,
    pub targets: Vec<serde_json::Value>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    /// Earliest start time
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl JobSubmission {
    pub fn new(identity_id: impl Into<String>, operation: Operation, targets: Vec<serde_json::Value>) -> Self {
        Self {
            identity_id: identity_id.into(),
            operation,
            targets,
            recurrence: None,
            not_before: None,
        }
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity_id.trim().is_empty() {
            return Err(GatehouseError::BadRequest("identity_id is required".into()));
        }
        if let Some(recurrence) = &self.recurrence {
            if recurrence.interval_secs == 0 {
                return Err(GatehouseError::BadRequest(
                    "recurrence interval_secs must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Persistent job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkJob {
    pub id: String,
    pub identity_id: String,
    pub operation: Operation,
    pub status: JobStatus,
    /// 0 - 100, derived from cursor and target count
    pub progress: u8,
    pub result: JobResult,
    pub targets: Vec<serde_json::Value>,
    /// Index of the next unprocessed target
    pub cursor: usize,
    /// Completed execution attempts at `cursor`
    #[serde(default)]
    pub attempts_at_cursor: u32,
    /// Retryable admission denials at `cursor`
    #[serde(default)]
    pub denials_at_cursor: u32,
    /// Back-to-back stalled admission checks; drives the stall backoff
    #[serde(default)]
    pub consecutive_stalls: u32,
    #[serde(default)]
    pub in_flight: Option<InFlightAttempt>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub parent_job_id: Option<String>,
    #[serde(default)]
    pub child_job_id: Option<String>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Executions attempted across all targets
    #[serde(default)]
    pub total_attempts: u64,
    /// Sum of admission delays slept
    #[serde(default)]
    pub total_delay_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BulkJob {
    pub fn from_submission(submission: JobSubmission, now: DateTime<Utc>) -> Self {
        let mut job = Self {
            id: uuid::Uuid::new_v4().to_string(),
            identity_id: submission.identity_id,
            operation: submission.operation,
            status: JobStatus::Queued,
            progress: 0,
            result: JobResult::default(),
            targets: submission.targets,
            cursor: 0,
            attempts_at_cursor: 0,
            denials_at_cursor: 0,
            consecutive_stalls: 0,
            in_flight: None,
            failure_reason: None,
            recurrence: submission.recurrence,
            parent_job_id: None,
            child_job_id: None,
            not_before: submission.not_before,
            total_attempts: 0,
            total_delay_ms: 0,
            created_at: now,
            updated_at: now,
        };
        job.refresh_progress();
        job
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.targets.len()
    }

    pub fn current_target(&self) -> Option<&serde_json::Value> {
        self.targets.get(self.cursor)
    }

    /// Record the current target's final outcome and move past it
    pub fn advance(&mut self, success: bool) {
        if success {
            self.result.success_count += 1;
        } else {
            self.result.failed_count += 1;
        }
        self.cursor += 1;
        self.attempts_at_cursor = 0;
        self.denials_at_cursor = 0;
        self.in_flight = None;
        self.refresh_progress();
    }

    /// Recompute progress from the cursor
    ///
    /// Never moves backwards while the job is live.
    pub fn refresh_progress(&mut self) {
        let computed = if self.targets.is_empty() {
            100
        } else {
            ((self.cursor.min(self.targets.len()) * 100) / self.targets.len()) as u8
        };
        self.progress = self.progress.max(computed);
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationType, SpeedTier};
    use serde_json::json;

    fn job(targets: usize) -> BulkJob {
        let submission = JobSubmission::new(
            "acct",
            Operation::new(OperationType::Message, SpeedTier::Fast),
            (0..targets).map(|i| json!(format!("user-{i}"))).collect(),
        );
        BulkJob::from_submission(submission, Utc::now())
    }

    #[test]
    fn test_progress_tracks_cursor() {
        let mut job = job(3);
        assert_eq!(job.progress, 0);
        job.advance(true);
        assert_eq!(job.progress, 33);
        job.advance(false);
        job.advance(true);
        assert_eq!(job.progress, 100);
        assert!(job.is_complete());
        assert_eq!(job.result, JobResult { success_count: 2, failed_count: 1 });
    }

    #[test]
    fn test_empty_job_is_complete() {
        let job = job(0);
        assert!(job.is_complete());
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_recurrence_countdown() {
        let r = Recurrence { interval_secs: 60, remaining_runs: Some(1) };
        let next = r.next().unwrap();
        assert_eq!(next.remaining_runs, Some(0));
        assert!(next.next().is_none());

        let forever = Recurrence { interval_secs: 60, remaining_runs: None };
        assert_eq!(forever.next(), Some(forever.clone()));
    }

    #[test]
    fn test_submission_validation() {
        let mut submission = JobSubmission::new(
            " ",
            Operation::new(OperationType::Join, SpeedTier::Slow),
            vec![],
        );
        assert!(submission.validate().is_err());
        submission.identity_id = "acct".into();
        assert!(submission.validate().is_ok());
        submission.recurrence = Some(Recurrence { interval_secs: 0, remaining_runs: None });
        assert!(submission.validate().is_err());
    }

    #[test]
    fn test_attempt_outcome_maps_to_result() {
        let ok = AttemptOutcome::succeeded(40, 25).to_result();
        assert!(ok.success);
        assert_eq!(ok.response_time_ms, 25);

        let cut = AttemptOutcome::interrupted();
        assert_eq!(cut.error(), Some(ErrorType::Unknown));
        assert_eq!(cut.to_result().effective_error(), Some(ErrorType::Unknown));

        let attempt = InFlightAttempt::new(3, 2, "http://p:1", Utc::now());
        assert_eq!(attempt.key("job-9"), "job-9:3:2");
    }

    #[test]
    fn test_older_in_flight_record_loads_without_outcome() {
        let raw = json!({
            "target_index": 1,
            "attempt": 1,
            "proxy_endpoint_id": "http://p:1",
            "started_at": "2026-03-02T10:00:00Z"
        });
        let attempt: InFlightAttempt = serde_json::from_value(raw).unwrap();
        assert!(attempt.outcome.is_none());
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(serde_json::to_string(&JobStatus::Cancelled).unwrap(), "\"cancelled\"");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
