//! Job persistence
//!
//! Each save replaces the whole record, so the cursor, counters and progress
//! of a job always land together.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::model::BulkJob;
use crate::persist::{read_json, write_json_atomic};
use crate::types::{GatehouseError, Result};

/// Durable storage for job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job record atomically
    async fn save(&self, job: &BulkJob) -> Result<()>;

    async fn load(&self, job_id: &str) -> Result<Option<BulkJob>>;

    /// All jobs, oldest first
    async fn list(&self) -> Result<Vec<BulkJob>>;
}

// ============================================================================
// In-memory store (tests, ephemeral deployments)
// ============================================================================

#[derive(Default, Clone)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<String, BulkJob>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: &BulkJob) -> Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<BulkJob>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn list(&self) -> Result<Vec<BulkJob>> {
        let mut jobs: Vec<BulkJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }
}

// ============================================================================
// File store
// ============================================================================

/// One JSON file per job under a directory
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf> {
        let safe = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(GatehouseError::BadRequest(format!("invalid job id: {job_id}")));
        }
        Ok(self.dir.join(format!("{job_id}.json")))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, job: &BulkJob) -> Result<()> {
        write_json_atomic(&self.path_for(&job.id)?, job).await
    }

    async fn load(&self, job_id: &str) -> Result<Option<BulkJob>> {
        match self.path_for(job_id) {
            Ok(path) => read_json(&path).await,
            Err(_) => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<BulkJob>> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<BulkJob>(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job record"),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        debug!(dir = %self.dir.display(), count = jobs.len(), "Listed job records");
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobStatus, JobSubmission};
    use crate::types::{Operation, OperationType, SpeedTier};
    use chrono::Utc;
    use serde_json::json;

    fn sample() -> BulkJob {
        BulkJob::from_submission(
            JobSubmission::new(
                "acct",
                Operation::new(OperationType::Extract, SpeedTier::Medium),
                vec![json!("a"), json!("b")],
            ),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryJobStore::new();
        let mut job = sample();
        store.save(&job).await.unwrap();

        job.advance(true);
        store.save(&job).await.unwrap();

        let loaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.cursor, 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = sample();
        {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            job.status = JobStatus::Running;
            job.advance(false);
            store.save(&job).await.unwrap();
        }

        let store = FileJobStore::open(dir.path()).await.unwrap();
        let loaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        let mut job = sample();
        job.id = "../escape".into();
        assert!(store.save(&job).await.is_err());
        assert!(store.load("../escape").await.unwrap().is_none());
    }
}
