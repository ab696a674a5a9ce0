//! Identity persistence
//!
//! The outcome recorder writes an identity's record after every recorded
//! attempt, so daily counters are durable before the job moves past the
//! target. Whole-map snapshots still cover administrative changes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::tracker::ManagedIdentity;
use crate::persist::{read_json, write_json_atomic};
use crate::types::{GatehouseError, Result};

/// Durable storage for identity records
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Insert or replace one record atomically
    async fn save(&self, identity: &ManagedIdentity) -> Result<()>;

    /// All records, sorted by id
    async fn list(&self) -> Result<Vec<ManagedIdentity>>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default, Clone)]
pub struct InMemoryIdentityStore {
    records: Arc<RwLock<HashMap<String, ManagedIdentity>>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn save(&self, identity: &ManagedIdentity) -> Result<()> {
        self.records
            .write()
            .await
            .insert(identity.id.clone(), identity.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ManagedIdentity>> {
        let mut records: Vec<ManagedIdentity> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

// ============================================================================
// File store
// ============================================================================

/// One JSON file per identity under a directory
pub struct FileIdentityStore {
    dir: PathBuf,
}

impl FileIdentityStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, identity_id: &str) -> Result<PathBuf> {
        let safe = !identity_id.is_empty()
            && !identity_id.starts_with('.')
            && identity_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
        if !safe {
            return Err(GatehouseError::BadRequest(format!(
                "identity id cannot be stored as a file: {identity_id}"
            )));
        }
        Ok(self.dir.join(format!("{identity_id}.json")))
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn save(&self, identity: &ManagedIdentity) -> Result<()> {
        write_json_atomic(&self.path_for(&identity.id)?, identity).await
    }

    async fn list(&self) -> Result<Vec<ManagedIdentity>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<ManagedIdentity>(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable identity record"),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(dir = %self.dir.display(), count = records.len(), "Listed identity records");
        Ok(records)
    }
}
