//! Atomic JSON file helpers
//!
//! Records are written to a sibling temp file and renamed over the target so
//! a crash mid-write leaves either the old or the new version, never a torn
//! file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::{GatehouseError, Result};

/// Write `value` as pretty JSON to `path` via write-then-rename
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| GatehouseError::Storage(format!("serialize {}: {}", path.display(), e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, path).await?;

    debug!(path = %path.display(), bytes = data.len(), "Wrote JSON record");
    Ok(())
}

/// Read a JSON record, `None` when the file does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(data) => {
            let value = serde_json::from_slice(&data).map_err(|e| {
                GatehouseError::Storage(format!("corrupt record {}: {}", path.display(), e))
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
