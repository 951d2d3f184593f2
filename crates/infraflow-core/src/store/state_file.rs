//! Versioned JSON snapshot files
//!
//! Used by the file-backed entity store and by the task manager to keep the
//! queue across restarts. The previous snapshot is kept as `<file>.backup`.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    updated_at: DateTime<Utc>,
    data: T,
}

/// JSON snapshot on disk
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        self.path.with_extension("json.backup")
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Load the snapshot, or `T::default()` when the file does not exist yet
    pub async fn load<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        if !fs::try_exists(&self.path).await? {
            tracing::debug!("State file {} not found, starting empty", self.path.display());
            return Ok(T::default());
        }

        let content = fs::read_to_string(&self.path).await?;
        let envelope: Envelope<T> = serde_json::from_str(&content)?;

        if envelope.version > STATE_VERSION {
            return Err(CoreError::StateError(format!(
                "State file version {} is newer than supported version {}",
                envelope.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded state from {}", self.path.display());
        Ok(envelope.data)
    }

    /// Write a new snapshot. The rename makes the write atomic.
    pub async fn save<T>(&self, data: &T) -> Result<()>
    where
        T: Serialize,
    {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).await?;
        }

        let envelope = Envelope {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            data,
        };
        let content = serde_json::to_string_pretty(&envelope)?;

        let tmp = self.temp_path();
        fs::write(&tmp, content).await?;

        if fs::try_exists(&self.path).await? {
            fs::copy(&self.path, self.backup_path()).await?;
        }
        fs::rename(&tmp, &self.path).await?;

        tracing::debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = tempdir().unwrap();
        let file = StateFile::new(temp_dir.path().join("state").join("entities.json"));

        let mut data = BTreeMap::new();
        data.insert("net-1".to_string(), "active".to_string());
        file.save(&data).await.unwrap();

        let loaded: BTreeMap<String, String> = file.load().await.unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn test_backup_created_on_second_save() {
        let temp_dir = tempdir().unwrap();
        let file = StateFile::new(temp_dir.path().join("tasks.json"));

        file.save(&vec![1u32]).await.unwrap();
        file.save(&vec![1u32, 2]).await.unwrap();

        assert!(temp_dir.path().join("tasks.json.backup").exists());
        let loaded: Vec<u32> = file.load().await.unwrap();
        assert_eq!(loaded, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let file = StateFile::new(temp_dir.path().join("missing.json"));

        let loaded: Vec<String> = file.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("future.json");
        std::fs::write(
            &path,
            r#"{"version": 99, "updated_at": "2026-01-01T00:00:00Z", "data": []}"#,
        )
        .unwrap();

        let result: Result<Vec<String>> = StateFile::new(&path).load().await;
        assert!(matches!(result, Err(CoreError::StateError(_))));
    }
}
