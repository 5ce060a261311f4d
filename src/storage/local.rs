//! Local filesystem hint store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::{FailureHints, HintStore};

/// JSON file store, written atomically.
#[derive(Debug, Clone)]
pub struct LocalHintStore {
    path: PathBuf,
}

impl LocalHintStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_dir().await?;

        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl HintStore for LocalHintStore {
    async fn load(&self) -> Result<FailureHints> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FailureHints::default()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn save(&self, hints: &FailureHints) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(hints)?;
        self.write_bytes(&bytes).await?;
        log::debug!("Saved {} failure hints to {:?}", hints.urls.len(), self.path);
        Ok(())
    }
}
