//! File-backed template store.
//!
//! Writes each template as `{local_dir}/{file_name}`, `.serverless/` by
//! default.

use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::store::TemplateStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// File-backed implementation of [`TemplateStore`].
pub struct FileTemplateStore {
    dir: PathBuf,
}

impl FileTemplateStore {
    /// Store rooted at the configured packaging directory.
    pub fn from_config(config: &DeployConfig) -> Self {
        Self::new(config.local_dir.clone())
    }

    /// Store rooted at a custom directory. Created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }
}

#[async_trait]
impl TemplateStore for FileTemplateStore {
    async fn save(&self, file_name: &str, body: &str) -> Result<(), DeployError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DeployError::Storage(format!("failed to create local dir: {}", e)))?;

        let path = self.path(file_name);
        tokio::fs::write(&path, body).await.map_err(|e| {
            DeployError::Storage(format!("failed to write {}: {}", path.display(), e))
        })?;

        Ok(())
    }

    async fn load(&self, file_name: &str) -> Result<Option<String>, DeployError> {
        let path = self.path(file_name);

        if tokio::fs::metadata(&path).await.is_err() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            DeployError::Storage(format!("failed to read {}: {}", path.display(), e))
        })?;

        Ok(Some(content))
    }
}
