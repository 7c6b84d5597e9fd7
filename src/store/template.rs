//! Storage trait for issued templates.
//!
//! The orchestrator writes every template it sends to the control plane
//! before sending it, so the operator can inspect exactly what was
//! issued, even in dry-run or deferred mode. Implement this trait to
//! keep those copies elsewhere.

use crate::error::DeployError;
use async_trait::async_trait;

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Write `body` under `file_name`, replacing any previous copy.
    async fn save(&self, file_name: &str, body: &str) -> Result<(), DeployError>;

    /// Read a saved template.
    ///
    /// Returns `Ok(None)` if nothing was saved under that name.
    async fn load(&self, file_name: &str) -> Result<Option<String>, DeployError>;
}
