//! Error types for the stack deployment engine.
//!
//! No `anyhow` leakage. Explicit, typed errors.

use std::fmt;

/// An error reported by the cloud control plane or the object store.
///
/// The message is kept verbatim so the operator sees exactly what the
/// provider said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Provider error code, when the transport surfaces one.
    pub code: Option<String>,
    /// HTTP-ish status code, when available.
    pub status: Option<u16>,
    /// Original provider message.
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Stack or resource does not exist.
    pub fn is_not_found(&self) -> bool {
        self.message.contains("does not exist")
            || self.message.contains("Unable to find details")
            || self.status == Some(404)
            || matches!(self.code.as_deref(), Some("NotFound" | "NoSuchKey"))
    }

    /// Update request carried no effective change.
    pub fn is_no_updates(&self) -> bool {
        self.message.contains("No updates are to be performed")
    }

    /// Credentials lack access to the target.
    pub fn is_forbidden(&self) -> bool {
        self.status == Some(403)
            || matches!(self.code.as_deref(), Some("Forbidden" | "AccessDenied"))
    }

    /// The deployment bucket itself is gone.
    pub fn is_bucket_missing(&self) -> bool {
        self.message.contains("The specified bucket does not exist")
            || self.code.as_deref() == Some("NoSuchBucket")
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Provider(ProviderError),

    #[error("An error occurred: {reason}.")]
    StackOperation { stack: String, reason: String },

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid workflow state: {0}")]
    InvalidState(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl DeployError {
    /// Shorthand for a provider error carrying only a message.
    pub fn provider(message: impl Into<String>) -> Self {
        DeployError::Provider(ProviderError::new(message))
    }

    /// The provider error, if this is one.
    pub fn as_provider(&self) -> Option<&ProviderError> {
        match self {
            DeployError::Provider(err) => Some(err),
            _ => None,
        }
    }

    /// Provider "does not exist" answer.
    pub fn is_not_found(&self) -> bool {
        self.as_provider().is_some_and(ProviderError::is_not_found)
    }

    /// Provider "no updates are to be performed" answer.
    pub fn is_no_updates(&self) -> bool {
        self.as_provider().is_some_and(ProviderError::is_no_updates)
    }

    /// Whether re-running the whole deployment might succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeployError::Provider(_) | DeployError::Cancelled(_))
    }
}

impl From<ProviderError> for DeployError {
    fn from(err: ProviderError) -> Self {
        DeployError::Provider(err)
    }
}
