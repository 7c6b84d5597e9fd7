//! Engine configuration.
//!
//! One explicit value, handed to the workflow at construction. Every
//! option the engine honors is listed here with its default.

use crate::error::DeployError;
use crate::types::{OnFailure, Parameter, ServerSideEncryption};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Inline template body limit of the control plane, in bytes.
pub const DEFAULT_INLINE_TEMPLATE_LIMIT: usize = 51_200;

/// Historical deployments kept by the retention collector.
pub const DEFAULT_RETENTION_COUNT: usize = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeployConfig {
    /// Service name; part of the stack name and the storage namespace.
    pub service: String,
    /// Stage name (dev, prod, ...).
    pub stage: String,
    /// Region, informational only.
    pub region: String,
    /// First segment of every object key.
    pub deployment_prefix: String,
    /// Externally managed bucket. When unset the stack owns the bucket.
    pub deployment_bucket: Option<String>,
    /// Encryption for uploaded objects.
    pub server_side_encryption: Option<ServerSideEncryption>,
    /// Skip change detection and always deploy.
    pub force: bool,
    /// Write templates locally, make no mutating calls.
    pub dry_run: bool,
    /// Stream every stack event while monitoring.
    pub verbose: bool,
    /// User stack tags, merged over `STAGE`.
    pub stack_tags: BTreeMap<String, String>,
    pub stack_parameters: Vec<Parameter>,
    /// Service role the control plane assumes.
    pub role_arn: Option<String>,
    pub notification_arns: Vec<String>,
    /// Stack policy statements.
    pub stack_policy: Vec<serde_json::Value>,
    /// Temporary policy statements for the duration of an update.
    pub stack_policy_during_update: Vec<serde_json::Value>,
    pub rollback_configuration: Option<serde_json::Value>,
    /// Leave failed creates in place instead of rolling back.
    pub disable_rollback: bool,
    /// Deployments whose artifacts are always preserved.
    pub retention_count: usize,
    /// Delay between two monitor polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Templates larger than this go by URL.
    pub inline_template_limit: usize,
    /// Concurrent uploads and manifest fetches.
    pub upload_concurrency: usize,
    /// Store code artifacts under their content hash and share them.
    pub content_addressed_artifacts: bool,
    /// Local packaging directory.
    pub local_dir: PathBuf,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            service: String::new(),
            stage: "dev".to_string(),
            region: "us-east-1".to_string(),
            deployment_prefix: "serverless".to_string(),
            deployment_bucket: None,
            server_side_encryption: None,
            force: false,
            dry_run: false,
            verbose: false,
            stack_tags: BTreeMap::new(),
            stack_parameters: Vec::new(),
            role_arn: None,
            notification_arns: Vec::new(),
            stack_policy: Vec::new(),
            stack_policy_during_update: Vec::new(),
            rollback_configuration: None,
            disable_rollback: false,
            retention_count: DEFAULT_RETENTION_COUNT,
            poll_interval_ms: 5_000,
            inline_template_limit: DEFAULT_INLINE_TEMPLATE_LIMIT,
            upload_concurrency: 8,
            content_addressed_artifacts: false,
            local_dir: PathBuf::from(".serverless"),
        }
    }
}

impl DeployConfig {
    pub fn new(service: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            stage: stage.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document. Missing keys take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, DeployError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| DeployError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        if self.service.trim().is_empty() {
            return Err(DeployError::Config("service name is required".into()));
        }
        if self.stage.trim().is_empty() {
            return Err(DeployError::Config("stage is required".into()));
        }
        if self.retention_count == 0 {
            return Err(DeployError::Config(
                "retentionCount must be at least 1".into(),
            ));
        }
        if self.upload_concurrency == 0 {
            return Err(DeployError::Config(
                "uploadConcurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.deployment_bucket = Some(bucket.into());
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.stack_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_retention(mut self, count: usize) -> Self {
        self.retention_count = count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_dir = dir.into();
        self
    }

    pub fn with_content_addressed_artifacts(mut self, enabled: bool) -> Self {
        self.content_addressed_artifacts = enabled;
        self
    }

    /// Stack name: `<service>-<stage>`.
    pub fn stack_name(&self) -> String {
        format!("{}-{}", self.service, self.stage)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn on_failure(&self) -> OnFailure {
        if self.disable_rollback {
            OnFailure::DoNothing
        } else {
            OnFailure::Rollback
        }
    }

    /// The bucket is owned by someone else.
    pub fn is_external_bucket(&self) -> bool {
        self.deployment_bucket.is_some()
    }
}
