//! Storage key layout and stack naming.
//!
//! Every deployment lives under
//! `<prefix>/<service>/<stage>/<epoch-ms>-<ISO-8601>/`. Content-addressed
//! code artifacts live next to the deployment directories under
//! `<prefix>/<service>/<stage>/code-artifacts/`.

use crate::config::DeployConfig;
use crate::error::DeployError;
use chrono::{DateTime, Utc};

/// Compiled template object inside a deployment directory.
pub const TEMPLATE_FILE_NAME: &str = "compiled-cloudformation-template.json";

/// Local copy of the template issued with a create.
pub const CREATE_TEMPLATE_FILE_NAME: &str = "cloudformation-template-create-stack.json";

/// Local copy of the template issued with an update.
pub const UPDATE_TEMPLATE_FILE_NAME: &str = "cloudformation-template-update-stack.json";

/// Logical id of the engine-owned bucket inside the stack.
pub const DEPLOYMENT_BUCKET_LOGICAL_ID: &str = "ServerlessDeploymentBucket";

/// Directory for shared, content-addressed code artifacts.
pub const CONTENT_ADDRESSED_DIR: &str = "code-artifacts";

const MAX_STACK_NAME_LEN: usize = 128;

/// Key namespace of one service stage inside the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: String,
}

impl Namespace {
    pub fn new(prefix: &str, service: &str, stage: &str) -> Self {
        Self {
            root: format!("{}/{}/{}", prefix, service, stage),
        }
    }

    pub fn from_config(config: &DeployConfig) -> Self {
        Self::new(&config.deployment_prefix, &config.service, &config.stage)
    }

    /// `<prefix>/<service>/<stage>`
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Listing prefix, with trailing slash.
    pub fn list_prefix(&self) -> String {
        format!("{}/", self.root)
    }

    pub fn directory_key(&self, directory: &str) -> String {
        format!("{}/{}", self.root, directory)
    }

    pub fn manifest_key(&self, directory: &str) -> String {
        format!("{}/{}/{}", self.root, directory, TEMPLATE_FILE_NAME)
    }

    pub fn artifact_key(&self, directory: &str, file_name: &str) -> String {
        format!("{}/{}/{}", self.root, directory, file_name)
    }

    pub fn content_addressed_key(&self, hex_digest: &str) -> String {
        format!("{}/{}/{}.zip", self.root, CONTENT_ADDRESSED_DIR, hex_digest)
    }

    /// Deployment directory a key lives in, if any.
    pub fn directory_of<'k>(&self, key: &'k str) -> Option<&'k str> {
        let rest = key.strip_prefix(&self.root)?.strip_prefix('/')?;
        let (directory, file) = rest.split_once('/')?;
        if file.is_empty() || !is_deployment_directory(directory) {
            return None;
        }
        Some(directory)
    }
}

/// Directory name for a deployment started at `now`.
pub fn deployment_directory(now: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        now.timestamp_millis(),
        now.format("%Y-%m-%dT%H:%M:%S%.3fZ")
    )
}

/// `<digits>-YYYY-MM-DDTHH:MM:SS...`
pub fn is_deployment_directory(token: &str) -> bool {
    let Some((millis, iso)) = token.split_once('-') else {
        return false;
    };
    if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let iso = iso.as_bytes();
    if iso.len() < 19 {
        return false;
    }
    const SHAPE: &[u8; 19] = b"dddd-dd-ddTdd:dd:dd";
    SHAPE.iter().zip(iso).all(|(expected, actual)| match expected {
        b'd' => actual.is_ascii_digit(),
        other => other == actual,
    })
}

/// Epoch milliseconds encoded at the start of a deployment directory.
pub fn directory_timestamp(token: &str) -> Option<u64> {
    token.split_once('-')?.0.parse().ok()
}

/// `^[A-Za-z][A-Za-z0-9-]*$`, at most 128 characters.
pub fn validate_stack_name(name: &str) -> Result<(), DeployError> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '-');

    if !valid_start || !valid_rest || name.len() > MAX_STACK_NAME_LEN {
        return Err(DeployError::Config(format!(
            "invalid stack name \"{}\": it must start with a letter, contain only \
             alphanumeric characters and hyphens, and be at most {} characters long",
            name, MAX_STACK_NAME_LEN
        )));
    }
    Ok(())
}
