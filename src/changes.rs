//! Change detection.
//!
//! Compares the content hashes recorded on the most recent remote
//! deployment with the hashes of the local build. Skipping is only
//! allowed when every remote hash is present locally.

use crate::artifacts::{ArtifactStore, DeploymentBucket, PreparedDeployment};
use crate::backend::BlobBackend;
use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::hashing::HASH_METADATA_KEY;
use crate::naming::directory_timestamp;
use crate::types::ObjectSummary;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDecision {
    pub should_deploy: bool,
    pub reason: String,
}

impl ChangeDecision {
    pub fn deploy(reason: impl Into<String>) -> Self {
        Self {
            should_deploy: true,
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            should_deploy: false,
            reason: reason.into(),
        }
    }
}

/// Pure comparison of remote and local hash sets.
///
/// An empty remote set never allows a skip: nothing proves the remote
/// state matches.
pub fn compare(remote: &BTreeSet<String>, local: &BTreeSet<String>) -> ChangeDecision {
    if remote.is_empty() {
        return ChangeDecision::deploy("no hashes recorded on the previous deployment");
    }
    match remote.difference(local).count() {
        0 => ChangeDecision::skip("service files not changed"),
        n => ChangeDecision::deploy(format!("{} remote object(s) differ from the local build", n)),
    }
}

pub struct ChangeDetector<'a, B: BlobBackend> {
    store: &'a ArtifactStore<'a, B>,
    config: &'a DeployConfig,
}

impl<'a, B: BlobBackend> ChangeDetector<'a, B> {
    pub fn new(store: &'a ArtifactStore<'a, B>, config: &'a DeployConfig) -> Self {
        Self { store, config }
    }

    /// Decide whether `prepared` needs deploying.
    ///
    /// Deploys when forced, when there is no bucket yet, or when there is
    /// no previous deployment. Missing bucket and access failures are
    /// configuration errors.
    pub async fn should_deploy(
        &self,
        bucket: Option<&DeploymentBucket>,
        prepared: &PreparedDeployment,
    ) -> Result<ChangeDecision, DeployError> {
        if self.config.force {
            return Ok(ChangeDecision::deploy("deployment forced"));
        }
        let Some(bucket) = bucket else {
            return Ok(ChangeDecision::deploy("no deployment bucket yet"));
        };

        let objects = self.most_recent_objects(bucket).await?;
        if objects.is_empty() {
            return Ok(ChangeDecision::deploy("no previous deployment"));
        }

        let remote = self.remote_hashes(bucket, &objects).await?;
        let local = prepared.local_hashes();
        let decision = compare(&remote, &local);
        debug!(
            remote = remote.len(),
            local = local.len(),
            should_deploy = decision.should_deploy,
            "compared deployment hashes"
        );
        Ok(decision)
    }

    /// Objects of the newest deployment directory.
    pub async fn most_recent_objects(
        &self,
        bucket: &DeploymentBucket,
    ) -> Result<Vec<ObjectSummary>, DeployError> {
        let namespace = self.store.namespace();
        let objects = self.store.list_namespace(bucket).await?;

        let newest = objects
            .iter()
            .filter_map(|o| namespace.directory_of(&o.key))
            .max_by_key(|dir| (directory_timestamp(dir).unwrap_or(0), dir.to_string()))
            .map(str::to_string);

        let Some(newest) = newest else {
            return Ok(Vec::new());
        };
        Ok(objects
            .into_iter()
            .filter(|o| namespace.directory_of(&o.key) == Some(newest.as_str()))
            .collect())
    }

    async fn remote_hashes(
        &self,
        bucket: &DeploymentBucket,
        objects: &[ObjectSummary],
    ) -> Result<BTreeSet<String>, DeployError> {
        let heads: Vec<_> = futures::stream::iter(objects)
            .map(|object| self.store.head(bucket, &object.key))
            .buffer_unordered(self.config.upload_concurrency.max(1))
            .try_collect()
            .await?;

        Ok(heads
            .into_iter()
            .flatten()
            .filter_map(|head| head.metadata.get(HASH_METADATA_KEY).cloned())
            .filter(|hash| !hash.is_empty())
            .collect())
    }
}
