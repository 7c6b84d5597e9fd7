//! Retention collector.
//!
//! Keeps the newest `retention_count` deployments and deletes the rest.
//! With content-addressed artifacts, several deployments can point at
//! the same object, so a key any retained deployment references is never
//! deleted, even if an expired deployment references it too. Only keys
//! found in this service stage's namespace listing are ever deleted.

use crate::artifacts::{ArtifactStore, DeploymentBucket};
use crate::backend::BlobBackend;
use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::manifest::referenced_artifact_keys;
use crate::naming::{directory_timestamp, Namespace};
use crate::types::ObjectSummary;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// One historical deployment as found in the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDeploymentRecord {
    pub directory: String,
    pub timestamp: u64,
    pub manifest_key: String,
    /// Keys stored in the deployment's own directory.
    pub object_keys: BTreeSet<String>,
    /// Keys its manifest points at, filled in by the collector.
    #[serde(default)]
    pub referenced_keys: BTreeSet<String>,
}

/// Group a namespace listing into records, newest first.
pub fn group_records(namespace: &Namespace, objects: &[ObjectSummary]) -> Vec<RemoteDeploymentRecord> {
    let mut by_directory: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for object in objects {
        if let Some(directory) = namespace.directory_of(&object.key) {
            by_directory
                .entry(directory)
                .or_default()
                .insert(object.key.clone());
        }
    }

    let mut records: Vec<RemoteDeploymentRecord> = by_directory
        .into_iter()
        .map(|(directory, object_keys)| RemoteDeploymentRecord {
            directory: directory.to_string(),
            timestamp: directory_timestamp(directory).unwrap_or(0),
            manifest_key: namespace.manifest_key(directory),
            object_keys,
            referenced_keys: BTreeSet::new(),
        })
        .collect();
    records.sort_by(|a, b| {
        (b.timestamp, &b.directory).cmp(&(a.timestamp, &a.directory))
    });
    records
}

/// What a reclaim pass decided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimPlan {
    /// Directories of the records that stay.
    pub retained: Vec<String>,
    /// Directories of the records that go.
    pub expired: Vec<String>,
    /// Keys to delete, ascending.
    pub keys: Vec<String>,
    /// Keys an expired record references but a retained one still needs.
    pub protected: Vec<String>,
}

pub struct RetentionCollector<'a, B: BlobBackend> {
    store: &'a ArtifactStore<'a, B>,
    config: &'a DeployConfig,
}

impl<'a, B: BlobBackend> RetentionCollector<'a, B> {
    pub fn new(store: &'a ArtifactStore<'a, B>, config: &'a DeployConfig) -> Self {
        Self { store, config }
    }

    /// Work out what to delete without deleting anything.
    ///
    /// Fails, and so deletes nothing, when a retained manifest cannot be
    /// read: without it there is no telling which shared keys are live.
    pub async fn plan(&self, bucket: &DeploymentBucket) -> Result<ReclaimPlan, DeployError> {
        let objects = self.store.list_namespace(bucket).await?;
        let records = group_records(self.store.namespace(), &objects);
        let keep = self.config.retention_count;
        if records.len() <= keep {
            debug!(records = records.len(), keep, "nothing to reclaim");
            return Ok(ReclaimPlan {
                retained: records.into_iter().map(|r| r.directory).collect(),
                ..ReclaimPlan::default()
            });
        }

        let listed: BTreeSet<&str> = objects.iter().map(|o| o.key.as_str()).collect();
        let records = self.with_references(bucket, records).await?;
        let (retained, expired) = records.split_at(keep);

        let live: BTreeSet<&String> = retained
            .iter()
            .flat_map(|r| r.object_keys.iter().chain(&r.referenced_keys))
            .collect();

        let mut keys = BTreeSet::new();
        let mut protected = BTreeSet::new();
        for record in expired {
            let candidates = record
                .object_keys
                .iter()
                .chain(
                    record
                        .referenced_keys
                        .iter()
                        .filter(|key| listed.contains(key.as_str())),
                )
                .chain(std::iter::once(&record.manifest_key));
            for key in candidates {
                if live.contains(key) {
                    protected.insert(key.clone());
                } else {
                    keys.insert(key.clone());
                }
            }
        }

        Ok(ReclaimPlan {
            retained: retained.iter().map(|r| r.directory.clone()).collect(),
            expired: expired.iter().map(|r| r.directory.clone()).collect(),
            keys: keys.into_iter().collect(),
            protected: protected.into_iter().collect(),
        })
    }

    /// Plan, then delete. In dry-run mode only the plan is returned.
    pub async fn reclaim(&self, bucket: &DeploymentBucket) -> Result<ReclaimPlan, DeployError> {
        let plan = self.plan(bucket).await?;
        if plan.keys.is_empty() {
            return Ok(plan);
        }
        if self.config.dry_run {
            info!(keys = plan.keys.len(), "dry run: skipping artifact cleanup");
            return Ok(plan);
        }

        self.store.delete(bucket, &plan.keys).await?;
        info!(
            bucket = %bucket.name,
            deployments = plan.expired.len(),
            keys = plan.keys.len(),
            protected = plan.protected.len(),
            "removed old deployment artifacts"
        );
        Ok(plan)
    }

    async fn with_references(
        &self,
        bucket: &DeploymentBucket,
        records: Vec<RemoteDeploymentRecord>,
    ) -> Result<Vec<RemoteDeploymentRecord>, DeployError> {
        futures::stream::iter(records)
            .map(|mut record| async move {
                let manifest = self.store.fetch_manifest(bucket, &record.manifest_key).await?;
                if let Some(manifest) = manifest {
                    record.referenced_keys = referenced_artifact_keys(&manifest, &bucket.name);
                }
                Ok::<_, DeployError>(record)
            })
            .buffered(self.config.upload_concurrency.max(1))
            .try_collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::memory::MemoryBlobStore;
    use serde_json::json;

    const NS: &str = "serverless/svc/dev";

    fn dir(n: u64) -> String {
        format!("{}-2024-01-0{}T00:00:00.000Z", 1_000 * n, n)
    }

    fn bucket() -> DeploymentBucket {
        DeploymentBucket {
            name: "b".into(),
            external: false,
        }
    }

    /// A deployment whose manifest points at `code_key`.
    fn seed_deployment(blobs: &MemoryBlobStore, n: u64, code_key: &str) {
        let manifest = json!({
            "Resources": {
                "Fn": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": { "Code": { "S3Key": code_key } }
                }
            }
        });
        blobs.seed(
            "b",
            &format!("{}/{}/compiled-cloudformation-template.json", NS, dir(n)),
            manifest.to_string(),
        );
    }

    fn seed_own_artifact(blobs: &MemoryBlobStore, n: u64) {
        let key = format!("{}/{}/fn.zip", NS, dir(n));
        blobs.seed("b", &key, format!("code {}", n));
        seed_deployment(blobs, n, &key);
    }

    #[test]
    fn test_group_records_newest_first() {
        let ns = Namespace::new("serverless", "svc", "dev");
        let objects: Vec<ObjectSummary> = [1, 3, 2]
            .iter()
            .map(|n| ObjectSummary {
                key: format!("{}/{}/fn.zip", NS, dir(*n)),
                size: 1,
            })
            .chain(std::iter::once(ObjectSummary {
                key: format!("{}/code-artifacts/abc.zip", NS),
                size: 1,
            }))
            .collect();

        let records = group_records(&ns, &objects);
        let dirs: Vec<_> = records.iter().map(|r| r.directory.clone()).collect();
        assert_eq!(dirs, vec![dir(3), dir(2), dir(1)]);
        assert_eq!(records[0].timestamp, 3_000);
    }

    #[tokio::test]
    async fn test_six_records_keep_five() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        for n in 1..=6 {
            seed_own_artifact(&blobs, n);
        }
        let config = DeployConfig::new("svc", "dev");
        let store = ArtifactStore::new(&blobs, &config);

        let plan = RetentionCollector::new(&store, &config)
            .reclaim(&bucket())
            .await
            .unwrap();

        assert_eq!(plan.expired, vec![dir(1)]);
        assert_eq!(
            plan.keys,
            vec![
                format!("{}/{}/compiled-cloudformation-template.json", NS, dir(1)),
                format!("{}/{}/fn.zip", NS, dir(1)),
            ]
        );
        assert_eq!(blobs.deleted_keys(), plan.keys);
        assert_eq!(blobs.keys("b").len(), 10);
        assert_eq!(blobs.calls().iter().filter(|c| **c == "delete_objects").count(), 1);
    }

    #[tokio::test]
    async fn test_within_retention_deletes_nothing() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        for n in 1..=3 {
            seed_own_artifact(&blobs, n);
        }
        let config = DeployConfig::new("svc", "dev");
        let store = ArtifactStore::new(&blobs, &config);

        let plan = RetentionCollector::new(&store, &config)
            .reclaim(&bucket())
            .await
            .unwrap();
        assert!(plan.keys.is_empty());
        assert_eq!(plan.retained.len(), 3);
        assert_eq!(blobs.mutating_calls(), 0);
        assert!(!blobs.calls().contains(&"get_object"));
    }

    #[tokio::test]
    async fn test_shared_artifact_survives_while_referenced() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        let shared = format!("{}/code-artifacts/aaaa.zip", NS);
        let gone = format!("{}/code-artifacts/bbbb.zip", NS);
        blobs.seed("b", &shared, "shared");
        blobs.seed("b", &gone, "gone");
        seed_deployment(&blobs, 1, &gone);
        seed_deployment(&blobs, 2, &shared);
        seed_deployment(&blobs, 3, &shared);

        let config = DeployConfig::new("svc", "dev").with_retention(1);
        let store = ArtifactStore::new(&blobs, &config);
        let plan = RetentionCollector::new(&store, &config)
            .reclaim(&bucket())
            .await
            .unwrap();

        assert!(plan.keys.contains(&gone));
        assert!(!plan.keys.contains(&shared));
        assert_eq!(plan.protected, vec![shared.clone()]);
        assert!(blobs.object("b", &shared).is_some());
        assert!(blobs.object("b", &gone).is_none());
    }

    #[tokio::test]
    async fn test_keys_outside_namespace_are_never_deleted() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        let other_service = "serverless/other/dev/1000-2024-01-01T00:00:00.000Z/lib.zip";
        let foreign = format!("{}/code-artifacts/cccc.zip", NS);
        blobs.seed("b", other_service, "other");
        blobs.seed("b", &foreign, "same key, other bucket");
        let manifest = json!({
            "Resources": {
                "Lib": {
                    "Type": "AWS::Lambda::LayerVersion",
                    "Properties": { "Content": { "S3Bucket": "b", "S3Key": other_service } }
                },
                "Fn": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": { "Code": { "S3Bucket": "someone-elses-bucket", "S3Key": foreign } }
                }
            }
        });
        blobs.seed(
            "b",
            &format!("{}/{}/compiled-cloudformation-template.json", NS, dir(1)),
            manifest.to_string(),
        );
        seed_own_artifact(&blobs, 2);

        let config = DeployConfig::new("svc", "dev").with_retention(1);
        let store = ArtifactStore::new(&blobs, &config);
        let plan = RetentionCollector::new(&store, &config)
            .reclaim(&bucket())
            .await
            .unwrap();

        assert_eq!(
            plan.keys,
            vec![format!("{}/{}/compiled-cloudformation-template.json", NS, dir(1))]
        );
        assert!(blobs.object("b", other_service).is_some());
        assert!(blobs.object("b", &foreign).is_some());
    }

    #[tokio::test]
    async fn test_unreadable_retained_manifest_aborts() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        for n in 1..=3 {
            seed_own_artifact(&blobs, n);
        }
        blobs.seed(
            "b",
            &format!("{}/{}/compiled-cloudformation-template.json", NS, dir(3)),
            "not json",
        );
        let config = DeployConfig::new("svc", "dev").with_retention(2);
        let store = ArtifactStore::new(&blobs, &config);

        let err = RetentionCollector::new(&store, &config)
            .reclaim(&bucket())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Manifest(_)));
        assert_eq!(blobs.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_aborts() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        for n in 1..=3 {
            seed_own_artifact(&blobs, n);
        }
        blobs.fail_on("get_object", ProviderError::new("InternalError").with_status(500));
        let config = DeployConfig::new("svc", "dev").with_retention(1);
        let store = ArtifactStore::new(&blobs, &config);

        assert!(RetentionCollector::new(&store, &config)
            .reclaim(&bucket())
            .await
            .is_err());
        assert_eq!(blobs.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_plans_only() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        for n in 1..=3 {
            seed_own_artifact(&blobs, n);
        }
        let config = DeployConfig::new("svc", "dev")
            .with_retention(1)
            .with_dry_run(true);
        let store = ArtifactStore::new(&blobs, &config);

        let plan = RetentionCollector::new(&store, &config)
            .reclaim(&bucket())
            .await
            .unwrap();
        assert_eq!(plan.expired.len(), 2);
        assert_eq!(plan.keys.len(), 4);
        assert_eq!(blobs.mutating_calls(), 0);
    }
}
