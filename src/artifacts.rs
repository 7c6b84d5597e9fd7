//! Artifact store: the deployment bucket and everything uploaded to it.
//!
//! Knows the key layout, validates the bucket, prepares a deployment by
//! binding storage keys into the template, and uploads the result.
//! Never touches the control plane.

use crate::backend::BlobBackend;
use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::hashing::{sha256_base64, sha256_hex, HASH_METADATA_KEY};
use crate::manifest::normalize::normalized_hash;
use crate::manifest::DeploymentManifest;
use crate::naming::Namespace;
use crate::types::{ObjectHead, ObjectSummary, PutObject};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

const TEMPLATE_CONTENT_TYPE: &str = "application/json";
const ZIP_CONTENT_TYPE: &str = "application/zip";

/// A built code package, read from the local packaging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeArtifact {
    /// File name, e.g. `hello.zip`.
    pub name: String,
    pub bytes: Vec<u8>,
    /// Base64 SHA-256 of `bytes`.
    pub hash: String,
}

impl CodeArtifact {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            hash: sha256_base64(&bytes),
            bytes,
        }
    }
}

/// The code artifacts of one build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactBundle {
    pub code: Vec<CodeArtifact>,
}

impl ArtifactBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.code.push(CodeArtifact::new(name, bytes));
        self
    }

    /// Load every `*.zip` file of a packaging directory, sorted by name.
    #[cfg(feature = "file-storage")]
    pub async fn from_dir(dir: impl AsRef<std::path::Path>) -> Result<Self, DeployError> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            DeployError::Storage(format!("failed to read {}: {}", dir.display(), e))
        })?;

        let mut paths = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DeployError::Storage(format!("failed to read dir entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "zip") {
                paths.insert(path);
            }
        }

        let mut bundle = Self::new();
        for path in paths {
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                DeployError::Storage(format!("failed to read {}: {}", path.display(), e))
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            bundle.code.push(CodeArtifact::new(name, bytes));
        }
        Ok(bundle)
    }

    pub fn get(&self, name: &str) -> Option<&CodeArtifact> {
        self.code.iter().find(|a| a.name == name)
    }
}

/// A code artifact with its final storage key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedArtifact {
    pub name: String,
    pub key: String,
    pub hash: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// Everything one deployment uploads, keys and hashes computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedDeployment {
    /// Timestamped deployment directory.
    pub directory: String,
    pub template_key: String,
    /// Template with storage keys bound in.
    pub template: Value,
    /// Serialized template, as uploaded.
    pub template_body: String,
    /// Hash of the normalized template.
    pub template_hash: String,
    pub artifacts: Vec<PreparedArtifact>,
}

impl PreparedDeployment {
    /// Hashes of everything this build would upload. Identical artifacts
    /// collapse into one entry.
    pub fn local_hashes(&self) -> BTreeSet<String> {
        std::iter::once(self.template_hash.clone())
            .chain(self.artifacts.iter().map(|a| a.hash.clone()))
            .collect()
    }
}

/// Where deployments are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentBucket {
    pub name: String,
    /// Managed outside the stack.
    pub external: bool,
}

pub struct ArtifactStore<'a, B: BlobBackend> {
    blobs: &'a B,
    config: &'a DeployConfig,
    namespace: Namespace,
}

impl<'a, B: BlobBackend> ArtifactStore<'a, B> {
    pub fn new(blobs: &'a B, config: &'a DeployConfig) -> Self {
        Self {
            blobs,
            config,
            namespace: Namespace::from_config(config),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Resolve and validate the deployment bucket.
    ///
    /// A configured bucket wins. Otherwise `discovered` is the bucket the
    /// stack owns. Neither is a configuration error.
    pub async fn ensure_bucket(
        &self,
        discovered: Option<&str>,
    ) -> Result<DeploymentBucket, DeployError> {
        let bucket = match (&self.config.deployment_bucket, discovered) {
            (Some(name), _) => DeploymentBucket {
                name: name.clone(),
                external: true,
            },
            (None, Some(name)) => DeploymentBucket {
                name: name.to_string(),
                external: false,
            },
            (None, None) => {
                return Err(DeployError::Config(format!(
                    "could not resolve the deployment bucket of stack \"{}\"; \
                     configure deploymentBucket or deploy the stack first",
                    self.config.stack_name()
                )))
            }
        };

        self.blobs.head_bucket(&bucket.name).await.map_err(|e| match e {
            DeployError::Provider(ref err) if err.is_forbidden() => DeployError::Config(format!(
                "not authorized to access deployment bucket \"{}\": {}",
                bucket.name, err
            )),
            DeployError::Provider(ref err) if err.is_not_found() || err.is_bucket_missing() => {
                DeployError::Config(format!(
                    "deployment bucket \"{}\" does not exist",
                    bucket.name
                ))
            }
            other => other,
        })?;

        debug!(bucket = %bucket.name, external = bucket.external, "deployment bucket resolved");
        Ok(bucket)
    }

    /// Compute keys, bind them into the template and hash everything.
    pub fn prepare(
        &self,
        manifest: &DeploymentManifest,
        bundle: &ArtifactBundle,
        directory: &str,
    ) -> Result<PreparedDeployment, DeployError> {
        let artifacts: Vec<PreparedArtifact> = bundle
            .code
            .iter()
            .map(|artifact| PreparedArtifact {
                name: artifact.name.clone(),
                key: self.artifact_key(directory, artifact),
                hash: artifact.hash.clone(),
                bytes: artifact.bytes.clone(),
            })
            .collect();

        let keys: BTreeMap<String, String> = artifacts
            .iter()
            .map(|a| (a.name.clone(), a.key.clone()))
            .collect();
        let template = manifest.bind(&keys)?;
        let template_body = serde_json::to_string(&template)
            .map_err(|e| DeployError::Manifest(format!("json error: {}", e)))?;
        let template_hash = normalized_hash(&template)?;

        Ok(PreparedDeployment {
            directory: directory.to_string(),
            template_key: self.namespace.manifest_key(directory),
            template,
            template_body,
            template_hash,
            artifacts,
        })
    }

    fn artifact_key(&self, directory: &str, artifact: &CodeArtifact) -> String {
        if self.config.content_addressed_artifacts {
            self.namespace
                .content_addressed_key(&sha256_hex(&artifact.bytes))
        } else {
            self.namespace.artifact_key(directory, &artifact.name)
        }
    }

    /// Upload the compiled template.
    pub async fn upload_manifest(
        &self,
        bucket: &DeploymentBucket,
        prepared: &PreparedDeployment,
    ) -> Result<String, DeployError> {
        self.put(
            bucket,
            &prepared.template_key,
            prepared.template_body.as_bytes().to_vec(),
            TEMPLATE_CONTENT_TYPE,
            &prepared.template_hash,
        )
        .await?;
        Ok(prepared.template_key.clone())
    }

    /// Upload one code artifact. Content-addressed artifacts already in
    /// the bucket are not uploaded again.
    pub async fn upload_artifact(
        &self,
        bucket: &DeploymentBucket,
        artifact: &PreparedArtifact,
    ) -> Result<String, DeployError> {
        if self.config.content_addressed_artifacts {
            if let Some(head) = self.head(bucket, &artifact.key).await? {
                if head.metadata.get(HASH_METADATA_KEY) == Some(&artifact.hash) {
                    debug!(key = %artifact.key, "artifact already stored");
                    return Ok(artifact.key.clone());
                }
            }
        }

        self.put(
            bucket,
            &artifact.key,
            artifact.bytes.clone(),
            ZIP_CONTENT_TYPE,
            &artifact.hash,
        )
        .await?;
        Ok(artifact.key.clone())
    }

    /// Upload code artifacts concurrently, then the template that
    /// references them. Returns every key written.
    pub async fn upload_bundle(
        &self,
        bucket: &DeploymentBucket,
        prepared: &PreparedDeployment,
    ) -> Result<Vec<String>, DeployError> {
        let mut keys: Vec<String> = futures::stream::iter(&prepared.artifacts)
            .map(|artifact| self.upload_artifact(bucket, artifact))
            .buffer_unordered(self.config.upload_concurrency.max(1))
            .try_collect()
            .await?;
        keys.sort();
        keys.dedup();

        keys.push(self.upload_manifest(bucket, prepared).await?);
        info!(
            bucket = %bucket.name,
            directory = %prepared.directory,
            objects = keys.len(),
            "artifacts uploaded"
        );
        Ok(keys)
    }

    /// URL the control plane reads the uploaded template from.
    pub fn template_url(&self, bucket: &DeploymentBucket, prepared: &PreparedDeployment) -> String {
        self.blobs.object_url(&bucket.name, &prepared.template_key)
    }

    /// Objects under `prefix`, ascending by key.
    pub async fn list(
        &self,
        bucket: &DeploymentBucket,
        prefix: &str,
    ) -> Result<Vec<ObjectSummary>, DeployError> {
        let mut objects = self
            .blobs
            .list_objects(&bucket.name, prefix)
            .await
            .map_err(|e| match e {
                DeployError::Provider(ref err) if err.is_bucket_missing() => {
                    DeployError::Config(format!(
                        "The deployment bucket \"{}\" does not exist. Create it manually if you \
                         want to reuse the stack \"{}\", or delete the stack if it is no longer \
                         required.",
                        bucket.name,
                        self.config.stack_name()
                    ))
                }
                other => other,
            })?;
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    /// Everything under this service stage.
    pub async fn list_namespace(
        &self,
        bucket: &DeploymentBucket,
    ) -> Result<Vec<ObjectSummary>, DeployError> {
        self.list(bucket, &self.namespace.list_prefix()).await
    }

    /// Object metadata, `None` when the object is gone.
    pub async fn head(
        &self,
        bucket: &DeploymentBucket,
        key: &str,
    ) -> Result<Option<ObjectHead>, DeployError> {
        match self.blobs.head_object(&bucket.name, key).await {
            Ok(head) => Ok(Some(head)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(DeployError::Provider(err)) if err.is_forbidden() => Err(DeployError::Config(
                "Could not access objects in the deployment bucket. Make sure you have \
                 sufficient permissions to access it."
                    .into(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Parse a stored template, `None` when the object is gone.
    pub async fn fetch_manifest(
        &self,
        bucket: &DeploymentBucket,
        key: &str,
    ) -> Result<Option<Value>, DeployError> {
        let bytes = match self.blobs.get_object(&bucket.name, key).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| DeployError::Manifest(format!("{}: {}", key, e)))
    }

    /// Delete keys in provider-sized batches.
    pub async fn delete(
        &self,
        bucket: &DeploymentBucket,
        keys: &[String],
    ) -> Result<(), DeployError> {
        const MAX_BATCH: usize = 1_000;
        for batch in keys.chunks(MAX_BATCH) {
            self.blobs.delete_objects(&bucket.name, batch).await?;
        }
        Ok(())
    }

    async fn put(
        &self,
        bucket: &DeploymentBucket,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        hash: &str,
    ) -> Result<(), DeployError> {
        if self.config.dry_run {
            info!(bucket = %bucket.name, key, "dry run: skipping upload");
            return Ok(());
        }
        debug!(bucket = %bucket.name, key, bytes = body.len(), "uploading");
        self.blobs
            .put_object(PutObject {
                bucket: bucket.name.clone(),
                key: key.to_string(),
                body,
                content_type: content_type.to_string(),
                metadata: BTreeMap::from([(HASH_METADATA_KEY.to_string(), hash.to_string())]),
                encryption: self.config.server_side_encryption.clone(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;
    use crate::types::ServerSideEncryption;
    use serde_json::json;

    const DIR: &str = "1700000000000-2023-11-14T22:13:20.000Z";

    fn manifest() -> DeploymentManifest {
        DeploymentManifest::new(json!({
            "Resources": {
                "HelloLambdaFunction": { "Type": "AWS::Lambda::Function", "Properties": {} }
            }
        }))
        .with_artifact("HelloLambdaFunction", "hello.zip")
    }

    fn bundle() -> ArtifactBundle {
        ArtifactBundle::new().with_artifact("hello.zip", b"hello-code".to_vec())
    }

    #[tokio::test]
    async fn test_ensure_bucket_prefers_configured() {
        let blobs = MemoryBlobStore::new().with_bucket("mine");
        let config = DeployConfig::new("svc", "dev").with_bucket("mine");
        let store = ArtifactStore::new(&blobs, &config);

        let bucket = store.ensure_bucket(Some("stack-owned")).await.unwrap();
        assert_eq!(bucket.name, "mine");
        assert!(bucket.external);
    }

    #[tokio::test]
    async fn test_ensure_bucket_unresolvable() {
        let blobs = MemoryBlobStore::new();
        let config = DeployConfig::new("svc", "dev");
        let store = ArtifactStore::new(&blobs, &config);

        let err = store.ensure_bucket(None).await.unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[tokio::test]
    async fn test_ensure_bucket_missing_or_forbidden() {
        let blobs = MemoryBlobStore::new().with_bucket("locked");
        blobs.deny_bucket("locked");
        let config = DeployConfig::new("svc", "dev");
        let store = ArtifactStore::new(&blobs, &config);

        let err = store.ensure_bucket(Some("locked")).await.unwrap_err();
        assert!(err.to_string().contains("not authorized"));

        let err = store.ensure_bucket(Some("gone")).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_upload_bundle_writes_hash_metadata() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        let mut config = DeployConfig::new("svc", "dev");
        config.server_side_encryption = Some(ServerSideEncryption::Aes256);
        let store = ArtifactStore::new(&blobs, &config);
        let bucket = store.ensure_bucket(Some("b")).await.unwrap();

        let prepared = store.prepare(&manifest(), &bundle(), DIR).unwrap();
        let keys = store.upload_bundle(&bucket, &prepared).await.unwrap();

        let artifact_key = format!("serverless/svc/dev/{}/hello.zip", DIR);
        assert_eq!(keys, vec![artifact_key.clone(), prepared.template_key.clone()]);

        let stored = blobs.object("b", &artifact_key).unwrap();
        assert_eq!(stored.content_type, "application/zip");
        assert_eq!(stored.encryption, Some(ServerSideEncryption::Aes256));
        assert_eq!(
            stored.metadata.get(HASH_METADATA_KEY),
            Some(&sha256_base64(b"hello-code"))
        );

        let template = blobs.object("b", &prepared.template_key).unwrap();
        assert_eq!(template.content_type, "application/json");
        assert_eq!(
            template.metadata.get(HASH_METADATA_KEY),
            Some(&prepared.template_hash)
        );
        let parsed: Value = serde_json::from_slice(&template.body).unwrap();
        assert_eq!(
            parsed["Resources"]["HelloLambdaFunction"]["Properties"]["Code"]["S3Key"],
            artifact_key.as_str()
        );
    }

    #[tokio::test]
    async fn test_content_addressed_upload_skips_existing() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        let config = DeployConfig::new("svc", "dev").with_content_addressed_artifacts(true);
        let store = ArtifactStore::new(&blobs, &config);
        let bucket = store.ensure_bucket(Some("b")).await.unwrap();

        let first = store.prepare(&manifest(), &bundle(), DIR).unwrap();
        assert!(first.artifacts[0].key.starts_with("serverless/svc/dev/code-artifacts/"));
        store.upload_bundle(&bucket, &first).await.unwrap();
        let puts_after_first = blobs.put_count();

        let second = store
            .prepare(&manifest(), &bundle(), "1800000000000-2027-01-15T08:00:00.000Z")
            .unwrap();
        assert_eq!(first.artifacts[0].key, second.artifacts[0].key);
        store.upload_bundle(&bucket, &second).await.unwrap();

        // only the new template
        assert_eq!(blobs.put_count(), puts_after_first + 1);
    }

    #[tokio::test]
    async fn test_dry_run_uploads_nothing() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        let config = DeployConfig::new("svc", "dev").with_dry_run(true);
        let store = ArtifactStore::new(&blobs, &config);
        let bucket = store.ensure_bucket(Some("b")).await.unwrap();

        let prepared = store.prepare(&manifest(), &bundle(), DIR).unwrap();
        let keys = store.upload_bundle(&bucket, &prepared).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(blobs.put_count(), 0);
    }

    #[test]
    fn test_local_hashes_collapse_duplicates() {
        let blobs = MemoryBlobStore::new();
        let config = DeployConfig::new("svc", "dev");
        let store = ArtifactStore::new(&blobs, &config);
        let manifest = DeploymentManifest::new(json!({ "Resources": {} }));
        let bundle = ArtifactBundle::new()
            .with_artifact("a.zip", b"same".to_vec())
            .with_artifact("b.zip", b"same".to_vec());

        let prepared = store.prepare(&manifest, &bundle, DIR).unwrap();
        assert_eq!(prepared.local_hashes().len(), 2);
    }

    #[cfg(feature = "file-storage")]
    #[tokio::test]
    async fn test_bundle_from_dir_reads_zip_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.zip"), b"bee").unwrap();
        std::fs::write(dir.path().join("a.zip"), b"ay").unwrap();
        std::fs::write(dir.path().join("state.json"), b"{}").unwrap();

        let bundle = ArtifactBundle::from_dir(dir.path()).await.unwrap();
        let names: Vec<_> = bundle.code.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a.zip", "b.zip"]);
        assert_eq!(bundle.get("a.zip").unwrap().hash, sha256_base64(b"ay"));
    }
}
