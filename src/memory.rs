//! In-memory backends.
//!
//! Deterministic stand-ins for the control plane and the object store.
//! Both record every call, accept injected provider errors per
//! operation, and answer with the provider's own messages so the engine
//! sees the same shapes it sees in production.

use crate::backend::{BlobBackend, StackBackend};
use crate::error::{DeployError, ProviderError};
use crate::hashing::{sha256_base64, HASH_METADATA_KEY};
use crate::naming::DEPLOYMENT_BUCKET_LOGICAL_ID;
use crate::types::*;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Name of the bucket a stack creates for itself in [`MemoryStackBackend`].
pub fn owned_bucket_name(stack_name: &str) -> String {
    format!("{}-serverlessdeploymentbucket", stack_name.to_lowercase())
}

/// Stack-level event.
pub fn stack_event(stack_name: &str, status: &str) -> StackEvent {
    resource_event(stack_name, stack_name, STACK_RESOURCE_TYPE, status, None)
}

/// Event about one resource of `stack_name`.
pub fn resource_event(
    stack_name: &str,
    logical_id: &str,
    resource_type: &str,
    status: &str,
    reason: Option<&str>,
) -> StackEvent {
    StackEvent {
        event_id: format!("event-{}", NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)),
        stack_name: stack_name.to_string(),
        logical_resource_id: logical_id.to_string(),
        resource_type: resource_type.to_string(),
        resource_status: status.to_string(),
        resource_status_reason: reason.map(String::from),
        timestamp: Utc::now().to_rfc3339(),
    }
}

// ═══════════════════════════════════════════════════════════════
// CONTROL PLANE
// ═══════════════════════════════════════════════════════════════

#[derive(Debug)]
struct StackRecord {
    description: StackDescription,
    template: TemplateSource,
    resources: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct EventLog {
    history: Vec<StackEvent>,
    pending: VecDeque<Vec<StackEvent>>,
}

#[derive(Debug, Default)]
struct StackInner {
    stacks: BTreeMap<String, StackRecord>,
    events: HashMap<String, EventLog>,
    failures: HashMap<&'static str, VecDeque<ProviderError>>,
    calls: Vec<&'static str>,
    creates: Vec<CreateStackRequest>,
    updates: Vec<UpdateStackRequest>,
    manual_events: bool,
    next_stack: u64,
}

impl StackInner {
    fn call(&mut self, op: &'static str) -> Result<(), DeployError> {
        self.calls.push(op);
        match self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(DeployError::Provider(err)),
            None => Ok(()),
        }
    }

    fn stack_id_of(&self, name_or_id: &str) -> Option<String> {
        self.stacks
            .values()
            .find(|r| r.description.stack_name == name_or_id || r.description.stack_id == name_or_id)
            .map(|r| r.description.stack_id.clone())
    }

    fn record_mut(&mut self, name_or_id: &str) -> Option<&mut StackRecord> {
        self.stacks.values_mut().find(|r| {
            r.description.stack_name == name_or_id || r.description.stack_id == name_or_id
        })
    }

    /// Queue the usual two pages of an operation unless events are scripted.
    fn progress(&mut self, stack_id: &str, stack_name: &str, kind: OperationKind) {
        if self.manual_events {
            return;
        }
        let (running, done) = match kind {
            OperationKind::Create => ("CREATE_IN_PROGRESS", "CREATE_COMPLETE"),
            OperationKind::Update => ("UPDATE_IN_PROGRESS", "UPDATE_COMPLETE"),
            OperationKind::Removal => ("DELETE_IN_PROGRESS", "DELETE_COMPLETE"),
        };
        let log = self.events.entry(stack_id.to_string()).or_default();
        log.pending.push_back(vec![stack_event(stack_name, running)]);
        log.pending.push_back(vec![stack_event(stack_name, done)]);
    }

    fn apply_page(&mut self, page: &[StackEvent]) {
        for event in page {
            if !event.is_stack_event(&event.stack_name) {
                continue;
            }
            let status = event.status();
            if status == StackStatus::DeleteComplete {
                self.stacks.remove(&event.stack_name);
            } else if let Some(record) = self.stacks.get_mut(&event.stack_name) {
                record.description.status = status;
            }
        }
    }
}

fn stack_missing(name: &str) -> DeployError {
    DeployError::Provider(
        ProviderError::new(format!("Stack with id {} does not exist", name))
            .with_code("ValidationError")
            .with_status(400),
    )
}

/// Control plane held in memory.
///
/// Creates, updates and removals queue an in-progress page and a
/// completion page of stack events; each `describe_stack_events` call
/// releases one page. [`MemoryStackBackend::with_manual_events`] turns
/// that off so tests can script every page themselves.
#[derive(Debug, Default)]
pub struct MemoryStackBackend {
    inner: Mutex<StackInner>,
}

impl MemoryStackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manual_events(self) -> Self {
        lock(&self.inner).manual_events = true;
        self
    }

    /// Seed an existing stack. Its id is `<name>-id`.
    pub fn with_stack(self, name: &str, status: StackStatus) -> Self {
        lock(&self.inner).stacks.insert(
            name.to_string(),
            StackRecord {
                description: StackDescription {
                    stack_name: name.to_string(),
                    stack_id: format!("{}-id", name),
                    status,
                    outputs: BTreeMap::new(),
                },
                template: TemplateSource::Body(String::new()),
                resources: BTreeMap::new(),
            },
        );
        self
    }

    pub fn with_resource(self, stack: &str, logical_id: &str, physical_id: &str) -> Self {
        if let Some(record) = lock(&self.inner).stacks.get_mut(stack) {
            record
                .resources
                .insert(logical_id.to_string(), physical_id.to_string());
        }
        self
    }

    pub fn with_output(self, stack: &str, key: &str, value: &str) -> Self {
        if let Some(record) = lock(&self.inner).stacks.get_mut(stack) {
            record
                .description
                .outputs
                .insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Queue a page of events for `stack_id`.
    pub fn push_events(&self, stack_id: &str, page: Vec<StackEvent>) {
        lock(&self.inner)
            .events
            .entry(stack_id.to_string())
            .or_default()
            .pending
            .push_back(page);
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_on(&self, op: &'static str, err: ProviderError) {
        lock(&self.inner)
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.inner).calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        lock(&self.inner).calls.iter().filter(|c| **c == op).count()
    }

    /// Creates, updates and deletes issued so far.
    pub fn mutating_calls(&self) -> usize {
        lock(&self.inner)
            .calls
            .iter()
            .filter(|c| matches!(**c, "create_stack" | "update_stack" | "delete_stack"))
            .count()
    }

    pub fn creates(&self) -> Vec<CreateStackRequest> {
        lock(&self.inner).creates.clone()
    }

    pub fn updates(&self) -> Vec<UpdateStackRequest> {
        lock(&self.inner).updates.clone()
    }

    pub fn status(&self, stack: &str) -> Option<StackStatus> {
        lock(&self.inner)
            .stacks
            .get(stack)
            .map(|r| r.description.status.clone())
    }
}

fn owns_bucket(template: &TemplateSource) -> bool {
    let TemplateSource::Body(body) = template else {
        return false;
    };
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|t| t.get("Resources")?.get(DEPLOYMENT_BUCKET_LOGICAL_ID).cloned())
        .is_some()
}

impl StackBackend for MemoryStackBackend {
    async fn describe_stack(&self, stack_name: &str) -> Result<StackDescription, DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("describe_stack")?;
        inner
            .record_mut(stack_name)
            .map(|r| r.description.clone())
            .ok_or_else(|| stack_missing(stack_name))
    }

    async fn describe_stack_resource(
        &self,
        stack_name: &str,
        logical_resource_id: &str,
    ) -> Result<StackResourceDetail, DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("describe_stack_resource")?;
        let record = inner
            .record_mut(stack_name)
            .ok_or_else(|| stack_missing(stack_name))?;
        let physical = record.resources.get(logical_resource_id).ok_or_else(|| {
            DeployError::Provider(ProviderError::new(format!(
                "Resource {} does not exist for stack {}",
                logical_resource_id, stack_name
            )))
        })?;
        Ok(StackResourceDetail {
            logical_resource_id: logical_resource_id.to_string(),
            physical_resource_id: physical.clone(),
            resource_type: "AWS::S3::Bucket".to_string(),
        })
    }

    async fn create_stack(&self, request: &CreateStackRequest) -> Result<String, DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("create_stack")?;
        inner.creates.push(request.clone());
        if inner.stacks.contains_key(&request.stack_name) {
            return Err(DeployError::Provider(
                ProviderError::new(format!("Stack [{}] already exists", request.stack_name))
                    .with_code("AlreadyExistsException"),
            ));
        }

        inner.next_stack += 1;
        let stack_id = format!("{}-{}", request.stack_name, inner.next_stack);
        let mut resources = BTreeMap::new();
        if owns_bucket(&request.template) {
            resources.insert(
                DEPLOYMENT_BUCKET_LOGICAL_ID.to_string(),
                owned_bucket_name(&request.stack_name),
            );
        }
        inner.stacks.insert(
            request.stack_name.clone(),
            StackRecord {
                description: StackDescription {
                    stack_name: request.stack_name.clone(),
                    stack_id: stack_id.clone(),
                    status: StackStatus::CreateInProgress,
                    outputs: BTreeMap::new(),
                },
                template: request.template.clone(),
                resources,
            },
        );
        inner.progress(&stack_id, &request.stack_name, OperationKind::Create);
        Ok(stack_id)
    }

    async fn update_stack(&self, request: &UpdateStackRequest) -> Result<String, DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("update_stack")?;
        inner.updates.push(request.clone());
        let record = inner
            .record_mut(&request.stack_name)
            .ok_or_else(|| stack_missing(&request.stack_name))?;
        if record.template == request.template {
            return Err(DeployError::Provider(
                ProviderError::new("No updates are to be performed.").with_code("ValidationError"),
            ));
        }

        record.template = request.template.clone();
        record.description.status = StackStatus::UpdateInProgress;
        if owns_bucket(&request.template) {
            record
                .resources
                .entry(DEPLOYMENT_BUCKET_LOGICAL_ID.to_string())
                .or_insert_with(|| owned_bucket_name(&request.stack_name));
        }
        let stack_id = record.description.stack_id.clone();
        inner.progress(&stack_id, &request.stack_name, OperationKind::Update);
        Ok(stack_id)
    }

    async fn delete_stack(&self, stack_name: &str) -> Result<(), DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("delete_stack")?;
        let stack_id = inner
            .stack_id_of(stack_name)
            .ok_or_else(|| stack_missing(stack_name))?;
        if let Some(record) = inner.record_mut(stack_name) {
            record.description.status = StackStatus::DeleteInProgress;
        }
        inner.progress(&stack_id, stack_name, OperationKind::Removal);
        Ok(())
    }

    async fn describe_stack_events(&self, stack: &str) -> Result<Vec<StackEvent>, DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("describe_stack_events")?;
        let exists = inner.stack_id_of(stack);
        let stack_id = exists.clone().unwrap_or_else(|| stack.to_string());
        let page = match inner.events.get_mut(&stack_id) {
            Some(log) => log.pending.pop_front(),
            None if exists.is_some() => return Ok(Vec::new()),
            None => return Err(stack_missing(stack)),
        };
        if let Some(page) = page {
            inner.apply_page(&page);
            if let Some(log) = inner.events.get_mut(&stack_id) {
                log.history.extend(page);
            }
        }
        Ok(inner
            .events
            .get(&stack_id)
            .map(|log| log.history.iter().rev().cloned().collect())
            .unwrap_or_default())
    }
}

// ═══════════════════════════════════════════════════════════════
// OBJECT STORE
// ═══════════════════════════════════════════════════════════════

/// An object as stored by [`MemoryBlobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    pub encryption: Option<ServerSideEncryption>,
}

#[derive(Debug, Default)]
struct BlobInner {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    denied: BTreeSet<String>,
    failures: HashMap<&'static str, VecDeque<ProviderError>>,
    calls: Vec<&'static str>,
    deleted: Vec<String>,
}

impl BlobInner {
    fn call(&mut self, op: &'static str, bucket: &str) -> Result<(), DeployError> {
        self.calls.push(op);
        if let Some(err) = self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(DeployError::Provider(err));
        }
        if self.denied.contains(bucket) {
            return Err(DeployError::Provider(
                ProviderError::new("Access Denied")
                    .with_code("AccessDenied")
                    .with_status(403),
            ));
        }
        Ok(())
    }

    fn bucket(&mut self, bucket: &str) -> Result<&mut BTreeMap<String, StoredObject>, DeployError> {
        self.buckets.get_mut(bucket).ok_or_else(|| {
            DeployError::Provider(
                ProviderError::new("The specified bucket does not exist")
                    .with_code("NoSuchBucket")
                    .with_status(404),
            )
        })
    }
}

fn key_missing() -> DeployError {
    DeployError::Provider(
        ProviderError::new("The specified key does not exist.")
            .with_code("NoSuchKey")
            .with_status(404),
    )
}

/// Object store held in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    inner: Mutex<BlobInner>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, name: &str) -> Self {
        self.add_bucket(name);
        self
    }

    pub fn add_bucket(&self, name: &str) {
        lock(&self.inner)
            .buckets
            .entry(name.to_string())
            .or_default();
    }

    /// Every call on `bucket` answers 403 from now on.
    pub fn deny_bucket(&self, name: &str) {
        lock(&self.inner).denied.insert(name.to_string());
    }

    /// Store an object directly, with its hash metadata.
    pub fn seed(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        let object = StoredObject {
            metadata: BTreeMap::from([(HASH_METADATA_KEY.to_string(), sha256_base64(&body))]),
            content_type: "application/octet-stream".to_string(),
            encryption: None,
            body,
        };
        lock(&self.inner)
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        lock(&self.inner).buckets.get(bucket)?.get(key).cloned()
    }

    /// Keys of `bucket`, ascending.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.inner)
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn fail_on(&self, op: &'static str, err: ProviderError) {
        lock(&self.inner)
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.inner).calls.clone()
    }

    pub fn put_count(&self) -> usize {
        lock(&self.inner)
            .calls
            .iter()
            .filter(|c| **c == "put_object")
            .count()
    }

    /// Keys removed through `delete_objects`, in call order.
    pub fn deleted_keys(&self) -> Vec<String> {
        lock(&self.inner).deleted.clone()
    }

    /// Puts and deletes issued so far.
    pub fn mutating_calls(&self) -> usize {
        lock(&self.inner)
            .calls
            .iter()
            .filter(|c| matches!(**c, "put_object" | "delete_objects"))
            .count()
    }
}

impl BlobBackend for MemoryBlobStore {
    async fn head_bucket(&self, bucket: &str) -> Result<(), DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("head_bucket", bucket)?;
        inner.bucket(bucket).map(|_| ())
    }

    async fn put_object(&self, object: PutObject) -> Result<(), DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("put_object", &object.bucket)?;
        inner.bucket(&object.bucket)?.insert(
            object.key,
            StoredObject {
                body: object.body,
                content_type: object.content_type,
                metadata: object.metadata,
                encryption: object.encryption,
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("get_object", bucket)?;
        inner
            .bucket(bucket)?
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(key_missing)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("head_object", bucket)?;
        inner
            .bucket(bucket)?
            .get(key)
            .map(|o| ObjectHead {
                key: key.to_string(),
                metadata: o.metadata.clone(),
            })
            .ok_or_else(key_missing)
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectSummary>, DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("list_objects", bucket)?;
        Ok(inner
            .bucket(bucket)?
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                size: object.body.len() as u64,
            })
            .collect())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), DeployError> {
        let mut inner = lock(&self.inner);
        inner.call("delete_objects", bucket)?;
        let objects = inner.bucket(bucket)?;
        for key in keys {
            objects.remove(key);
        }
        inner.deleted.extend(keys.iter().cloned());
        Ok(())
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{}/{}", bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_released_page_by_page() {
        let stacks = MemoryStackBackend::new();
        let request = CreateStackRequest {
            stack_name: "svc-dev".into(),
            template: TemplateSource::Body("{}".into()),
            on_failure: OnFailure::Rollback,
            capabilities: vec![],
            parameters: vec![],
            tags: vec![],
            role_arn: None,
            notification_arns: vec![],
        };
        let id = stacks.create_stack(&request).await.unwrap();

        let first = stacks.describe_stack_events(&id).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = stacks.describe_stack_events(&id).await.unwrap();
        assert_eq!(second[0].resource_status, "CREATE_COMPLETE");
        assert_eq!(second[1].resource_status, "CREATE_IN_PROGRESS");
        assert_eq!(stacks.status("svc-dev"), Some(StackStatus::CreateComplete));
    }

    #[tokio::test]
    async fn test_identical_update_is_a_no_op() {
        let stacks = MemoryStackBackend::new().with_stack("svc-dev", StackStatus::CreateComplete);
        let request = UpdateStackRequest {
            stack_name: "svc-dev".into(),
            template: TemplateSource::Body("{\"a\":1}".into()),
            capabilities: vec![],
            parameters: vec![],
            tags: vec![],
            role_arn: None,
            notification_arns: vec![],
            stack_policy_body: None,
            stack_policy_during_update_body: None,
            rollback_configuration: None,
        };
        stacks.update_stack(&request).await.unwrap();
        let err = stacks.update_stack(&request).await.unwrap_err();
        assert!(err.is_no_updates());
    }

    #[tokio::test]
    async fn test_blob_errors_match_provider() {
        let blobs = MemoryBlobStore::new().with_bucket("b");
        let err = blobs.head_bucket("missing").await.unwrap_err();
        assert!(err.as_provider().unwrap().is_bucket_missing());

        let err = blobs.get_object("b", "nope").await.unwrap_err();
        assert!(err.is_not_found());

        blobs.fail_on("put_object", ProviderError::new("SlowDown").with_status(503));
        let err = blobs
            .put_object(PutObject {
                bucket: "b".into(),
                key: "k".into(),
                body: vec![],
                content_type: "application/json".into(),
                metadata: BTreeMap::new(),
                encryption: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "SlowDown");
        assert!(blobs.keys("b").is_empty());
    }
}
