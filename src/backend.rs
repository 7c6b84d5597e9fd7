//! The two seams: StackBackend and BlobBackend
//!
//! These are the only abstraction points for external dependencies.
//! The engine is pure logic: it doesn't know about SDKs, signing,
//! regions or retries. That's YOUR problem when you implement these
//! traits.
//!
//! Errors are returned as [`DeployError::Provider`] carrying the
//! provider's message verbatim, so the engine can recognize benign
//! answers ("does not exist", "No updates are to be performed").

use crate::error::DeployError;
use crate::types::*;
use std::future::Future;

/// Control-plane operations on stacks.
pub trait StackBackend: Send + Sync {
    /// Describe a stack by name or id.
    fn describe_stack(
        &self,
        stack_name: &str,
    ) -> impl Future<Output = Result<StackDescription, DeployError>> + Send;

    /// Describe a single resource of a stack by logical id.
    fn describe_stack_resource(
        &self,
        stack_name: &str,
        logical_resource_id: &str,
    ) -> impl Future<Output = Result<StackResourceDetail, DeployError>> + Send;

    /// Start a create. Returns the stack id.
    fn create_stack(
        &self,
        request: &CreateStackRequest,
    ) -> impl Future<Output = Result<String, DeployError>> + Send;

    /// Start an update. Returns the stack id.
    fn update_stack(
        &self,
        request: &UpdateStackRequest,
    ) -> impl Future<Output = Result<String, DeployError>> + Send;

    /// Start a removal.
    fn delete_stack(&self, stack_name: &str)
        -> impl Future<Output = Result<(), DeployError>> + Send;

    /// Event log of a stack by name or id, most recent first.
    fn describe_stack_events(
        &self,
        stack: &str,
    ) -> impl Future<Output = Result<Vec<StackEvent>, DeployError>> + Send;
}

/// Object-store operations on the deployment bucket.
pub trait BlobBackend: Send + Sync {
    /// Check that the bucket exists and is accessible.
    fn head_bucket(&self, bucket: &str) -> impl Future<Output = Result<(), DeployError>> + Send;

    /// Store an object.
    fn put_object(&self, object: PutObject)
        -> impl Future<Output = Result<(), DeployError>> + Send;

    /// Fetch object contents.
    fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<Vec<u8>, DeployError>> + Send;

    /// Fetch object metadata.
    fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<ObjectHead, DeployError>> + Send;

    /// List every object under a prefix, ascending by key.
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<ObjectSummary>, DeployError>> + Send;

    /// Delete a batch of objects.
    fn delete_objects(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> impl Future<Output = Result<(), DeployError>> + Send;

    /// URL the control plane can read a template from.
    fn object_url(&self, bucket: &str, key: &str) -> String;
}
