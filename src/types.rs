//! Minimal domain types for the stack deployment engine.
//!
//! These are the shapes the engine exchanges with the control plane and
//! the object store. Provider SDK types stay on the other side of the
//! backend traits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource type of the stack itself in its own event log.
pub const STACK_RESOURCE_TYPE: &str = "AWS::CloudFormation::Stack";

/// Stack status as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StackStatus {
    CreateInProgress,
    CreateFailed,
    CreateComplete,
    RollbackInProgress,
    RollbackFailed,
    RollbackComplete,
    DeleteInProgress,
    DeleteFailed,
    DeleteComplete,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateFailed,
    UpdateRollbackInProgress,
    UpdateRollbackFailed,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackComplete,
    ReviewInProgress,
    /// Anything this engine does not know about.
    Other(String),
}

impl StackStatus {
    pub fn as_str(&self) -> &str {
        match self {
            StackStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            StackStatus::CreateFailed => "CREATE_FAILED",
            StackStatus::CreateComplete => "CREATE_COMPLETE",
            StackStatus::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            StackStatus::RollbackFailed => "ROLLBACK_FAILED",
            StackStatus::RollbackComplete => "ROLLBACK_COMPLETE",
            StackStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            StackStatus::DeleteFailed => "DELETE_FAILED",
            StackStatus::DeleteComplete => "DELETE_COMPLETE",
            StackStatus::UpdateInProgress => "UPDATE_IN_PROGRESS",
            StackStatus::UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            StackStatus::UpdateComplete => "UPDATE_COMPLETE",
            StackStatus::UpdateFailed => "UPDATE_FAILED",
            StackStatus::UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
            StackStatus::UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
            StackStatus::UpdateRollbackCompleteCleanupInProgress => {
                "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
            }
            StackStatus::UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
            StackStatus::ReviewInProgress => "REVIEW_IN_PROGRESS",
            StackStatus::Other(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "CREATE_IN_PROGRESS" => StackStatus::CreateInProgress,
            "CREATE_FAILED" => StackStatus::CreateFailed,
            "CREATE_COMPLETE" => StackStatus::CreateComplete,
            "ROLLBACK_IN_PROGRESS" => StackStatus::RollbackInProgress,
            "ROLLBACK_FAILED" => StackStatus::RollbackFailed,
            "ROLLBACK_COMPLETE" => StackStatus::RollbackComplete,
            "DELETE_IN_PROGRESS" => StackStatus::DeleteInProgress,
            "DELETE_FAILED" => StackStatus::DeleteFailed,
            "DELETE_COMPLETE" => StackStatus::DeleteComplete,
            "UPDATE_IN_PROGRESS" => StackStatus::UpdateInProgress,
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS" => StackStatus::UpdateCompleteCleanupInProgress,
            "UPDATE_COMPLETE" => StackStatus::UpdateComplete,
            "UPDATE_FAILED" => StackStatus::UpdateFailed,
            "UPDATE_ROLLBACK_IN_PROGRESS" => StackStatus::UpdateRollbackInProgress,
            "UPDATE_ROLLBACK_FAILED" => StackStatus::UpdateRollbackFailed,
            "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS" => {
                StackStatus::UpdateRollbackCompleteCleanupInProgress
            }
            "UPDATE_ROLLBACK_COMPLETE" => StackStatus::UpdateRollbackComplete,
            "REVIEW_IN_PROGRESS" => StackStatus::ReviewInProgress,
            other => StackStatus::Other(other.to_string()),
        }
    }

    /// Any rollback variant, in progress or finished.
    pub fn is_rollback(&self) -> bool {
        self.as_str().contains("ROLLBACK")
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for StackStatus {
    fn from(raw: String) -> Self {
        StackStatus::parse(&raw)
    }
}

impl From<StackStatus> for String {
    fn from(status: StackStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Which mutating operation is being monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Removal,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Removal => "removal",
        }
    }

    /// The status that ends monitoring successfully.
    pub fn success_status(&self) -> StackStatus {
        match self {
            OperationKind::Create => StackStatus::CreateComplete,
            OperationKind::Update => StackStatus::UpdateComplete,
            OperationKind::Removal => StackStatus::DeleteComplete,
        }
    }

    /// Statuses that mean "keep polling".
    pub fn is_in_progress(&self, status: &StackStatus) -> bool {
        match self {
            OperationKind::Create => matches!(
                status,
                StackStatus::CreateInProgress | StackStatus::ReviewInProgress
            ),
            OperationKind::Update => matches!(
                status,
                StackStatus::UpdateInProgress | StackStatus::UpdateCompleteCleanupInProgress
            ),
            OperationKind::Removal => matches!(status, StackStatus::DeleteInProgress),
        }
    }
}

/// A stack as returned by a describe call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackDescription {
    pub stack_name: String,
    pub stack_id: String,
    pub status: StackStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Re-derived view of the remote stack after an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub name: String,
    pub id: String,
    pub status: StackStatus,
    pub outputs: BTreeMap<String, String>,
}

impl From<StackDescription> for StackState {
    fn from(desc: StackDescription) -> Self {
        Self {
            name: desc.stack_name,
            id: desc.stack_id,
            status: desc.status,
            outputs: desc.outputs,
        }
    }
}

/// Physical details of one resource inside a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackResourceDetail {
    pub logical_resource_id: String,
    pub physical_resource_id: String,
    pub resource_type: String,
}

/// One entry of the stack event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEvent {
    pub event_id: String,
    pub stack_name: String,
    pub logical_resource_id: String,
    pub resource_type: String,
    pub resource_status: String,
    #[serde(default)]
    pub resource_status_reason: Option<String>,
    /// RFC 3339 timestamp as reported by the provider.
    pub timestamp: String,
}

impl StackEvent {
    /// Event about the stack itself (not a nested stack or resource).
    pub fn is_stack_event(&self, stack_name: &str) -> bool {
        self.resource_type == STACK_RESOURCE_TYPE && self.logical_resource_id == stack_name
    }

    pub fn status(&self) -> StackStatus {
        StackStatus::parse(&self.resource_status)
    }

    pub fn is_failure(&self) -> bool {
        self.resource_status.ends_with("FAILED")
    }
}

/// Stack tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Stack input parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: String,
}

/// What to do with a stack whose create fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnFailure {
    #[default]
    Rollback,
    Delete,
    DoNothing,
}

impl OnFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnFailure::Rollback => "ROLLBACK",
            OnFailure::Delete => "DELETE",
            OnFailure::DoNothing => "DO_NOTHING",
        }
    }
}

/// Template passed inline or by reference to an uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateSource {
    Body(String),
    Url(String),
}

/// Create call payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateStackRequest {
    pub stack_name: String,
    pub template: TemplateSource,
    pub on_failure: OnFailure,
    pub capabilities: Vec<String>,
    pub parameters: Vec<Parameter>,
    pub tags: Vec<Tag>,
    pub role_arn: Option<String>,
    pub notification_arns: Vec<String>,
}

/// Update call payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStackRequest {
    pub stack_name: String,
    pub template: TemplateSource,
    pub capabilities: Vec<String>,
    pub parameters: Vec<Parameter>,
    pub tags: Vec<Tag>,
    pub role_arn: Option<String>,
    pub notification_arns: Vec<String>,
    pub stack_policy_body: Option<String>,
    pub stack_policy_during_update_body: Option<String>,
    pub rollback_configuration: Option<serde_json::Value>,
}

/// Server-side encryption applied to uploaded objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum ServerSideEncryption {
    Aes256,
    Kms { key_id: Option<String> },
}

/// Object upload payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObject {
    pub bucket: String,
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    pub encryption: Option<ServerSideEncryption>,
}

/// Entry of an object listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// Head response for an object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectHead {
    pub key: String,
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_and_unknown() {
        assert_eq!(
            StackStatus::parse("UPDATE_COMPLETE"),
            StackStatus::UpdateComplete
        );
        assert_eq!(StackStatus::UpdateComplete.as_str(), "UPDATE_COMPLETE");

        let weird = StackStatus::parse("IMPORT_IN_PROGRESS");
        assert_eq!(weird, StackStatus::Other("IMPORT_IN_PROGRESS".into()));
        assert_eq!(weird.to_string(), "IMPORT_IN_PROGRESS");
    }

    #[test]
    fn test_status_serde_as_string() {
        let json = serde_json::to_string(&StackStatus::CreateComplete).unwrap();
        assert_eq!(json, "\"CREATE_COMPLETE\"");
        let back: StackStatus = serde_json::from_str("\"ROLLBACK_COMPLETE\"").unwrap();
        assert_eq!(back, StackStatus::RollbackComplete);
        assert!(back.is_rollback());
    }

    #[test]
    fn test_operation_sets() {
        assert!(OperationKind::Update.is_in_progress(&StackStatus::UpdateInProgress));
        assert!(OperationKind::Update
            .is_in_progress(&StackStatus::UpdateCompleteCleanupInProgress));
        assert!(!OperationKind::Update.is_in_progress(&StackStatus::UpdateRollbackInProgress));
        assert!(!OperationKind::Create.is_in_progress(&StackStatus::DeleteInProgress));
        assert_eq!(
            OperationKind::Removal.success_status(),
            StackStatus::DeleteComplete
        );
    }

    #[test]
    fn test_stack_event_scope() {
        let event = StackEvent {
            event_id: "1".into(),
            stack_name: "svc-dev".into(),
            logical_resource_id: "svc-dev".into(),
            resource_type: STACK_RESOURCE_TYPE.into(),
            resource_status: "CREATE_COMPLETE".into(),
            resource_status_reason: None,
            timestamp: "2024-01-01T00:00:00Z".into(),
        };
        assert!(event.is_stack_event("svc-dev"));
        assert!(!event.is_stack_event("nested-stack"));
        assert!(!event.is_failure());
    }
}
