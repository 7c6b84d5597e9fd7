//! Deployment state machine definition.
//!
//! The state is the complete snapshot of one deployment run. It's
//! serializable, so a caller can record what happened, and the workflow
//! engine doesn't care whether anyone does. Artifact bytes are the only
//! thing left out.

use crate::artifacts::{ArtifactBundle, DeploymentBucket, PreparedDeployment};
use crate::changes::ChangeDecision;
use crate::config::DeployConfig;
use crate::manifest::DeploymentManifest;
use crate::orchestrator::StackPhase;
use crate::types::StackState;
use serde::{Deserialize, Serialize};

/// Workflow steps, the nodes of the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    /// Bind keys into the template and hash the build.
    Init,
    /// Find and validate the deployment bucket.
    ResolveBucket,
    /// Compare the build with the last deployment.
    CheckForChanges,
    /// Create the stack or defer its creation.
    PrepareStack,
    /// Upload code artifacts and the template.
    UploadArtifacts,
    /// Update, or create from the uploaded template.
    DeployStack,
    /// Reclaim storage of old deployments.
    Cleanup,
    /// Done.
    Complete,
    /// Failed, possibly recoverable.
    Failed { reason: String, recoverable: bool },
}

impl Step {
    /// Human-readable step name for logging/display.
    pub fn name(&self) -> &'static str {
        match self {
            Step::Init => "init",
            Step::ResolveBucket => "resolve_bucket",
            Step::CheckForChanges => "check_for_changes",
            Step::PrepareStack => "prepare_stack",
            Step::UploadArtifacts => "upload_artifacts",
            Step::DeployStack => "deploy_stack",
            Step::Cleanup => "cleanup",
            Step::Complete => "complete",
            Step::Failed { .. } => "failed",
        }
    }
}

/// How a completed run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeploymentOutcome {
    /// A create or update went through.
    Deployed(StackState),
    /// The provider found nothing to update.
    Unchanged(StackState),
    /// Change detection found nothing to deploy.
    Skipped(ChangeDecision),
    DryRun,
}

/// Full workflow state. Serializable and restorable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub service: String,
    pub stage: String,
    pub stack_name: String,
    /// Current step in the workflow.
    pub step: Step,

    // Inputs
    pub manifest: Option<DeploymentManifest>,
    #[serde(skip)]
    pub bundle: ArtifactBundle,

    // Populated as workflow progresses
    pub prepared: Option<PreparedDeployment>,
    pub bucket: Option<DeploymentBucket>,
    pub decision: Option<ChangeDecision>,
    pub phase: Option<StackPhase>,
    /// Stack creation waits for the uploaded template.
    pub create_later: bool,
    pub uploaded_keys: Vec<String>,

    // Result
    pub stack: Option<StackState>,
    pub outcome: Option<DeploymentOutcome>,
    /// Keys deleted by cleanup (or that would be, in a dry run).
    pub reclaimed_keys: Vec<String>,

    // Audit
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Unix timestamp of last update.
    pub updated_at: u64,
}

impl DeploymentState {
    /// Create a new deployment state for the configured service stage.
    pub fn new(config: &DeployConfig) -> Self {
        let now = current_unix_time();

        Self {
            service: config.service.clone(),
            stage: config.stage.clone(),
            stack_name: config.stack_name(),
            step: Step::Init,
            manifest: None,
            bundle: ArtifactBundle::default(),
            prepared: None,
            bucket: None,
            decision: None,
            phase: None,
            create_later: false,
            uploaded_keys: Vec::new(),
            stack: None,
            outcome: None,
            reclaimed_keys: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the compiled manifest.
    pub fn with_manifest(mut self, manifest: DeploymentManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Set the code artifacts.
    pub fn with_bundle(mut self, bundle: ArtifactBundle) -> Self {
        self.bundle = bundle;
        self
    }

    /// Is this workflow in a terminal state?
    pub fn is_terminal(&self) -> bool {
        matches!(self.step, Step::Complete | Step::Failed { .. })
    }

    /// Is this workflow failed?
    pub fn is_failed(&self) -> bool {
        matches!(self.step, Step::Failed { .. })
    }

    /// Is this workflow complete?
    pub fn is_complete(&self) -> bool {
        matches!(self.step, Step::Complete)
    }

    /// Transition to a new step.
    pub fn transition(&mut self, step: Step) {
        self.step = step;
        self.updated_at = current_unix_time();
    }

    /// Fail the workflow.
    pub fn fail(&mut self, reason: impl Into<String>, recoverable: bool) {
        self.step = Step::Failed {
            reason: reason.into(),
            recoverable,
        };
        self.updated_at = current_unix_time();
    }
}

fn current_unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_state() {
        let state = DeploymentState::new(&DeployConfig::new("svc", "prod"));
        assert_eq!(state.stack_name, "svc-prod");
        assert_eq!(state.stage, "prod");
        assert!(matches!(state.step, Step::Init));
        assert!(!state.is_terminal());
        assert!(!state.create_later);
    }

    #[test]
    fn test_builder_pattern() {
        let state = DeploymentState::new(&DeployConfig::new("svc", "dev"))
            .with_manifest(DeploymentManifest::new(json!({ "Resources": {} })))
            .with_bundle(ArtifactBundle::new().with_artifact("a.zip", b"a".to_vec()));

        assert!(state.manifest.is_some());
        assert_eq!(state.bundle.code.len(), 1);
    }

    #[test]
    fn test_terminal_states() {
        let mut state = DeploymentState::new(&DeployConfig::new("svc", "dev"));
        assert!(!state.is_terminal());

        state.transition(Step::Complete);
        assert!(state.is_terminal());
        assert!(state.is_complete());

        state.fail("something broke", true);
        assert!(state.is_terminal());
        assert!(state.is_failed());
    }

    #[test]
    fn test_snapshot_skips_artifact_bytes() {
        let mut state = DeploymentState::new(&DeployConfig::new("svc", "dev"))
            .with_bundle(ArtifactBundle::new().with_artifact("a.zip", b"secret".to_vec()));
        state.outcome = Some(DeploymentOutcome::DryRun);

        let raw = serde_json::to_string(&state).unwrap();
        assert!(!raw.contains("a.zip"));
        assert!(raw.contains("\"result\":\"dry_run\""));

        let restored: DeploymentState = serde_json::from_str(&raw).unwrap();
        assert!(restored.bundle.code.is_empty());
        assert_eq!(restored.outcome, Some(DeploymentOutcome::DryRun));
    }
}
