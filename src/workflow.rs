//! Deployment Workflow Engine
//!
//! The state machine that drives a deployment. It just transitions
//! between steps and calls the components: artifact store, change
//! detector, orchestrator, retention collector. No SDKs, no signing,
//! no transport. Just logic.

use crate::artifacts::{ArtifactBundle, ArtifactStore, DeploymentBucket};
use crate::backend::{BlobBackend, StackBackend};
use crate::changes::ChangeDetector;
use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::manifest::DeploymentManifest;
use crate::monitor::{Clock, SystemClock};
use crate::naming::{deployment_directory, validate_stack_name, DEPLOYMENT_BUCKET_LOGICAL_ID};
use crate::orchestrator::{Applied, StackOrchestrator, StackPhase};
use crate::retention::RetentionCollector;
use crate::state::{DeploymentOutcome, DeploymentState, Step};
use crate::store::TemplateStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of advancing one step.
#[derive(Debug)]
pub enum StepResult {
    /// Keep going, call advance() again.
    Continue,
    /// Workflow needs input from caller.
    NeedsInput(InputRequired),
    /// Done successfully.
    Complete(DeploymentOutcome),
    /// Failed.
    Failed(String),
}

/// What input the workflow needs.
#[derive(Debug)]
pub enum InputRequired {
    /// No compiled manifest on the state.
    ProvideManifest,
}

/// The deployment workflow engine.
///
/// Parameterized by the backends; you provide the implementations.
pub struct DeploymentWorkflow<'a, S, B, T, C = SystemClock>
where
    S: StackBackend,
    B: BlobBackend,
    T: TemplateStore + ?Sized,
    C: Clock,
{
    stacks: &'a S,
    blobs: &'a B,
    templates: &'a T,
    clock: C,
    config: DeployConfig,
    cancel: CancellationToken,
}

impl<'a, S, B, T> DeploymentWorkflow<'a, S, B, T, SystemClock>
where
    S: StackBackend,
    B: BlobBackend,
    T: TemplateStore + ?Sized,
{
    /// Create a new workflow engine.
    pub fn new(stacks: &'a S, blobs: &'a B, templates: &'a T, config: DeployConfig) -> Self {
        Self {
            stacks,
            blobs,
            templates,
            clock: SystemClock,
            config,
            cancel: CancellationToken::new(),
        }
    }
}

impl<'a, S, B, T, C> DeploymentWorkflow<'a, S, B, T, C>
where
    S: StackBackend,
    B: BlobBackend,
    T: TemplateStore + ?Sized,
    C: Clock,
{
    /// Swap the time source used for directory names and monitor waits.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> DeploymentWorkflow<'a, S, B, T, C2> {
        DeploymentWorkflow {
            stacks: self.stacks,
            blobs: self.blobs,
            templates: self.templates,
            clock,
            config: self.config,
            cancel: self.cancel,
        }
    }

    /// Cancelling the token stops monitoring; the remote operation
    /// carries on.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Fresh state for this workflow's service stage.
    pub fn new_state(&self, manifest: DeploymentManifest, bundle: ArtifactBundle) -> DeploymentState {
        DeploymentState::new(&self.config)
            .with_manifest(manifest)
            .with_bundle(bundle)
    }

    /// Advance the workflow by one step.
    ///
    /// Each step does one thing, then transitions. Call this in a loop
    /// until you get Complete, Failed, or NeedsInput. A step error fails
    /// the state and is returned.
    pub async fn advance(&self, state: &mut DeploymentState) -> Result<StepResult, DeployError> {
        let from = state.step.name();
        let result = match state.step.clone() {
            Step::Init => self.step_init(state).await,
            Step::ResolveBucket => self.step_resolve_bucket(state).await,
            Step::CheckForChanges => self.step_check_for_changes(state).await,
            Step::PrepareStack => self.step_prepare_stack(state).await,
            Step::UploadArtifacts => self.step_upload_artifacts(state).await,
            Step::DeployStack => self.step_deploy_stack(state).await,
            Step::Cleanup => self.step_cleanup(state).await,
            Step::Complete => {
                return state.outcome.clone().map(StepResult::Complete).ok_or_else(|| {
                    DeployError::InvalidState("complete without an outcome".into())
                })
            }
            Step::Failed { reason, .. } => return Ok(StepResult::Failed(reason)),
        };

        match result {
            Ok(step_result) => {
                debug!(from, to = state.step.name(), "advanced");
                Ok(step_result)
            }
            Err(e) => {
                warn!(step = from, stack = %state.stack_name, error = %e, "deployment step failed");
                state.fail(e.to_string(), e.is_recoverable());
                Err(e)
            }
        }
    }

    /// Run until completion or until input is needed.
    pub async fn run_to_completion(
        &self,
        state: &mut DeploymentState,
    ) -> Result<StepResult, DeployError> {
        loop {
            match self.advance(state).await? {
                StepResult::Continue => continue,
                other => return Ok(other),
            }
        }
    }

    /// Run a whole deployment of `manifest` and `bundle`.
    pub async fn deploy(
        &self,
        manifest: DeploymentManifest,
        bundle: ArtifactBundle,
    ) -> Result<DeploymentOutcome, DeployError> {
        let mut state = self.new_state(manifest, bundle);
        match self.run_to_completion(&mut state).await? {
            StepResult::Complete(outcome) => Ok(outcome),
            StepResult::Failed(reason) => Err(DeployError::InvalidState(reason)),
            other => Err(DeployError::InvalidState(format!(
                "deployment stopped early: {:?}",
                other
            ))),
        }
    }

    /// Delete the stack. Returns whether there was one.
    pub async fn remove(&self) -> Result<bool, DeployError> {
        validate_stack_name(&self.config.stack_name())?;
        self.orchestrator().remove().await
    }

    // ═══════════════════════════════════════════════════════════════
    // STEP IMPLEMENTATIONS
    // ═══════════════════════════════════════════════════════════════

    async fn step_init(&self, state: &mut DeploymentState) -> Result<StepResult, DeployError> {
        let Some(manifest) = &state.manifest else {
            return Ok(StepResult::NeedsInput(InputRequired::ProvideManifest));
        };
        self.config.validate()?;
        validate_stack_name(&state.stack_name)?;

        let directory = deployment_directory(self.clock.now());
        let prepared = self
            .artifacts()
            .prepare(manifest, &state.bundle, &directory)?;
        info!(
            stack = %state.stack_name,
            directory = %prepared.directory,
            artifacts = prepared.artifacts.len(),
            "prepared deployment"
        );

        state.prepared = Some(prepared);
        state.transition(Step::ResolveBucket);
        Ok(StepResult::Continue)
    }

    async fn step_resolve_bucket(
        &self,
        state: &mut DeploymentState,
    ) -> Result<StepResult, DeployError> {
        state.bucket = self.resolve_bucket().await?;
        state.transition(Step::CheckForChanges);
        Ok(StepResult::Continue)
    }

    async fn step_check_for_changes(
        &self,
        state: &mut DeploymentState,
    ) -> Result<StepResult, DeployError> {
        let prepared = state.prepared.as_ref().ok_or_else(|| {
            DeployError::InvalidState("prepared deployment missing at CheckForChanges".into())
        })?;

        let store = self.artifacts();
        let decision = ChangeDetector::new(&store, &self.config)
            .should_deploy(state.bucket.as_ref(), prepared)
            .await?;
        state.decision = Some(decision.clone());

        if !decision.should_deploy {
            info!(stack = %state.stack_name, reason = %decision.reason, "nothing to deploy");
            let outcome = DeploymentOutcome::Skipped(decision);
            state.outcome = Some(outcome.clone());
            state.transition(Step::Complete);
            return Ok(StepResult::Complete(outcome));
        }

        debug!(reason = %decision.reason, "deploying");
        state.transition(Step::PrepareStack);
        Ok(StepResult::Continue)
    }

    async fn step_prepare_stack(
        &self,
        state: &mut DeploymentState,
    ) -> Result<StepResult, DeployError> {
        let manifest = state.manifest.as_ref().ok_or_else(|| {
            DeployError::InvalidState("manifest missing at PrepareStack".into())
        })?;

        let phase = self.orchestrator().prepare(manifest).await?;
        state.create_later = phase == StackPhase::Deferred;
        state.phase = Some(phase);
        state.transition(Step::UploadArtifacts);
        Ok(StepResult::Continue)
    }

    async fn step_upload_artifacts(
        &self,
        state: &mut DeploymentState,
    ) -> Result<StepResult, DeployError> {
        // The stack may have just created the bucket.
        if state.bucket.is_none() {
            state.bucket = self.resolve_bucket().await?;
        }

        let prepared = state.prepared.as_ref().ok_or_else(|| {
            DeployError::InvalidState("prepared deployment missing at UploadArtifacts".into())
        })?;

        match &state.bucket {
            Some(bucket) => {
                let keys = self.artifacts().upload_bundle(bucket, prepared).await?;
                state.uploaded_keys = keys;
            }
            None if self.config.dry_run => {
                info!(stack = %state.stack_name, "dry run: no deployment bucket yet, skipping uploads");
            }
            None => {
                return Err(DeployError::Config(format!(
                    "stack \"{}\" has no {} resource; configure deploymentBucket or \
                     include the bucket in the bootstrap template",
                    state.stack_name, DEPLOYMENT_BUCKET_LOGICAL_ID
                )))
            }
        }

        state.transition(Step::DeployStack);
        Ok(StepResult::Continue)
    }

    async fn step_deploy_stack(
        &self,
        state: &mut DeploymentState,
    ) -> Result<StepResult, DeployError> {
        let prepared = state.prepared.as_ref().ok_or_else(|| {
            DeployError::InvalidState("prepared deployment missing at DeployStack".into())
        })?;
        let phase = state.phase.ok_or_else(|| {
            DeployError::InvalidState("stack phase missing at DeployStack".into())
        })?;

        let template_url = state
            .bucket
            .as_ref()
            .map(|bucket| self.artifacts().template_url(bucket, prepared));
        let applied = self
            .orchestrator()
            .apply(phase, &prepared.template, template_url.as_deref())
            .await?;

        let outcome = match applied {
            Applied::Created(stack) | Applied::Updated(stack) => {
                state.stack = Some(stack.clone());
                DeploymentOutcome::Deployed(stack)
            }
            Applied::Unchanged(stack) => {
                state.stack = Some(stack.clone());
                DeploymentOutcome::Unchanged(stack)
            }
            Applied::DryRun => DeploymentOutcome::DryRun,
        };
        state.outcome = Some(outcome);
        state.transition(Step::Cleanup);
        Ok(StepResult::Continue)
    }

    async fn step_cleanup(&self, state: &mut DeploymentState) -> Result<StepResult, DeployError> {
        if let Some(bucket) = &state.bucket {
            let store = self.artifacts();
            match RetentionCollector::new(&store, &self.config)
                .reclaim(bucket)
                .await
            {
                Ok(plan) => state.reclaimed_keys = plan.keys,
                Err(e) => warn!(
                    bucket = %bucket.name,
                    error = %e,
                    "failed to remove old deployment artifacts"
                ),
            }
        }

        let outcome = state.outcome.clone().ok_or_else(|| {
            DeployError::InvalidState("outcome missing at Cleanup".into())
        })?;
        state.transition(Step::Complete);
        Ok(StepResult::Complete(outcome))
    }

    // ═══════════════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════════════

    fn artifacts(&self) -> ArtifactStore<'_, B> {
        ArtifactStore::new(self.blobs, &self.config)
    }

    fn orchestrator(&self) -> StackOrchestrator<'_, S, T, C> {
        StackOrchestrator::new(self.stacks, self.templates, &self.clock, &self.config)
            .with_cancellation(self.cancel.clone())
    }

    /// The configured bucket, or the one the stack owns. `None` when the
    /// stack does not exist yet.
    async fn resolve_bucket(&self) -> Result<Option<DeploymentBucket>, DeployError> {
        let store = self.artifacts();
        if self.config.is_external_bucket() {
            return store.ensure_bucket(None).await.map(Some);
        }

        let stack_name = self.config.stack_name();
        match self
            .stacks
            .describe_stack_resource(&stack_name, DEPLOYMENT_BUCKET_LOGICAL_ID)
            .await
        {
            Ok(resource) => store
                .ensure_bucket(Some(&resource.physical_resource_id))
                .await
                .map(Some),
            Err(e) if e.is_not_found() => {
                info!(stack = %stack_name, "deployment bucket will be created with the stack");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
