//! Stack orchestrator: create versus update.
//!
//! A stack is ABSENT, EXISTS, or DEFERRED (absent, but created only once
//! the template has been uploaded in this run). [`StackOrchestrator::prepare`]
//! runs before uploads and takes a stack out of ABSENT; [`StackOrchestrator::apply`]
//! runs after uploads and issues the update or the deferred create. Every
//! mutating call is followed by the monitor, and every issued template is
//! written to the [`TemplateStore`] first.

use crate::backend::StackBackend;
use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::manifest::{has_transform, DeploymentManifest};
use crate::monitor::{Clock, StackMonitor};
use crate::naming::{CREATE_TEMPLATE_FILE_NAME, UPDATE_TEMPLATE_FILE_NAME};
use crate::store::TemplateStore;
use crate::types::{
    CreateStackRequest, OperationKind, StackDescription, StackState, Tag, TemplateSource,
    UpdateStackRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::info;

const STAGE_TAG: &str = "STAGE";

/// Result of the existence probe.
#[derive(Debug, Clone, PartialEq)]
pub enum StackPresence {
    Absent,
    Exists(StackDescription),
}

/// Where the stack stands between `prepare` and `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackPhase {
    /// Not created. Only left in this phase by a dry run.
    Absent,
    Exists,
    /// Just created inline by `prepare`.
    Created,
    /// Created by `apply` from the uploaded template.
    Deferred,
}

/// What `apply` did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Created(StackState),
    Updated(StackState),
    /// The provider reported nothing to update.
    Unchanged(StackState),
    DryRun,
}

pub struct StackOrchestrator<'a, S, T, C>
where
    S: StackBackend,
    T: TemplateStore + ?Sized,
    C: Clock,
{
    stacks: &'a S,
    templates: &'a T,
    clock: &'a C,
    config: &'a DeployConfig,
    cancel: CancellationToken,
}

impl<'a, S, T, C> StackOrchestrator<'a, S, T, C>
where
    S: StackBackend,
    T: TemplateStore + ?Sized,
    C: Clock,
{
    pub fn new(stacks: &'a S, templates: &'a T, clock: &'a C, config: &'a DeployConfig) -> Self {
        Self {
            stacks,
            templates,
            clock,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stack_name(&self) -> String {
        self.config.stack_name()
    }

    // ═══════════════════════════════════════════════════════════════
    // PROBE
    // ═══════════════════════════════════════════════════════════════

    /// "Does not exist" means absent; any other error is fatal.
    pub async fn probe(&self) -> Result<StackPresence, DeployError> {
        let stack_name = self.stack_name();
        match self.stacks.describe_stack(&stack_name).await {
            Ok(description) => Ok(StackPresence::Exists(description)),
            Err(e) if e.is_not_found() => {
                info!(stack = %stack_name, "stack does not exist yet");
                Ok(StackPresence::Absent)
            }
            Err(e) => Err(e),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // CREATE OR UPDATE
    // ═══════════════════════════════════════════════════════════════

    /// Take the stack out of ABSENT before uploads.
    ///
    /// An absent stack is created inline from the bootstrap template,
    /// unless the bucket is external or the template is too large to go
    /// inline; then creation is deferred until after the upload.
    pub async fn prepare(&self, manifest: &DeploymentManifest) -> Result<StackPhase, DeployError> {
        if let StackPresence::Exists(_) = self.probe().await? {
            return Ok(StackPhase::Exists);
        }

        let body = to_body(manifest.create_template())?;
        self.templates.save(CREATE_TEMPLATE_FILE_NAME, &body).await?;

        if self.config.is_external_bucket() || body.len() > self.config.inline_template_limit {
            info!(
                stack = %self.stack_name(),
                external_bucket = self.config.is_external_bucket(),
                bytes = body.len(),
                "stack will be created from the uploaded template"
            );
            return Ok(StackPhase::Deferred);
        }
        if self.config.dry_run {
            info!(stack = %self.stack_name(), "dry run: skipping stack create");
            return Ok(StackPhase::Absent);
        }

        self.create(TemplateSource::Body(body), manifest.create_template())
            .await?;
        Ok(StackPhase::Created)
    }

    /// Issue the update, or the deferred create, once `template` is
    /// uploaded at `template_url`.
    pub async fn apply(
        &self,
        phase: StackPhase,
        template: &Value,
        template_url: Option<&str>,
    ) -> Result<Applied, DeployError> {
        let body = to_body(template)?;
        match phase {
            StackPhase::Absent | StackPhase::Deferred => {
                self.templates.save(CREATE_TEMPLATE_FILE_NAME, &body).await?;
                if self.config.dry_run {
                    info!(stack = %self.stack_name(), "dry run: skipping stack create");
                    return Ok(Applied::DryRun);
                }
                let source = match template_url {
                    Some(url) => TemplateSource::Url(url.to_string()),
                    None => self.template_source(body, None)?,
                };
                self.create(source, template).await.map(Applied::Created)
            }
            StackPhase::Exists | StackPhase::Created => {
                self.templates.save(UPDATE_TEMPLATE_FILE_NAME, &body).await?;
                if self.config.dry_run {
                    info!(stack = %self.stack_name(), "dry run: skipping stack update");
                    return Ok(Applied::DryRun);
                }
                let source = self.template_source(body, template_url)?;
                match self.update(source, template).await? {
                    Applied::Unchanged(state) if phase == StackPhase::Created => {
                        Ok(Applied::Created(state))
                    }
                    applied => Ok(applied),
                }
            }
        }
    }

    /// Both halves in one call, for callers that uploaded up front.
    pub async fn create_or_update(
        &self,
        manifest: &DeploymentManifest,
        template: &Value,
        template_url: Option<&str>,
    ) -> Result<Applied, DeployError> {
        let phase = self.prepare(manifest).await?;
        self.apply(phase, template, template_url).await
    }

    async fn create(&self, source: TemplateSource, template: &Value) -> Result<StackState, DeployError> {
        let request = CreateStackRequest {
            stack_name: self.stack_name(),
            template: source,
            on_failure: self.config.on_failure(),
            capabilities: capabilities(template),
            parameters: self.config.stack_parameters.clone(),
            tags: merge_tags(&self.config.stage, &self.config.stack_tags),
            role_arn: self.config.role_arn.clone(),
            notification_arns: self.config.notification_arns.clone(),
        };

        info!(stack = %request.stack_name, "creating stack");
        let stack_id = self.stacks.create_stack(&request).await?;
        // A new stack has no earlier events.
        self.monitor()
            .wait_for_terminal(&request.stack_name, &stack_id, OperationKind::Create, HashSet::new())
            .await?;
        self.describe().await
    }

    async fn update(&self, source: TemplateSource, template: &Value) -> Result<Applied, DeployError> {
        let request = UpdateStackRequest {
            stack_name: self.stack_name(),
            template: source,
            capabilities: capabilities(template),
            parameters: self.config.stack_parameters.clone(),
            tags: merge_tags(&self.config.stage, &self.config.stack_tags),
            role_arn: self.config.role_arn.clone(),
            notification_arns: self.config.notification_arns.clone(),
            stack_policy_body: policy_body(&self.config.stack_policy),
            stack_policy_during_update_body: policy_body(&self.config.stack_policy_during_update),
            rollback_configuration: self.config.rollback_configuration.clone(),
        };

        info!(stack = %request.stack_name, "updating stack");
        let monitor = self.monitor();
        let history = monitor.history(&request.stack_name).await?;
        let stack_id = match self.stacks.update_stack(&request).await {
            Ok(id) => id,
            Err(e) if e.is_no_updates() => {
                info!(stack = %request.stack_name, "no changes to the stack");
                return self.describe().await.map(Applied::Unchanged);
            }
            Err(e) => return Err(e),
        };
        monitor
            .wait_for_terminal(&request.stack_name, &stack_id, OperationKind::Update, history)
            .await?;
        self.describe().await.map(Applied::Updated)
    }

    // ═══════════════════════════════════════════════════════════════
    // REMOVE
    // ═══════════════════════════════════════════════════════════════

    /// Delete the stack and wait for the removal. Returns whether there
    /// was a stack to remove.
    pub async fn remove(&self) -> Result<bool, DeployError> {
        let StackPresence::Exists(description) = self.probe().await? else {
            return Ok(false);
        };
        if self.config.dry_run {
            info!(stack = %description.stack_name, "dry run: skipping stack removal");
            return Ok(true);
        }

        info!(stack = %description.stack_name, "removing stack");
        let monitor = self.monitor();
        let history = monitor.history(&description.stack_id).await?;
        self.stacks.delete_stack(&description.stack_name).await?;
        monitor
            .wait_for_terminal(
                &description.stack_name,
                &description.stack_id,
                OperationKind::Removal,
                history,
            )
            .await?;
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════════════

    fn monitor(&self) -> StackMonitor<'a, S, C> {
        StackMonitor::new(self.stacks, self.clock, self.config.poll_interval())
            .with_verbose(self.config.verbose)
            .with_cancellation(self.cancel.clone())
    }

    async fn describe(&self) -> Result<StackState, DeployError> {
        self.stacks
            .describe_stack(&self.stack_name())
            .await
            .map(StackState::from)
    }

    /// Inline when it fits, otherwise by URL.
    fn template_source(&self, body: String, url: Option<&str>) -> Result<TemplateSource, DeployError> {
        if body.len() <= self.config.inline_template_limit {
            return Ok(TemplateSource::Body(body));
        }
        url.map(|u| TemplateSource::Url(u.to_string())).ok_or_else(|| {
            DeployError::Config(format!(
                "template is {} bytes, over the inline limit of {}, and was not uploaded",
                body.len(),
                self.config.inline_template_limit
            ))
        })
    }
}

fn to_body(template: &Value) -> Result<String, DeployError> {
    serde_json::to_string(template).map_err(|e| DeployError::Manifest(format!("json error: {}", e)))
}

fn policy_body(statements: &[Value]) -> Option<String> {
    if statements.is_empty() {
        return None;
    }
    Some(json!({ "Statement": statements }).to_string())
}

/// IAM capabilities, plus macro expansion when the template has a transform.
pub fn capabilities(template: &Value) -> Vec<String> {
    let mut capabilities = vec![
        "CAPABILITY_IAM".to_string(),
        "CAPABILITY_NAMED_IAM".to_string(),
    ];
    if has_transform(template) {
        capabilities.push("CAPABILITY_AUTO_EXPAND".to_string());
    }
    capabilities
}

/// `STAGE` first, then user tags. A user key matching an earlier key
/// case-insensitively replaces it.
pub fn merge_tags(stage: &str, user: &BTreeMap<String, String>) -> Vec<Tag> {
    let mut tags = vec![Tag {
        key: STAGE_TAG.to_string(),
        value: stage.to_string(),
    }];
    for (key, value) in user {
        let tag = Tag {
            key: key.clone(),
            value: value.clone(),
        };
        match tags.iter_mut().find(|t| t.key.eq_ignore_ascii_case(key)) {
            Some(existing) => *existing = tag,
            None => tags.push(tag),
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::memory::MemoryStackBackend;
    use crate::monitor::tests::RecordingClock;
    use crate::store::MemoryTemplateStore;
    use crate::types::StackStatus;

    fn manifest() -> DeploymentManifest {
        DeploymentManifest::new(json!({
            "Resources": { "Fn": { "Type": "AWS::Lambda::Function" } }
        }))
        .with_bootstrap(json!({
            "Resources": { "ServerlessDeploymentBucket": { "Type": "AWS::S3::Bucket" } }
        }))
    }

    #[test]
    fn test_merge_tags_user_wins_case_insensitive() {
        let user = BTreeMap::from([
            ("stage".to_string(), "custom".to_string()),
            ("team".to_string(), "core".to_string()),
        ]);
        let tags = merge_tags("dev", &user);
        assert_eq!(
            tags,
            vec![
                Tag { key: "stage".into(), value: "custom".into() },
                Tag { key: "team".into(), value: "core".into() },
            ]
        );
        assert_eq!(merge_tags("dev", &BTreeMap::new())[0].value, "dev");
    }

    #[test]
    fn test_capabilities_with_transform() {
        assert_eq!(capabilities(&json!({})).len(), 2);
        let caps = capabilities(&json!({ "Transform": "AWS::Serverless-2016-10-31" }));
        assert_eq!(caps.last().map(String::as_str), Some("CAPABILITY_AUTO_EXPAND"));
    }

    #[tokio::test]
    async fn test_absent_stack_is_created_inline() {
        let stacks = MemoryStackBackend::new();
        let templates = MemoryTemplateStore::new();
        let clock = RecordingClock::default();
        let config = DeployConfig::new("svc", "dev");
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        let phase = orchestrator.prepare(&manifest()).await.unwrap();
        assert_eq!(phase, StackPhase::Created);

        let creates = stacks.creates();
        assert_eq!(creates.len(), 1);
        let TemplateSource::Body(body) = &creates[0].template else {
            panic!("expected inline template");
        };
        assert!(body.contains("ServerlessDeploymentBucket"));
        assert_eq!(creates[0].tags[0].key, "STAGE");
        assert_eq!(
            templates.load(CREATE_TEMPLATE_FILE_NAME).await.unwrap().as_deref(),
            Some(body.as_str())
        );
        assert_eq!(stacks.status("svc-dev"), Some(StackStatus::CreateComplete));
    }

    #[tokio::test]
    async fn test_existing_stack_is_updated() {
        let stacks = MemoryStackBackend::new()
            .with_stack("svc-dev", StackStatus::CreateComplete)
            .with_output("svc-dev", "ServiceEndpoint", "https://example.test");
        let templates = MemoryTemplateStore::new();
        let clock = RecordingClock::default();
        let mut config = DeployConfig::new("svc", "dev");
        config.stack_policy = vec![json!({ "Effect": "Allow", "Action": "Update:*" })];
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        let template = manifest().template;
        let applied = orchestrator
            .create_or_update(&manifest(), &template, Some("memory://b/k"))
            .await
            .unwrap();

        let Applied::Updated(state) = applied else {
            panic!("expected an update, got {:?}", applied);
        };
        assert_eq!(state.status, StackStatus::UpdateComplete);
        assert_eq!(
            state.outputs.get("ServiceEndpoint").map(String::as_str),
            Some("https://example.test")
        );
        assert_eq!(stacks.creates().len(), 0);
        let updates = stacks.updates();
        assert_eq!(
            updates[0].stack_policy_body.as_deref(),
            Some(r#"{"Statement":[{"Action":"Update:*","Effect":"Allow"}]}"#)
        );
        assert!(templates.load(UPDATE_TEMPLATE_FILE_NAME).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_updates_is_success_without_monitoring() {
        let stacks = MemoryStackBackend::new().with_stack("svc-dev", StackStatus::UpdateComplete);
        stacks.fail_on(
            "update_stack",
            ProviderError::new("No updates are to be performed."),
        );
        let templates = MemoryTemplateStore::new();
        let clock = RecordingClock::default();
        let config = DeployConfig::new("svc", "dev");
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        let applied = orchestrator
            .apply(StackPhase::Exists, &json!({ "Resources": {} }), None)
            .await
            .unwrap();
        assert!(matches!(applied, Applied::Unchanged(_)));
        // the history read before the call, and no polling
        assert_eq!(stacks.call_count("describe_stack_events"), 1);
    }

    /// Clock an hour ahead of the provider's event timestamps.
    struct AheadClock;

    impl Clock for AheadClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::Utc::now() + chrono::Duration::hours(1)
        }

        fn sleep(&self, _duration: std::time::Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn test_update_finishes_with_local_clock_ahead() {
        let stacks = MemoryStackBackend::new().with_stack("svc-dev", StackStatus::UpdateComplete);
        let templates = MemoryTemplateStore::new();
        let clock = AheadClock;
        let config = DeployConfig::new("svc", "dev");
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        let applied = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            orchestrator.apply(StackPhase::Exists, &manifest().template, None),
        )
        .await
        .expect("monitoring did not finish")
        .unwrap();

        assert!(matches!(applied, Applied::Updated(_)));
        assert_eq!(stacks.call_count("describe_stack_events"), 3);
    }

    #[tokio::test]
    async fn test_earlier_failure_does_not_fail_update() {
        let stacks = MemoryStackBackend::new().with_stack("svc-dev", StackStatus::UpdateRollbackComplete);
        stacks.push_events(
            "svc-dev-id",
            vec![crate::memory::resource_event(
                "svc-dev",
                "Fn",
                "AWS::Lambda::Function",
                "UPDATE_FAILED",
                Some("from the last deploy"),
            )],
        );
        let templates = MemoryTemplateStore::new();
        let clock = RecordingClock::default();
        let config = DeployConfig::new("svc", "dev");
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        let applied = orchestrator
            .apply(StackPhase::Exists, &manifest().template, None)
            .await
            .unwrap();
        assert!(matches!(applied, Applied::Updated(_)));
    }

    #[tokio::test]
    async fn test_external_bucket_defers_create() {
        let stacks = MemoryStackBackend::new();
        let templates = MemoryTemplateStore::new();
        let clock = RecordingClock::default();
        let config = DeployConfig::new("svc", "dev").with_bucket("shared");
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        let phase = orchestrator.prepare(&manifest()).await.unwrap();
        assert_eq!(phase, StackPhase::Deferred);
        assert_eq!(stacks.mutating_calls(), 0);
        assert!(templates.load(CREATE_TEMPLATE_FILE_NAME).await.unwrap().is_some());

        let applied = orchestrator
            .apply(phase, &manifest().template, Some("memory://shared/t.json"))
            .await
            .unwrap();
        assert!(matches!(applied, Applied::Created(_)));
        assert_eq!(
            stacks.creates()[0].template,
            TemplateSource::Url("memory://shared/t.json".into())
        );
    }

    #[tokio::test]
    async fn test_oversized_template_defers_and_needs_url() {
        let stacks = MemoryStackBackend::new();
        let templates = MemoryTemplateStore::new();
        let clock = RecordingClock::default();
        let mut config = DeployConfig::new("svc", "dev");
        config.inline_template_limit = 10;
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        assert_eq!(
            orchestrator.prepare(&manifest()).await.unwrap(),
            StackPhase::Deferred
        );
        let err = orchestrator
            .apply(StackPhase::Exists, &manifest().template, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[tokio::test]
    async fn test_probe_error_aborts_without_mutation() {
        let stacks = MemoryStackBackend::new();
        stacks.fail_on(
            "describe_stack",
            ProviderError::new("Rate exceeded").with_code("Throttling"),
        );
        let templates = MemoryTemplateStore::new();
        let clock = RecordingClock::default();
        let config = DeployConfig::new("svc", "dev");
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        let err = orchestrator.prepare(&manifest()).await.unwrap_err();
        assert_eq!(err.to_string(), "Rate exceeded");
        assert_eq!(stacks.mutating_calls(), 0);
        assert!(templates.file_names().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_writes_templates_only() {
        let stacks = MemoryStackBackend::new().with_stack("svc-dev", StackStatus::CreateComplete);
        let templates = MemoryTemplateStore::new();
        let clock = RecordingClock::default();
        let config = DeployConfig::new("svc", "dev").with_dry_run(true);
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        let applied = orchestrator
            .apply(StackPhase::Exists, &manifest().template, None)
            .await
            .unwrap();
        assert_eq!(applied, Applied::DryRun);
        assert_eq!(stacks.mutating_calls(), 0);
        assert!(templates.load(UPDATE_TEMPLATE_FILE_NAME).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove() {
        let stacks = MemoryStackBackend::new().with_stack("svc-dev", StackStatus::UpdateComplete);
        let templates = MemoryTemplateStore::new();
        let clock = RecordingClock::default();
        let config = DeployConfig::new("svc", "dev");
        let orchestrator = StackOrchestrator::new(&stacks, &templates, &clock, &config);

        assert!(orchestrator.remove().await.unwrap());
        assert_eq!(stacks.status("svc-dev"), None);
        assert!(!orchestrator.remove().await.unwrap());
    }
}
