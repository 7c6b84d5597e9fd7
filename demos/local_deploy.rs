//! Local deployment walkthrough.
//!
//! Runs the deployment workflow against the in-memory backends: a first
//! deploy, a redeploy of the same build, a changed build, then removal.
//!
//! Usage:
//!   cargo run --example local_deploy
//!
//! Environment:
//!   RUST_LOG  - log filter (default: info)

use serde_json::json;
use stack_deploy::memory::owned_bucket_name;
use stack_deploy::{
    ArtifactBundle, DeployConfig, DeploymentManifest, DeploymentOutcome, DeploymentWorkflow,
    FileTemplateStore, MemoryBlobStore, MemoryStackBackend, StepResult,
};
use std::time::Duration;

fn manifest() -> DeploymentManifest {
    DeploymentManifest::new(json!({
        "Resources": {
            "ServerlessDeploymentBucket": { "Type": "AWS::S3::Bucket" },
            "HelloLambdaFunction": {
                "Type": "AWS::Lambda::Function",
                "Properties": { "Handler": "handler.hello", "Runtime": "nodejs20.x" }
            }
        },
        "Outputs": {
            "HelloLambdaFunctionName": { "Value": { "Ref": "HelloLambdaFunction" } }
        }
    }))
    .with_bootstrap(json!({
        "Resources": { "ServerlessDeploymentBucket": { "Type": "AWS::S3::Bucket" } }
    }))
    .with_artifact("HelloLambdaFunction", "hello.zip")
}

fn bundle(source: &str) -> ArtifactBundle {
    ArtifactBundle::new().with_artifact("hello.zip", source.as_bytes().to_vec())
}

fn describe(outcome: &DeploymentOutcome) -> String {
    match outcome {
        DeploymentOutcome::Deployed(stack) => format!("deployed {} ({})", stack.name, stack.status),
        DeploymentOutcome::Unchanged(stack) => format!("no stack changes ({})", stack.status),
        DeploymentOutcome::Skipped(decision) => format!("skipped: {}", decision.reason),
        DeploymentOutcome::DryRun => "dry run".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let local_dir = tempfile::tempdir()?;
    let config = DeployConfig::new("svc", "dev")
        .with_local_dir(local_dir.path())
        .with_poll_interval(Duration::from_millis(10))
        .with_tag("team", "platform");

    let stacks = MemoryStackBackend::new();
    let blobs = MemoryBlobStore::new().with_bucket(&owned_bucket_name(&config.stack_name()));
    let templates = FileTemplateStore::from_config(&config);
    let workflow = DeploymentWorkflow::new(&stacks, &blobs, &templates, config);

    println!("═══ Stack Deploy (in memory) ═══");

    // Step through the first deploy to show the state machine.
    let mut state = workflow.new_state(manifest(), bundle("exports.hello = () => 1"));
    for i in 0..20 {
        println!("step {}: {}", i, state.step.name());
        match workflow.advance(&mut state).await? {
            StepResult::Continue => continue,
            StepResult::Complete(outcome) => {
                println!("  {}", describe(&outcome));
                break;
            }
            StepResult::NeedsInput(input) => {
                return Err(format!("unexpected input required: {:?}", input).into());
            }
            StepResult::Failed(reason) => {
                return Err(format!("workflow failed: {}", reason).into());
            }
        }
    }

    // Deployment directories are named by the millisecond.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let again = workflow
        .deploy(manifest(), bundle("exports.hello = () => 1"))
        .await?;
    println!("redeploy: {}", describe(&again));

    tokio::time::sleep(Duration::from_millis(5)).await;
    let changed = workflow
        .deploy(manifest(), bundle("exports.hello = () => 2"))
        .await?;
    println!("changed build: {}", describe(&changed));

    println!(
        "bucket holds {} object(s), templates in {}",
        blobs.keys(&owned_bucket_name("svc-dev")).len(),
        templates.dir().display()
    );

    if workflow.remove().await? {
        println!("removed svc-dev");
    }
    println!("provider calls: {:?}", stacks.calls());

    Ok(())
}
