//! Stack Deploy Library
//!
//! Standalone, trait-based deployment engine for serverless stacks:
//! upload build artifacts, create or update the stack, watch it settle,
//! reclaim old artifacts.
//!
//! # Design
//!
//! This library provides the deployment logic without coupling to any
//! SDK, credential chain, or transport. You implement [`StackBackend`]
//! (the control plane) and [`BlobBackend`] (the object store) with your
//! infrastructure, and the workflow engine handles the rest. In-memory
//! implementations of both live in [`memory`].
//!
//! # Usage
//!
//! ```ignore
//! use stack_deploy::{
//!     ArtifactBundle, DeployConfig, DeploymentManifest, DeploymentWorkflow,
//!     FileTemplateStore, DeploymentOutcome,
//! };
//!
//! // Implement StackBackend and BlobBackend for your infrastructure
//! let stacks = MyControlPlane::new();
//! let blobs = MyObjectStore::new();
//!
//! let config = DeployConfig::new("my-service", "dev");
//! let templates = FileTemplateStore::from_config(&config);
//! let workflow = DeploymentWorkflow::new(&stacks, &blobs, &templates, config);
//!
//! let bundle = ArtifactBundle::from_dir(".serverless").await?;
//! match workflow.deploy(manifest, bundle).await? {
//!     DeploymentOutcome::Deployed(stack) => println!("deployed {}", stack.name),
//!     DeploymentOutcome::Skipped(decision) => println!("skipped: {}", decision.reason),
//!     other => println!("{:?}", other),
//! }
//! ```

pub mod artifacts;
pub mod backend;
pub mod changes;
pub mod config;
pub mod error;
pub mod hashing;
pub mod manifest;
pub mod memory;
pub mod monitor;
pub mod naming;
pub mod orchestrator;
pub mod retention;
pub mod state;
pub mod store;
pub mod types;
pub mod workflow;

// Re-export the main types at crate root for convenience
pub use artifacts::{
    ArtifactBundle, ArtifactStore, CodeArtifact, DeploymentBucket, PreparedArtifact,
    PreparedDeployment,
};
pub use backend::{BlobBackend, StackBackend};
pub use changes::{ChangeDecision, ChangeDetector};
pub use config::DeployConfig;
pub use error::{DeployError, ProviderError};
pub use manifest::{canonical::to_canonical_json, DeploymentManifest};
pub use memory::{MemoryBlobStore, MemoryStackBackend};
pub use monitor::{Clock, MonitorReport, StackMonitor, SystemClock};
pub use orchestrator::{Applied, StackOrchestrator, StackPhase, StackPresence};
pub use retention::{ReclaimPlan, RemoteDeploymentRecord, RetentionCollector};
pub use state::{DeploymentOutcome, DeploymentState, Step};
#[cfg(feature = "file-storage")]
pub use store::FileTemplateStore;
pub use store::{MemoryTemplateStore, TemplateStore};
pub use types::*;
pub use workflow::{DeploymentWorkflow, InputRequired, StepResult};
