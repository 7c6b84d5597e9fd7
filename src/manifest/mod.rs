//! Deployment manifest: the compiled template and its artifact locators.
//!
//! The template compiler hands over a resource template plus a map from
//! logical resource name to artifact file. Once the deployment directory
//! is known, [`DeploymentManifest::bind`] writes the final storage keys
//! into the template. [`referenced_artifact_keys`] reads them back out of
//! any template, which is how retention discovers what a historical
//! deployment still needs.

pub mod canonical;
pub mod normalize;

use crate::error::DeployError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const LAYER_RESOURCE_TYPE: &str = "AWS::Lambda::LayerVersion";
const CODE_KEY_PATH: [&str; 3] = ["Properties", "Code", "S3Key"];
const CONTENT_KEY_PATH: [&str; 3] = ["Properties", "Content", "S3Key"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentManifest {
    /// Compiled resource template.
    pub template: Value,
    /// Minimal template for the very first create of a stack that owns
    /// its deployment bucket.
    #[serde(default)]
    pub bootstrap_template: Option<Value>,
    /// Logical resource name -> artifact file name.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

impl DeploymentManifest {
    pub fn new(template: Value) -> Self {
        Self {
            template,
            bootstrap_template: None,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn with_bootstrap(mut self, template: Value) -> Self {
        self.bootstrap_template = Some(template);
        self
    }

    pub fn with_artifact(mut self, logical_id: impl Into<String>, file: impl Into<String>) -> Self {
        self.artifacts.insert(logical_id.into(), file.into());
        self
    }

    /// Template used for the first inline create.
    pub fn create_template(&self) -> &Value {
        self.bootstrap_template.as_ref().unwrap_or(&self.template)
    }

    /// Copy of the template with every locator replaced by its storage key.
    ///
    /// `keys` maps artifact file name to storage key. A locator without a
    /// key, or pointing at a resource the template doesn't define, is an
    /// error.
    pub fn bind(&self, keys: &BTreeMap<String, String>) -> Result<Value, DeployError> {
        let mut template = self.template.clone();
        let resources = template
            .get_mut("Resources")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| DeployError::Manifest("template has no Resources".into()))?;

        for (logical_id, file) in &self.artifacts {
            let key = keys.get(file).ok_or_else(|| {
                DeployError::Manifest(format!(
                    "artifact \"{}\" referenced by {} is not part of the bundle",
                    file, logical_id
                ))
            })?;
            let resource = resources.get_mut(logical_id).ok_or_else(|| {
                DeployError::Manifest(format!(
                    "artifact locator for unknown resource {}",
                    logical_id
                ))
            })?;
            let path = key_path(resource);
            set_path(resource, path, Value::String(key.clone()))?;
        }

        Ok(template)
    }
}

/// Whether the template asks for macro expansion.
pub fn has_transform(template: &Value) -> bool {
    template.get("Transform").is_some()
}

/// Every artifact storage key the template's resources point at in
/// `bucket`.
///
/// A locator naming another bucket by literal is left out. One whose
/// bucket is an intrinsic (`Ref`, `Fn::GetAtt`) or missing is assumed to
/// mean the deployment bucket.
pub fn referenced_artifact_keys(template: &Value, bucket: &str) -> BTreeSet<String> {
    let Some(resources) = template.get("Resources").and_then(Value::as_object) else {
        return BTreeSet::new();
    };

    resources
        .values()
        .flat_map(|resource| {
            artifact_key_paths()
                .into_iter()
                .filter_map(move |path| locator_key(resource, path, bucket))
        })
        .collect()
}

fn locator_key(resource: &Value, path: &[&str], bucket: &str) -> Option<String> {
    let (_, parents) = path.split_last()?;
    let key = get_path(resource, path)?.as_str().filter(|k| !k.is_empty())?;
    let locator = get_path(resource, parents)?;
    match locator.get("S3Bucket") {
        Some(Value::String(named)) if named != bucket => None,
        _ => Some(key.to_string()),
    }
}

/// Where a resource of this type keeps its artifact key.
fn key_path(resource: &Value) -> &'static [&'static str] {
    match resource.get("Type").and_then(Value::as_str) {
        Some(LAYER_RESOURCE_TYPE) => &CONTENT_KEY_PATH,
        _ => &CODE_KEY_PATH,
    }
}

pub(crate) fn artifact_key_paths() -> [&'static [&'static str]; 2] {
    [&CODE_KEY_PATH, &CONTENT_KEY_PATH]
}

pub(crate) fn get_path<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| current.get(*segment))
}

fn set_path(value: &mut Value, path: &[&str], leaf: Value) -> Result<(), DeployError> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(());
    };
    let mut current = value;
    for segment in parents {
        let object = current
            .as_object_mut()
            .ok_or_else(|| DeployError::Manifest(format!("\"{}\" is not an object", segment)))?;
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    current
        .as_object_mut()
        .ok_or_else(|| DeployError::Manifest(format!("cannot set \"{}\"", last)))?
        .insert(last.to_string(), leaf);
    Ok(())
}
