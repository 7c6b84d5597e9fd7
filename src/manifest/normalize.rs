//! Template normalization for change detection.
//!
//! A template bound for a new deployment differs from the previous one in
//! ways that carry no meaning: artifact keys embed the timestamped
//! deployment directory, and some compilers suffix the API deployment
//! resource with a random token. Both are erased before hashing. The
//! suffix is only erased when the template has a single such resource,
//! so templates with several never collapse into one entry.

use super::canonical::to_canonical_json;
use super::{artifact_key_paths, get_path};
use crate::error::DeployError;
use crate::hashing::sha256_base64;
use crate::naming::is_deployment_directory;
use serde_json::{Map, Value};

const API_DEPLOYMENT_PREFIX: &str = "ApiGatewayDeployment";

/// Template with volatile fields erased.
pub fn normalize_template(template: &Value) -> Value {
    let mut normalized = template.clone();
    if let Some(resources) = normalized
        .get_mut("Resources")
        .and_then(Value::as_object_mut)
    {
        let single_api_deployment = resources
            .keys()
            .filter(|id| id.starts_with(API_DEPLOYMENT_PREFIX))
            .count()
            == 1;
        let renamed: Map<String, Value> = std::mem::take(resources)
            .into_iter()
            .map(|(logical_id, mut resource)| {
                blank_volatile_keys(&mut resource);
                if single_api_deployment && logical_id.starts_with(API_DEPLOYMENT_PREFIX) {
                    (API_DEPLOYMENT_PREFIX.to_string(), resource)
                } else {
                    (logical_id, resource)
                }
            })
            .collect();
        *resources = renamed;
    }
    normalized
}

/// Hash of the normalized, canonically serialized template.
pub fn normalized_hash(template: &Value) -> Result<String, DeployError> {
    let canonical = to_canonical_json(&normalize_template(template))?;
    Ok(sha256_base64(canonical.as_bytes()))
}

/// Keys inside a deployment directory change on every run. Content
/// addressed keys are derived from the bytes and stay.
fn blank_volatile_keys(resource: &mut Value) {
    for path in artifact_key_paths() {
        let Some((last, parents)) = path.split_last() else {
            continue;
        };
        let volatile = get_path(resource, path)
            .and_then(Value::as_str)
            .is_some_and(|key| key.split('/').any(is_deployment_directory));
        if !volatile {
            continue;
        }
        if let Some(Value::Object(parent)) = get_path_mut(resource, parents) {
            parent.insert(last.to_string(), Value::String(String::new()));
        }
    }
}

fn get_path_mut<'v>(value: &'v mut Value, path: &[&str]) -> Option<&'v mut Value> {
    path.iter()
        .try_fold(value, |current, segment| current.get_mut(*segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(key: &str) -> Value {
        json!({
            "Resources": {
                "HelloLambdaFunction": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": { "Code": { "S3Key": key }, "Handler": "h" }
                }
            }
        })
    }

    #[test]
    fn test_directory_keys_do_not_change_hash() {
        let a = template("serverless/svc/dev/1000-2024-01-01T00:00:00.000Z/hello.zip");
        let b = template("serverless/svc/dev/2000-2024-01-02T00:00:00.000Z/hello.zip");
        assert_eq!(normalized_hash(&a).unwrap(), normalized_hash(&b).unwrap());
    }

    #[test]
    fn test_content_addressed_keys_change_hash() {
        let a = template("serverless/svc/dev/code-artifacts/aaaa.zip");
        let b = template("serverless/svc/dev/code-artifacts/bbbb.zip");
        assert_ne!(normalized_hash(&a).unwrap(), normalized_hash(&b).unwrap());
    }

    #[test]
    fn test_api_deployment_suffix_ignored() {
        let a = json!({ "Resources": { "ApiGatewayDeployment1700000000": { "Type": "X" } } });
        let b = json!({ "Resources": { "ApiGatewayDeployment1800000000": { "Type": "X" } } });
        assert_eq!(normalized_hash(&a).unwrap(), normalized_hash(&b).unwrap());
    }

    #[test]
    fn test_several_api_deployments_keep_their_names() {
        let a = json!({ "Resources": {
            "ApiGatewayDeploymentA": { "Type": "X", "Properties": { "StageName": "one" } },
            "ApiGatewayDeploymentB": { "Type": "X", "Properties": { "StageName": "two" } }
        } });
        let b = json!({ "Resources": {
            "ApiGatewayDeploymentA": { "Type": "X", "Properties": { "StageName": "two" } },
            "ApiGatewayDeploymentB": { "Type": "X", "Properties": { "StageName": "two" } }
        } });
        assert_ne!(normalized_hash(&a).unwrap(), normalized_hash(&b).unwrap());

        let normalized = normalize_template(&a);
        assert_eq!(normalized["Resources"].as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_semantic_change_changes_hash() {
        let a = template("k");
        let mut b = template("k");
        b["Resources"]["HelloLambdaFunction"]["Properties"]["Handler"] = json!("other");
        assert_ne!(normalized_hash(&a).unwrap(), normalized_hash(&b).unwrap());
    }

    #[test]
    fn test_normalize_leaves_input_untouched() {
        let key = "serverless/svc/dev/1000-2024-01-01T00:00:00.000Z/hello.zip";
        let original = template(key);
        let normalized = normalize_template(&original);
        assert_eq!(
            original["Resources"]["HelloLambdaFunction"]["Properties"]["Code"]["S3Key"],
            key
        );
        assert_eq!(
            normalized["Resources"]["HelloLambdaFunction"]["Properties"]["Code"]["S3Key"],
            ""
        );
    }
}
