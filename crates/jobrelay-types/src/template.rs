use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Immutable definition runs are spawned from. Loaded once at startup from
/// the scheduled-job resource and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTemplate {
    pub name: String,
    pub namespace: String,
    /// `spec.jobTemplate.spec` of the scheduled job.
    pub job_spec: Value,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl RunTemplate {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, job_spec: Value) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            job_spec,
            labels: BTreeMap::new(),
        }
    }

    pub fn run_prefix(&self) -> String {
        format!("{}-", self.name)
    }

    /// Builds the run manifest for `run_id`.
    ///
    /// The pod template's `restartPolicy` defaults to `Never` when the
    /// template leaves it unset.
    pub fn manifest_for(&self, run_id: &str) -> Value {
        let mut spec = self.job_spec.clone();
        if let Some(obj) = spec.as_object_mut() {
            let template = obj.entry("template").or_insert_with(|| json!({}));
            if let Some(template) = template.as_object_mut() {
                let pod_spec = template.entry("spec").or_insert_with(|| json!({}));
                if let Some(pod_spec) = pod_spec.as_object_mut() {
                    pod_spec
                        .entry("restartPolicy")
                        .or_insert_with(|| json!("Never"));
                }
            }
        }

        let mut metadata = json!({
            "name": run_id,
            "namespace": self.namespace,
        });
        if !self.labels.is_empty() {
            metadata["labels"] = json!(self.labels);
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": metadata,
            "spec": spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_defaults_restart_policy() {
        let template = RunTemplate::new(
            "nightly",
            "qa",
            json!({"template": {"spec": {"containers": [{"name": "main"}]}}}),
        );
        let manifest = template.manifest_for("nightly-1700000000");
        assert_eq!(manifest["kind"], "Job");
        assert_eq!(manifest["metadata"]["name"], "nightly-1700000000");
        assert_eq!(manifest["metadata"]["namespace"], "qa");
        assert_eq!(manifest["spec"]["template"]["spec"]["restartPolicy"], "Never");
        assert!(manifest["metadata"].get("labels").is_none());
    }

    #[test]
    fn manifest_keeps_explicit_restart_policy_and_labels() {
        let mut template = RunTemplate::new(
            "nightly",
            "qa",
            json!({"template": {"spec": {"restartPolicy": "OnFailure"}}}),
        );
        template
            .labels
            .insert("app".to_string(), "metadata-qa".to_string());
        let manifest = template.manifest_for("nightly-1");
        assert_eq!(
            manifest["spec"]["template"]["spec"]["restartPolicy"],
            "OnFailure"
        );
        assert_eq!(manifest["metadata"]["labels"]["app"], "metadata-qa");
    }
}
