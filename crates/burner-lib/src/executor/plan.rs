//! Object naming, labelling and placeholder substitution

use crate::cluster::{stamp_labels, NamespaceSpec};
use crate::config::Job;
use crate::error::{BurnerError, Result};
use crate::models::{RunId, JOB_INDEX_LABEL, JOB_LABEL, RUN_ID_LABEL};
use serde_json::Value;
use std::collections::BTreeMap;

/// Kinds that never carry a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PriorityClass",
    "IngressClass",
    "RuntimeClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

/// One object the job will create
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedObject {
    pub iteration: usize,
    pub replica: usize,
    pub name: String,
    pub namespace: Option<String>,
    pub manifest: Value,
    /// Wait for readiness after creation
    pub wait: bool,
}

/// Labels stamped on everything a job creates
pub fn run_labels(run_id: &RunId, job_name: &str, job_index: usize) -> BTreeMap<String, String> {
    BTreeMap::from([
        (RUN_ID_LABEL.to_string(), run_id.to_string()),
        (JOB_LABEL.to_string(), job_name.to_string()),
        (JOB_INDEX_LABEL.to_string(), job_index.to_string()),
    ])
}

/// `<base>-<iteration>-<replica>`
pub fn object_name(base: &str, iteration: usize, replica: usize) -> String {
    format!("{base}-{iteration}-{replica}")
}

/// Values for the fixed placeholders
#[derive(Debug, Clone)]
pub struct Placeholders<'a> {
    pub iteration: usize,
    pub replica: usize,
    pub job_name: &'a str,
    pub run_id: &'a RunId,
}

impl Placeholders<'_> {
    fn pairs(&self) -> [(&'static str, String); 4] {
        [
            ("Iteration", self.iteration.to_string()),
            ("Replica", self.replica.to_string()),
            ("JobName", self.job_name.to_string()),
            ("UUID", self.run_id.to_string()),
        ]
    }

    /// Replace `{{.Name}}` (and `{{ .Name }}`) occurrences in `text`
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (name, value) in self.pairs() {
            out = out
                .replace(&format!("{{{{.{name}}}}}"), &value)
                .replace(&format!("{{{{ .{name} }}}}"), &value);
        }
        out
    }
}

/// Substitute placeholders in every string of a manifest
pub fn render(manifest: &Value, vars: &Placeholders<'_>) -> Result<Value> {
    let text = serde_json::to_string(manifest)
        .map_err(|e| BurnerError::config(format!("cannot serialize manifest: {e}")))?;
    serde_json::from_str(&vars.apply(&text))
        .map_err(|e| BurnerError::config(format!("manifest invalid after substitution: {e}")))
}

fn is_cluster_scoped(manifest: &Value) -> bool {
    manifest
        .get("kind")
        .and_then(|k| k.as_str())
        .is_some_and(|k| CLUSTER_SCOPED_KINDS.contains(&k))
}

/// Namespace created for `iteration`
pub fn namespace_spec(job: &Job, iteration: usize, run_id: &RunId, job_index: usize) -> NamespaceSpec {
    let mut labels = job.namespace_labels.clone();
    labels.extend(run_labels(run_id, &job.name, job_index));
    NamespaceSpec {
        name: job.namespace_for(iteration),
        labels,
        annotations: job.namespace_annotations.clone(),
    }
}

/// Objects of one iteration, in template then replica order
pub fn plan_iteration(
    job: &Job,
    iteration: usize,
    run_id: &RunId,
    job_index: usize,
) -> Result<Vec<PlannedObject>> {
    let labels = run_labels(run_id, &job.name, job_index);
    let namespace = job.namespace_for(iteration);
    let mut planned = Vec::new();
    for template in &job.objects {
        let manifest = template.manifest().ok_or_else(|| {
            BurnerError::config(format!("job {}: object template was not resolved", job.name))
        })?;
        let base = template.base_name();
        for replica in 1..=template.replicas {
            let vars = Placeholders {
                iteration,
                replica,
                job_name: &job.name,
                run_id,
            };
            let mut rendered = render(manifest, &vars)?;
            let name = object_name(&base, iteration, replica);
            let scoped_ns = (!is_cluster_scoped(&rendered)).then(|| namespace.clone());
            stamp_labels(&mut rendered, &labels);
            if let Some(meta) = rendered.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("name".to_string(), Value::String(name.clone()));
                match &scoped_ns {
                    Some(ns) => {
                        meta.insert("namespace".to_string(), Value::String(ns.clone()));
                    }
                    None => {
                        meta.remove("namespace");
                    }
                }
            }
            planned.push(PlannedObject {
                iteration,
                replica,
                name,
                namespace: scoped_ns,
                manifest: rendered,
                wait: template.wait.unwrap_or(job.wait_for_ready),
            });
        }
    }
    Ok(planned)
}
