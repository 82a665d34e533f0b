//! Cluster access seam
//!
//! Everything the engine does against the cluster goes through
//! [`ClusterClient`]. [`KubeCluster`] talks to a real API server,
//! [`InMemoryCluster`] backs tests and dry runs.

pub mod health;
mod kubernetes;
mod memory;

pub use kubernetes::{ConnectOptions, KubeCluster};
pub use health::{ClusterHealth, NodeHealth};
pub use memory::InMemoryCluster;

use crate::error::ClusterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Result type for cluster calls
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// API version + kind pair identifying a resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKind {
    pub api_version: String,
    pub kind: String,
    /// False for cluster-scoped kinds
    #[serde(default = "default_namespaced")]
    pub namespaced: bool,
}

fn default_namespaced() -> bool {
    true
}

impl ResourceKind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespaced: true,
        }
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }

    /// Kind declared by a manifest
    pub fn of_manifest(manifest: &serde_json::Value) -> ClusterResult<Self> {
        let api_version = manifest
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClusterError::InvalidObject("manifest has no apiVersion".into()))?;
        let kind = manifest
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClusterError::InvalidObject("manifest has no kind".into()))?;
        Ok(Self::new(api_version, kind))
    }

    /// `(group, version)`; the core group is the empty string
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }

    /// Kinds matched regardless of scope flag
    pub fn same_type(&self, other: &ResourceKind) -> bool {
        self.api_version == other.api_version && self.kind == other.kind
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Reference to one live object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ResourceKind, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace,
            name: name.into(),
        }
    }

    /// Reference for a manifest carrying `metadata.name` (and optionally `metadata.namespace`)
    pub fn of_manifest(manifest: &serde_json::Value) -> ClusterResult<Self> {
        let kind = ResourceKind::of_manifest(manifest)?;
        let metadata = manifest.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClusterError::InvalidObject("manifest has no metadata.name".into()))?;
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(Self::new(kind, namespace, name))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind.kind, self.name),
        }
    }
}

/// Namespace creation request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Operations the engine needs from a cluster
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a namespace; `AlreadyExists` when it is already present
    async fn create_namespace(&self, spec: &NamespaceSpec) -> ClusterResult<()>;

    /// Names of namespaces matching a label selector
    async fn list_namespaces(&self, label_selector: &str) -> ClusterResult<Vec<String>>;

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()>;

    /// Create the object described by `manifest`
    async fn create(&self, manifest: &serde_json::Value) -> ClusterResult<ObjectRef>;

    /// Current state of an object, `None` when it does not exist
    async fn get(&self, object: &ObjectRef) -> ClusterResult<Option<serde_json::Value>>;

    /// Objects of `kind` matching a label selector; every namespace when `namespace` is `None`
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> ClusterResult<Vec<ObjectRef>>;

    /// Request deletion; `NotFound` when the object is already gone
    async fn delete(&self, object: &ObjectRef) -> ClusterResult<()>;

    /// Every kind that supports list and delete
    async fn deletable_kinds(&self) -> ClusterResult<Vec<ResourceKind>>;

    /// Readiness of every node
    async fn nodes(&self) -> ClusterResult<Vec<NodeHealth>>;
}

/// Insert `labels` into `metadata.labels`, creating the map when missing
pub fn stamp_labels(manifest: &mut serde_json::Value, labels: &BTreeMap<String, String>) {
    let Some(obj) = manifest.as_object_mut() else {
        return;
    };
    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| serde_json::json!({}));
    if !metadata.is_object() {
        *metadata = serde_json::json!({});
    }
    if let Some(metadata) = metadata.as_object_mut() {
        let existing = metadata
            .entry("labels")
            .or_insert_with(|| serde_json::json!({}));
        if !existing.is_object() {
            *existing = serde_json::json!({});
        }
        if let Some(map) = existing.as_object_mut() {
            for (k, v) in labels {
                map.insert(k.clone(), serde_json::Value::String(v.clone()));
            }
        }
    }
}

/// Parse `k=v,k2=v2` into a map; only equality terms are supported
pub fn parse_label_selector(selector: &str) -> ClusterResult<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = term
            .split_once("==")
            .or_else(|| term.split_once('='))
            .ok_or_else(|| ClusterError::InvalidObject(format!("unsupported selector term {term:?}")))?;
        labels.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(labels)
}

/// Whether `labels` satisfies every equality term of `selector`
pub fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Labels of a manifest as a map
pub fn manifest_labels(manifest: &serde_json::Value) -> BTreeMap<String, String> {
    manifest
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_group_version() {
        assert_eq!(ResourceKind::new("v1", "Pod").group_version(), ("", "v1"));
        assert_eq!(
            ResourceKind::new("apps/v1", "Deployment").group_version(),
            ("apps", "v1")
        );
    }

    #[test]
    fn test_object_ref_of_manifest() {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm-1", "namespace": "ns-1"}
        });
        let obj = ObjectRef::of_manifest(&manifest).unwrap();
        assert_eq!(obj.name, "cm-1");
        assert_eq!(obj.namespace.as_deref(), Some("ns-1"));
        assert_eq!(obj.to_string(), "ConfigMap ns-1/cm-1");
        assert!(ObjectRef::of_manifest(&json!({"kind": "Pod"})).is_err());
    }

    #[test]
    fn test_stamp_labels_merges() {
        let mut manifest = json!({"metadata": {"labels": {"app": "web"}}});
        let labels = BTreeMap::from([("burner-uuid".to_string(), "abc".to_string())]);
        stamp_labels(&mut manifest, &labels);
        assert_eq!(manifest["metadata"]["labels"]["app"], "web");
        assert_eq!(manifest["metadata"]["labels"]["burner-uuid"], "abc");

        let mut bare = json!({"kind": "Pod"});
        stamp_labels(&mut bare, &labels);
        assert_eq!(bare["metadata"]["labels"]["burner-uuid"], "abc");
    }

    #[test]
    fn test_parse_label_selector() {
        let sel = parse_label_selector("app=web, tier==front").unwrap();
        assert_eq!(sel.get("app").map(String::as_str), Some("web"));
        assert_eq!(sel.get("tier").map(String::as_str), Some("front"));
        assert!(parse_label_selector("app").is_err());
        assert!(parse_label_selector("").unwrap().is_empty());

        let labels = BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "front".to_string()),
        ]);
        assert!(selector_matches(&sel, &labels));
        assert!(!selector_matches(&parse_label_selector("app=db").unwrap(), &labels));
    }
}
