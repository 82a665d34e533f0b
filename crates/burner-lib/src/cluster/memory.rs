//! In-process cluster used by tests and `--dry-run`
//!
//! Objects are kept in a map keyed by kind, namespace and name. Status is
//! synthesized on read so readiness checks behave like against a real API
//! server, and a handful of fault knobs (failing creates, slow deletions,
//! objects that never become ready, unreachable API) drive error paths.

use super::{
    manifest_labels, parse_label_selector, selector_matches, ClusterClient, ClusterResult,
    NamespaceSpec, NodeHealth, ObjectRef, ResourceKind,
};
use crate::error::ClusterError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

type ObjectKey = (String, String, Option<String>, String);

fn key_of(obj: &ObjectRef) -> ObjectKey {
    (
        obj.kind.api_version.clone(),
        obj.kind.kind.clone(),
        obj.namespace.clone(),
        obj.name.clone(),
    )
}

#[derive(Debug, Clone)]
struct StoredObject {
    reference: ObjectRef,
    manifest: Value,
    ready_at: Option<Instant>,
    deleting_at: Option<Instant>,
}

#[derive(Debug, Clone)]
struct StoredNamespace {
    labels: BTreeMap<String, String>,
    deleting_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_names: HashSet<String>,
    failing_deletes: HashSet<String>,
    create_budget: Option<usize>,
    unready_kinds: HashSet<String>,
    ready_delay: Duration,
    delete_delay: Duration,
    create_latency: Duration,
    delete_latency: Duration,
    unreachable: bool,
}

#[derive(Debug)]
struct State {
    namespaces: BTreeMap<String, StoredNamespace>,
    objects: BTreeMap<ObjectKey, StoredObject>,
    kinds: BTreeSet<ResourceKind>,
    nodes: Vec<NodeHealth>,
    faults: Faults,
    create_calls: usize,
    delete_calls: usize,
    peak_live: usize,
}

impl State {
    /// Drop everything whose deletion grace period has passed
    fn reap(&mut self, now: Instant) {
        let gone: Vec<String> = self
            .namespaces
            .iter()
            .filter(|(_, ns)| ns.deleting_at.is_some_and(|t| now >= t))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &gone {
            self.namespaces.remove(name);
        }
        self.objects.retain(|_, obj| {
            if obj.deleting_at.is_some_and(|t| now >= t) {
                return false;
            }
            match &obj.reference.namespace {
                Some(ns) => !gone.contains(ns),
                None => true,
            }
        });
    }

    fn live_objects(&self) -> usize {
        self.objects
            .values()
            .filter(|o| o.deleting_at.is_none())
            .count()
    }
}

/// Cluster simulated in memory
#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Empty cluster with a single Ready node
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                namespaces: BTreeMap::new(),
                objects: BTreeMap::new(),
                kinds: BTreeSet::new(),
                nodes: vec![NodeHealth::ready("in-memory-node")],
                faults: Faults::default(),
                create_calls: 0,
                delete_calls: 0,
                peak_live: 0,
            }),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a poisoned lock only means a test panicked mid-call; the data is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates of an object with this exact name fail with a server error
    pub fn fail_creates_named(&self, name: impl Into<String>) {
        self.lock().faults.failing_names.insert(name.into());
    }

    /// Every create past the first `budget` calls fails with a server error
    pub fn fail_creates_after(&self, budget: usize) {
        self.lock().faults.create_budget = Some(budget);
    }

    /// Deletes of an object with this exact name fail with a server error
    pub fn fail_deletes_named(&self, name: impl Into<String>) {
        self.lock().faults.failing_deletes.insert(name.into());
    }

    /// Objects of this kind never report ready
    pub fn never_ready(&self, kind: impl Into<String>) {
        self.lock().faults.unready_kinds.insert(kind.into());
    }

    /// Delay between creation and readiness
    pub fn set_ready_delay(&self, delay: Duration) {
        self.lock().faults.ready_delay = delay;
    }

    /// Time a deleted object or namespace stays terminating
    pub fn set_delete_delay(&self, delay: Duration) {
        self.lock().faults.delete_delay = delay;
    }

    /// Latency added to every delete call before it takes effect
    pub fn set_delete_latency(&self, latency: Duration) {
        self.lock().faults.delete_latency = latency;
    }

    /// Latency added to every create call
    pub fn set_create_latency(&self, latency: Duration) {
        self.lock().faults.create_latency = latency;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().faults.unreachable = unreachable;
    }

    pub fn set_nodes(&self, nodes: Vec<NodeHealth>) {
        self.lock().nodes = nodes;
    }

    /// Objects currently stored, terminating ones included
    pub fn object_count(&self) -> usize {
        let mut state = self.lock();
        state.reap(Instant::now());
        state.objects.len()
    }

    /// Objects carrying `key=value`
    pub fn objects_labelled(&self, key: &str, value: &str) -> Vec<ObjectRef> {
        let mut state = self.lock();
        state.reap(Instant::now());
        state
            .objects
            .values()
            .filter(|o| manifest_labels(&o.manifest).get(key).map(String::as_str) == Some(value))
            .map(|o| o.reference.clone())
            .collect()
    }

    /// Labels of a stored object
    pub fn labels_of(&self, object: &ObjectRef) -> Option<BTreeMap<String, String>> {
        let state = self.lock();
        state.objects.get(&key_of(object)).map(|o| manifest_labels(&o.manifest))
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let mut state = self.lock();
        state.reap(Instant::now());
        state.namespaces.keys().cloned().collect()
    }

    pub fn namespace_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.lock().namespaces.get(name).map(|ns| ns.labels.clone())
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.lock().delete_calls
    }

    /// Highest number of non-terminating objects observed at once
    pub fn peak_live_objects(&self) -> usize {
        self.lock().peak_live
    }

    /// Highest number of create calls in progress at once
    pub fn peak_concurrent_creates(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> ClusterResult<()> {
        if self.lock().faults.unreachable {
            return Err(ClusterError::Unreachable("in-memory cluster marked unreachable".into()));
        }
        Ok(())
    }
}

fn replicas_of(manifest: &Value, field: &str) -> i64 {
    manifest
        .get("spec")
        .and_then(|s| s.get(field))
        .and_then(|v| v.as_i64())
        .unwrap_or(1)
}

/// Status a controller would eventually report for `manifest`
fn synthesize_status(manifest: &Value, ready: bool) -> Option<Value> {
    let kind = manifest.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
    let condition = if ready { "True" } else { "False" };
    match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let replicas = replicas_of(manifest, "replicas");
            let ready_replicas = if ready { replicas } else { 0 };
            Some(json!({
                "replicas": replicas,
                "readyReplicas": ready_replicas,
                "availableReplicas": ready_replicas,
            }))
        }
        "Pod" => Some(json!({
            "phase": if ready { "Running" } else { "Pending" },
            "conditions": [{"type": "Ready", "status": condition}],
        })),
        "Job" => {
            let completions = replicas_of(manifest, "completions");
            Some(json!({ "succeeded": if ready { completions } else { 0 } }))
        }
        _ if ready => None,
        _ => Some(json!({ "conditions": [{"type": "Ready", "status": condition}] })),
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn create_namespace(&self, spec: &NamespaceSpec) -> ClusterResult<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        state.reap(Instant::now());
        if state.namespaces.contains_key(&spec.name) {
            return Err(ClusterError::AlreadyExists(format!("namespace {}", spec.name)));
        }
        state.namespaces.insert(
            spec.name.clone(),
            StoredNamespace {
                labels: spec.labels.clone(),
                deleting_at: None,
            },
        );
        Ok(())
    }

    async fn list_namespaces(&self, label_selector: &str) -> ClusterResult<Vec<String>> {
        self.check_reachable()?;
        let selector = parse_label_selector(label_selector)?;
        let mut state = self.lock();
        state.reap(Instant::now());
        Ok(state
            .namespaces
            .iter()
            .filter(|(_, ns)| selector_matches(&selector, &ns.labels))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut state = self.lock();
        state.reap(now);
        state.delete_calls += 1;
        let delay = state.faults.delete_delay;
        let ns = state
            .namespaces
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("namespace {name}")))?;
        if ns.deleting_at.is_none() {
            ns.deleting_at = Some(now + delay);
        }
        state.reap(now);
        Ok(())
    }

    async fn create(&self, manifest: &Value) -> ClusterResult<ObjectRef> {
        self.check_reachable()?;
        let mut reference = ObjectRef::of_manifest(manifest)?;
        if reference.namespace.is_none() {
            reference.kind = reference.kind.cluster_scoped();
        }

        let latency = self.lock().faults.create_latency;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let now = Instant::now();
        let mut state = self.lock();
        state.reap(now);
        state.create_calls += 1;

        let over_budget = state
            .faults
            .create_budget
            .is_some_and(|budget| state.create_calls > budget);
        if over_budget || state.faults.failing_names.contains(&reference.name) {
            return Err(ClusterError::Api {
                code: 500,
                message: format!("injected failure creating {reference}"),
            });
        }
        if let Some(ns) = &reference.namespace {
            match state.namespaces.get(ns) {
                None => return Err(ClusterError::NotFound(format!("namespace {ns}"))),
                Some(stored) if stored.deleting_at.is_some() => {
                    return Err(ClusterError::Api {
                        code: 403,
                        message: format!("namespace {ns} is being terminated"),
                    })
                }
                Some(_) => {}
            }
        }
        let key = key_of(&reference);
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(reference.to_string()));
        }

        let ready_at = if state.faults.unready_kinds.contains(&reference.kind.kind) {
            None
        } else {
            Some(now + state.faults.ready_delay)
        };
        state.kinds.insert(reference.kind.clone());
        state.objects.insert(
            key,
            StoredObject {
                reference: reference.clone(),
                manifest: manifest.clone(),
                ready_at,
                deleting_at: None,
            },
        );
        let live = state.live_objects();
        state.peak_live = state.peak_live.max(live);
        Ok(reference)
    }

    async fn get(&self, object: &ObjectRef) -> ClusterResult<Option<Value>> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut state = self.lock();
        state.reap(now);
        let Some(stored) = state.objects.get(&key_of(object)) else {
            return Ok(None);
        };
        let mut observed = stored.manifest.clone();
        let ready = stored.ready_at.is_some_and(|t| now >= t);
        if let Some(map) = observed.as_object_mut() {
            match synthesize_status(&stored.manifest, ready) {
                Some(status) => {
                    map.insert("status".to_string(), status);
                }
                None => {
                    map.remove("status");
                }
            }
            if stored.deleting_at.is_some() {
                if let Some(meta) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.insert(
                        "deletionTimestamp".to_string(),
                        Value::String(chrono::Utc::now().to_rfc3339()),
                    );
                }
            }
        }
        Ok(Some(observed))
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> ClusterResult<Vec<ObjectRef>> {
        self.check_reachable()?;
        let selector = parse_label_selector(label_selector)?;
        let mut state = self.lock();
        state.reap(Instant::now());
        Ok(state
            .objects
            .values()
            .filter(|o| o.reference.kind.same_type(kind))
            .filter(|o| namespace.is_none() || o.reference.namespace.as_deref() == namespace)
            .filter(|o| selector_matches(&selector, &manifest_labels(&o.manifest)))
            .map(|o| o.reference.clone())
            .collect())
    }

    async fn delete(&self, object: &ObjectRef) -> ClusterResult<()> {
        self.check_reachable()?;
        let latency = self.lock().faults.delete_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let now = Instant::now();
        let mut state = self.lock();
        state.reap(now);
        state.delete_calls += 1;
        if state.faults.failing_deletes.contains(&object.name) {
            return Err(ClusterError::Api {
                code: 500,
                message: format!("injected failure deleting {object}"),
            });
        }
        let delay = state.faults.delete_delay;
        let stored = state
            .objects
            .get_mut(&key_of(object))
            .ok_or_else(|| ClusterError::NotFound(object.to_string()))?;
        if stored.deleting_at.is_none() {
            stored.deleting_at = Some(now + delay);
        }
        state.reap(now);
        Ok(())
    }

    async fn deletable_kinds(&self) -> ClusterResult<Vec<ResourceKind>> {
        self.check_reachable()?;
        let state = self.lock();
        Ok(state.kinds.iter().cloned().collect())
    }

    async fn nodes(&self) -> ClusterResult<Vec<NodeHealth>> {
        self.check_reachable()?;
        Ok(self.lock().nodes.clone())
    }
}
