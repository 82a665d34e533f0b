//! Benchmark definition
//!
//! A [`BenchmarkSpec`] is parsed once from YAML, resolved (object templates
//! and profiles read from disk relative to the spec file) and validated. It
//! is never mutated afterwards; stages receive the pieces they need by
//! clone or reference.

pub mod duration;
mod profiles;
mod settings;

pub use duration::{format_duration, parse_duration};
pub use profiles::{
    load_metric_profile, parse_metric_profile, AlertEntry, AlertProfile, Comparison, MetricQuery,
};
pub use settings::EngineSettings;

use crate::error::{BurnerError, Result};
use crate::indexer::IndexerTarget;
use crate::models::AlertSeverity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_timeout() -> Duration {
    Duration::from_secs(4 * 3600)
}

fn default_gc_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_one() -> usize {
    1
}

fn default_concurrency() -> usize {
    10
}

fn default_max_wait() -> Duration {
    Duration::from_secs(300)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_step() -> Duration {
    Duration::from_secs(30)
}

/// Whole benchmark document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkSpec {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub indexer: Option<IndexerTarget>,
    #[serde(default)]
    pub metrics_endpoints: Vec<MetricsEndpoint>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

/// Settings that apply to the whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Overall run deadline
    #[serde(default = "default_timeout", with = "duration")]
    pub timeout: Duration,
    /// Destroy everything labelled with the run id once all jobs finish
    #[serde(default)]
    pub gc: bool,
    #[serde(default = "default_gc_timeout", with = "duration")]
    pub gc_timeout: Duration,
    /// Verify every node is Ready before executing jobs
    #[serde(default)]
    pub cluster_health: bool,
    /// Run jobs concurrently instead of in declaration order
    #[serde(default)]
    pub parallel_jobs: bool,
    /// Lowest alert severity whose breach fails the run
    #[serde(default)]
    pub fail_severity: AlertSeverity,
    #[serde(default)]
    pub measurements: Vec<MeasurementConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            gc: false,
            gc_timeout: default_gc_timeout(),
            cluster_health: false,
            parallel_jobs: false,
            fail_severity: AlertSeverity::default(),
            measurements: Vec::new(),
        }
    }
}

/// Measurement collectors that can be attached to jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MeasurementKind {
    /// Creation-to-ready latency of every object
    ObjectLatency,
    /// Periodic count of live objects per kind
    ObjectCount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementConfig {
    pub name: MeasurementKind,
    /// Poll interval; falls back to the engine default
    #[serde(default, with = "duration::option")]
    pub interval: Option<Duration>,
}

/// External time-series endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEndpoint {
    pub endpoint: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_step", with = "duration")]
    pub step: Duration,
    #[serde(default = "default_true", rename = "skipTLSVerify")]
    pub skip_tls_verify: bool,
    /// Metric profile files
    #[serde(default)]
    pub metrics: Vec<PathBuf>,
    /// Alert profile files
    #[serde(default)]
    pub alerts: Vec<PathBuf>,
    /// Queries resolved from `metrics`
    #[serde(skip)]
    pub metric_profile: Vec<MetricQuery>,
    /// Entries resolved from `alerts`
    #[serde(skip)]
    pub alert_profile: AlertProfile,
}

impl MetricsEndpoint {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            alias: None,
            token: None,
            username: None,
            password: None,
            step: default_step(),
            skip_tls_verify: true,
            metrics: Vec::new(),
            alerts: Vec::new(),
            metric_profile: Vec::new(),
            alert_profile: AlertProfile::default(),
        }
    }

    /// Name used to tag samples and report failures
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.endpoint)
    }

    /// Read the referenced profile files relative to `base`
    pub fn resolve(&mut self, base: &Path) -> Result<()> {
        let mut queries = Vec::new();
        for path in &self.metrics {
            queries.extend(load_metric_profile(&base.join(path))?);
        }
        if !self.metrics.is_empty() {
            self.metric_profile = queries;
        }
        let mut alerts = Vec::new();
        for path in &self.alerts {
            alerts.push(AlertProfile::load(&base.join(path))?);
        }
        if !self.alerts.is_empty() {
            self.alert_profile = AlertProfile::merge(alerts);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.endpoint).map_err(|e| {
            BurnerError::config(format!("invalid metrics endpoint {:?}: {e}", self.endpoint))
        })?;
        if self.step.is_zero() {
            return Err(BurnerError::config(format!(
                "metrics endpoint {} has a zero step",
                self.endpoint
            )));
        }
        self.alert_profile.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    #[default]
    Create,
    Delete,
}

/// Which live objects a churn cycle replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChurnSelection {
    #[default]
    Random,
    Oldest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChurnPolicy {
    /// Percentage of live objects replaced per cycle (0-100)
    pub percent: f64,
    /// Number of cycles; bounded further by `duration` when set
    #[serde(default)]
    pub cycles: Option<usize>,
    #[serde(default, with = "duration::option")]
    pub duration: Option<Duration>,
    #[serde(default, with = "duration::option")]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub selection: ChurnSelection,
}

impl ChurnPolicy {
    /// Objects replaced per cycle for `total` live objects
    pub fn per_cycle(&self, total: usize) -> usize {
        let count = (self.percent / 100.0 * total as f64).round() as usize;
        count.min(total)
    }
}

/// One object template of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSpec {
    /// Manifest file, relative to the spec
    #[serde(default)]
    pub object_template: Option<PathBuf>,
    /// Inline manifest; filled from `object_template` during resolution
    #[serde(default)]
    pub manifest: Option<serde_json::Value>,
    #[serde(default = "default_one")]
    pub replicas: usize,
    /// Base name for generated objects; defaults to the lowercase kind
    #[serde(default)]
    pub name: Option<String>,
    /// Wait for this object type to become ready; overrides the job setting
    #[serde(default)]
    pub wait: Option<bool>,
}

impl ObjectSpec {
    pub fn manifest(&self) -> Option<&serde_json::Value> {
        self.manifest.as_ref()
    }

    /// `kind` field of the manifest
    pub fn kind(&self) -> Option<&str> {
        self.manifest.as_ref()?.get("kind")?.as_str()
    }

    pub fn base_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.kind().map(|k| k.to_lowercase()))
            .unwrap_or_else(|| "object".to_string())
    }
}

/// Selects the objects removed by a `delete` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTarget {
    pub api_version: String,
    pub kind: String,
    pub label_selector: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Unit of execution, measurement and metric correlation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: String,
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default)]
    pub namespace: String,
    /// Create one namespace per iteration (`<namespace>-<iteration>`)
    #[serde(default = "default_true")]
    pub namespaced_iterations: bool,
    #[serde(default)]
    pub namespace_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub namespace_annotations: BTreeMap<String, String>,
    #[serde(default = "default_one")]
    pub job_iterations: usize,
    #[serde(default, with = "duration::option")]
    pub job_iteration_delay: Option<Duration>,
    #[serde(default)]
    pub objects: Vec<ObjectSpec>,
    #[serde(default)]
    pub delete_objects: Vec<DeleteTarget>,
    /// Worker pool size
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sustained request rate; 0 disables rate limiting
    #[serde(default)]
    pub qps: f64,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub churn: Option<ChurnPolicy>,
    #[serde(default = "default_true")]
    pub wait_for_ready: bool,
    #[serde(default = "default_max_wait", with = "duration")]
    pub max_wait_timeout: Duration,
    #[serde(default = "default_poll_interval", with = "duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_poll_interval", with = "duration")]
    pub max_poll_interval: Duration,
    /// Abort the job on the first object failure
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
}

impl Job {
    /// Minimal create job, mainly for programmatic construction
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: JobType::Create,
            namespace: namespace.into(),
            namespaced_iterations: true,
            namespace_labels: BTreeMap::new(),
            namespace_annotations: BTreeMap::new(),
            job_iterations: 1,
            job_iteration_delay: None,
            objects: Vec::new(),
            delete_objects: Vec::new(),
            concurrency: default_concurrency(),
            qps: 0.0,
            burst: None,
            churn: None,
            wait_for_ready: true,
            max_wait_timeout: default_max_wait(),
            poll_interval: default_poll_interval(),
            max_poll_interval: default_max_poll_interval(),
            fail_fast: false,
            timeout: None,
        }
    }

    /// Total objects the job keeps alive
    pub fn total_objects(&self) -> usize {
        self.job_iterations * self.objects.iter().map(|o| o.replicas).sum::<usize>()
    }

    /// Namespace targeted by `iteration`
    pub fn namespace_for(&self, iteration: usize) -> String {
        if self.namespaced_iterations {
            format!("{}-{}", self.namespace, iteration)
        } else {
            self.namespace.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BurnerError::config("job name must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(BurnerError::config(format!(
                "job {}: concurrency must be at least 1",
                self.name
            )));
        }
        if self.qps < 0.0 || !self.qps.is_finite() {
            return Err(BurnerError::config(format!("job {}: invalid qps", self.name)));
        }
        match self.job_type {
            JobType::Create => {
                if self.namespace.trim().is_empty() {
                    return Err(BurnerError::config(format!(
                        "job {}: namespace must not be empty",
                        self.name
                    )));
                }
                if self.objects.is_empty() {
                    return Err(BurnerError::config(format!(
                        "job {}: at least one object template is required",
                        self.name
                    )));
                }
                for (idx, obj) in self.objects.iter().enumerate() {
                    let manifest = obj.manifest.as_ref().ok_or_else(|| {
                        BurnerError::config(format!(
                            "job {}: object {idx} has neither objectTemplate nor manifest",
                            self.name
                        ))
                    })?;
                    for field in ["apiVersion", "kind"] {
                        if manifest.get(field).and_then(|v| v.as_str()).is_none() {
                            return Err(BurnerError::config(format!(
                                "job {}: object {idx} manifest is missing {field}",
                                self.name
                            )));
                        }
                    }
                }
            }
            JobType::Delete => {
                if self.delete_objects.is_empty() {
                    return Err(BurnerError::config(format!(
                        "job {}: delete jobs need at least one deleteObjects entry",
                        self.name
                    )));
                }
            }
        }
        if let Some(churn) = &self.churn {
            if !(0.0..=100.0).contains(&churn.percent) {
                return Err(BurnerError::config(format!(
                    "job {}: churn percent must be within 0-100",
                    self.name
                )));
            }
            if churn.cycles.is_none() && churn.duration.is_none() {
                return Err(BurnerError::config(format!(
                    "job {}: churn needs cycles or duration",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl BenchmarkSpec {
    /// Parse a spec document without touching the filesystem
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| BurnerError::config(format!("invalid spec: {e}")))
    }

    /// Parse, resolve relative files against `base_dir` and validate
    pub fn from_reader(mut reader: impl Read, base_dir: &Path) -> Result<Self> {
        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .map_err(|e| BurnerError::config(format!("cannot read spec: {e}")))?;
        let mut spec = Self::from_yaml(&content)?;
        spec.resolve(base_dir)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            BurnerError::config(format!("cannot open spec {}: {e}", path.display()))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_reader(file, base)
    }

    /// Load object templates and profiles referenced by relative path
    pub fn resolve(&mut self, base_dir: &Path) -> Result<()> {
        for job in &mut self.jobs {
            for obj in &mut job.objects {
                if obj.manifest.is_some() {
                    continue;
                }
                if let Some(path) = &obj.object_template {
                    let full = base_dir.join(path);
                    let content = std::fs::read_to_string(&full).map_err(|e| {
                        BurnerError::config(format!("cannot read template {}: {e}", full.display()))
                    })?;
                    let manifest: serde_json::Value = serde_yaml::from_str(&content).map_err(|e| {
                        BurnerError::config(format!("invalid template {}: {e}", full.display()))
                    })?;
                    obj.manifest = Some(manifest);
                }
            }
        }
        for endpoint in &mut self.metrics_endpoints {
            endpoint.resolve(base_dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !names.insert(job.name.as_str()) {
                return Err(BurnerError::config(format!("duplicate job name {}", job.name)));
            }
        }
        for endpoint in &self.metrics_endpoints {
            endpoint.validate()?;
        }
        if let Some(indexer) = &self.indexer {
            indexer.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
global:
  timeout: 30m
  gc: true
  measurements:
    - name: objectLatency
    - name: objectCount
      interval: 2s
indexer:
  type: local
  metricsDirectory: out
jobs:
  - name: create-deployments
    namespace: burner
    jobIterations: 2
    qps: 20
    burst: 40
    churn:
      percent: 10
      cycles: 3
      delay: 5s
    objects:
      - replicas: 5
        manifest:
          apiVersion: apps/v1
          kind: Deployment
          metadata:
            name: web
          spec:
            replicas: 1
"#;

    #[test]
    fn test_parse_full_spec() {
        let spec = BenchmarkSpec::from_yaml(SPEC).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.global.timeout, Duration::from_secs(1800));
        assert!(spec.global.gc);
        assert_eq!(spec.global.measurements.len(), 2);
        assert_eq!(
            spec.global.measurements[1].interval,
            Some(Duration::from_secs(2))
        );
        let job = &spec.jobs[0];
        assert_eq!(job.total_objects(), 10);
        assert_eq!(job.namespace_for(1), "burner-1");
        assert_eq!(job.objects[0].base_name(), "deployment");
        assert_eq!(job.churn.as_ref().unwrap().per_cycle(10), 1);
        assert!(matches!(spec.indexer, Some(IndexerTarget::Local { .. })));
    }

    #[test]
    fn test_missing_job_name_is_configuration_error() {
        let yaml = "jobs:\n  - name: ''\n    namespace: x\n";
        let spec = BenchmarkSpec::from_yaml(yaml).unwrap();
        assert!(matches!(spec.validate(), Err(BurnerError::Configuration(_))));
    }

    #[test]
    fn test_job_without_objects_rejected() {
        let mut job = Job::new("empty", "ns");
        assert!(job.validate().is_err());
        job.objects.push(ObjectSpec {
            object_template: None,
            manifest: Some(serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap"})),
            replicas: 1,
            name: None,
            wait: None,
        });
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_duplicate_job_names_rejected() {
        let mut job = Job::new("dup", "ns");
        job.objects.push(ObjectSpec {
            object_template: None,
            manifest: Some(serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap"})),
            replicas: 1,
            name: None,
            wait: None,
        });
        let spec = BenchmarkSpec {
            jobs: vec![job.clone(), job],
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_churn_per_cycle_rounds() {
        let churn = ChurnPolicy {
            percent: 25.0,
            cycles: Some(1),
            duration: None,
            delay: None,
            selection: ChurnSelection::Random,
        };
        assert_eq!(churn.per_cycle(10), 3);
        assert_eq!(churn.per_cycle(2), 1);
        assert_eq!(churn.per_cycle(0), 0);
    }

    #[test]
    fn test_resolve_templates_and_profiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cm.yml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\ndata:\n  key: value\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("metrics.yml"),
            "- query: up\n  metricName: up\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("alerts.yml"),
            "- expr: up == 0\n  severity: warning\n",
        )
        .unwrap();
        let yaml = r#"
metricsEndpoints:
  - endpoint: http://prometheus:9090
    metrics: [metrics.yml]
    alerts: [alerts.yml]
jobs:
  - name: cms
    namespace: burner
    objects:
      - objectTemplate: cm.yml
        replicas: 3
"#;
        let spec = BenchmarkSpec::from_reader(yaml.as_bytes(), dir.path()).unwrap();
        assert_eq!(spec.jobs[0].objects[0].kind(), Some("ConfigMap"));
        assert_eq!(spec.metrics_endpoints[0].metric_profile.len(), 1);
        assert_eq!(spec.metrics_endpoints[0].alert_profile.len(), 1);
    }
}
