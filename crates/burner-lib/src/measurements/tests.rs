use super::*;
use crate::cluster::{InMemoryCluster, NamespaceSpec, ObjectRef};
use crate::indexer::{IndexWriter, LocalIndexer};
use serde_json::json;
use std::sync::atomic::AtomicUsize;

fn context(cluster: Arc<dyn ClusterClient>, scope: MeasurementScope) -> MeasurementContext {
    MeasurementContext {
        cluster,
        run_id: RunId::from("measure-run"),
        job_name: "job".into(),
        scope,
    }
}

fn config_map_kind() -> ResourceKind {
    ResourceKind::new("v1", "ConfigMap")
}

/// Collector returning canned samples, optionally one stamped long before the window
struct Canned {
    name: &'static str,
    include_stale: bool,
    stops: AtomicUsize,
}

impl Canned {
    fn new(name: &'static str, include_stale: bool) -> Self {
        Self {
            name,
            include_stale,
            stops: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Measurement for Canned {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(&self, _ctx: MeasurementContext) -> Result<()> {
        Ok(())
    }

    async fn collect(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<Vec<Sample>> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let run_id = RunId::from("measure-run");
        let mut samples = vec![Sample::new("canned", 1.0, Utc::now(), "job", &run_id)];
        if self.include_stale {
            let stale = Utc::now() - chrono::Duration::hours(1);
            samples.push(Sample::new("canned", 2.0, stale, "job", &run_id));
        }
        Ok(samples)
    }
}

struct Broken;

#[async_trait]
impl Measurement for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn start(&self, _ctx: MeasurementContext) -> Result<()> {
        Err(BurnerError::Connectivity("collector backend down".into()))
    }

    async fn collect(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<Vec<Sample>> {
        Ok(vec![])
    }
}

struct Panicky;

#[async_trait]
impl Measurement for Panicky {
    fn name(&self) -> &str {
        "panicky"
    }

    async fn start(&self, _ctx: MeasurementContext) -> Result<()> {
        Ok(())
    }

    async fn collect(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<Vec<Sample>> {
        panic!("collector bug");
    }

    fn observe(&self, _event: &ObjectEvent) {
        panic!("observer bug");
    }
}

fn scope() -> MeasurementScope {
    MeasurementScope::for_job(&RunId::from("measure-run"), "job", vec![config_map_kind()])
}

#[tokio::test]
async fn test_samples_outside_window_are_dropped() {
    let cluster: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
    let set = MeasurementSet::new(vec![Arc::new(Canned::new("canned", true))]);
    set.start(context(cluster, scope())).await.unwrap();
    let output = set.stop().await;

    let window = output.window.unwrap();
    assert_eq!(output.samples.len(), 1);
    assert!(output.samples.iter().all(|s| window.contains(s.timestamp)));
    assert_eq!(set.state(), MeasurementState::Stopped);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let cluster: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
    let canned = Arc::new(Canned::new("canned", false));
    let set = MeasurementSet::new(vec![canned.clone()]);
    set.start(context(cluster, scope())).await.unwrap();

    let first = set.stop().await;
    let second = set.stop().await;
    assert_eq!(first.samples, second.samples);
    assert_eq!(canned.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_and_panicking_collectors_are_isolated() {
    let cluster: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
    let set = MeasurementSet::new(vec![
        Arc::new(Broken),
        Arc::new(Panicky),
        Arc::new(Canned::new("canned", false)),
    ]);
    set.start(context(cluster, scope())).await.unwrap();

    let object = ObjectRef::new(config_map_kind(), Some("ns".into()), "cm");
    set.observe(&ObjectEvent::Created {
        object,
        job: "job".into(),
        at: Utc::now(),
    });
    let output = set.stop().await;

    assert_eq!(output.samples.len(), 1);
    let mut failed: Vec<&str> = output.failures.iter().map(|f| f.measurement.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["broken", "panicky"]);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let cluster: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
    let set = MeasurementSet::new(vec![]);
    set.start(context(cluster.clone(), scope())).await.unwrap();
    assert!(set.start(context(cluster, scope())).await.is_err());
}

#[tokio::test]
async fn test_index_requires_stopped_set() {
    let dir = tempfile::tempdir().unwrap();
    let writer = IndexWriter::new(Arc::new(LocalIndexer::new(dir.path())));
    let cluster: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
    let set = MeasurementSet::new(vec![Arc::new(Canned::new("canned", false))]);

    assert!(set.index(&writer).await.is_err());
    set.start(context(cluster, scope())).await.unwrap();
    assert!(set.index(&writer).await.is_err());

    set.stop().await;
    let summary = set.index(&writer).await.unwrap();
    assert_eq!(summary.written, 1);
    assert_eq!(set.state(), MeasurementState::Indexed);
    assert!(dir.path().join("job-canned.jsonl").exists());
}

#[tokio::test]
async fn test_object_latency_follows_executor_events() {
    let cluster: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
    let set = MeasurementSet::new(vec![Arc::new(ObjectLatency::new(Duration::from_millis(10)))]);
    set.start(context(cluster, scope())).await.unwrap();

    for (i, ms) in [(1, 100u64), (2, 300)] {
        let object = ObjectRef::new(config_map_kind(), Some("ns".into()), format!("cm-{i}"));
        set.observe(&ObjectEvent::Created {
            object: object.clone(),
            job: "job".into(),
            at: Utc::now(),
        });
        set.observe(&ObjectEvent::Ready {
            object,
            job: "job".into(),
            latency: Duration::from_millis(ms),
            at: Utc::now(),
        });
    }
    set.observe(&ObjectEvent::NotReady {
        object: ObjectRef::new(config_map_kind(), Some("ns".into()), "cm-3"),
        job: "job".into(),
        at: Utc::now(),
    });
    let output = set.stop().await;

    let per_object: Vec<f64> = output
        .samples
        .iter()
        .filter(|s| s.metric_name == object_latency::LATENCY_METRIC)
        .map(|s| s.value)
        .collect();
    assert_eq!(per_object, vec![100.0, 300.0]);

    let max = output
        .samples
        .iter()
        .find(|s| {
            s.metric_name == object_latency::QUANTILES_METRIC
                && s.labels.get("quantile").map(String::as_str) == Some("max")
        })
        .unwrap();
    assert_eq!(max.value, 300.0);
    assert!(output
        .samples
        .iter()
        .any(|s| s.metric_name == "objectNotReady" && s.value == 1.0));
}

#[tokio::test]
async fn test_object_latency_polls_external_scope() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster
        .create_namespace(&NamespaceSpec {
            name: "apps".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    cluster
        .create(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "external", "namespace": "apps", "labels": {"team": "a"}}
        }))
        .await
        .unwrap();

    let latency = ObjectLatency::new(Duration::from_millis(5));
    let scope = MeasurementScope::external(vec!["apps".into()], "team=a", vec![config_map_kind()]);
    latency.start(context(cluster, scope)).await.unwrap();
    latency.collect().await.unwrap();
    let samples = latency.stop().await.unwrap();

    let tracked: Vec<&Sample> = samples
        .iter()
        .filter(|s| s.metric_name == object_latency::LATENCY_METRIC)
        .collect();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].labels.get("name").map(String::as_str), Some("external"));
}

#[tokio::test]
async fn test_object_count_snapshots_scope() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster
        .create_namespace(&NamespaceSpec {
            name: "apps".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    for name in ["a", "b", "c"] {
        cluster
            .create(&json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": "apps", "labels": {"team": "a"}}
            }))
            .await
            .unwrap();
    }

    let count = ObjectCount::new(Duration::from_secs(60));
    let scope = MeasurementScope::external(vec!["apps".into()], "team=a", vec![config_map_kind()]);
    count.start(context(cluster, scope)).await.unwrap();
    count.collect().await.unwrap();
    let samples = count.stop().await.unwrap();

    assert!(!samples.is_empty());
    assert!(samples
        .iter()
        .all(|s| s.metric_name == object_count::COUNT_METRIC && s.value == 3.0));
    assert_eq!(samples[0].labels.get("kind").map(String::as_str), Some("ConfigMap"));
}

#[tokio::test]
async fn test_object_count_without_kinds_fails_to_start() {
    let cluster: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
    let count = ObjectCount::new(Duration::from_millis(10));
    let scope = MeasurementScope::external(vec![], "", vec![]);
    assert!(count.start(context(cluster, scope)).await.is_err());
    assert!(count.stop().await.is_err());
}

#[test]
fn test_build_uses_configured_interval() {
    let set = MeasurementSet::from_config(
        &[
            MeasurementConfig {
                name: MeasurementKind::ObjectLatency,
                interval: None,
            },
            MeasurementConfig {
                name: MeasurementKind::ObjectCount,
                interval: Some(Duration::from_secs(5)),
            },
        ],
        Duration::from_secs(1),
    );
    assert_eq!(set.len(), 2);
    assert_eq!(set.state(), MeasurementState::Created);
}

#[tokio::test]
async fn test_failed_collector_poller_is_stopped() {
    let cluster = Arc::new(InMemoryCluster::new());
    let count = Arc::new(ObjectCount::new(Duration::from_millis(10)));
    let set = MeasurementSet::new(vec![count.clone()]);
    set.start(context(cluster.clone(), scope())).await.unwrap();

    cluster.set_unreachable(true);
    set.collect().await;
    let output = set.stop().await;
    assert_eq!(output.failures.len(), 1);
    assert_eq!(output.failures[0].measurement, "objectCount");

    // the set already took the poller down
    assert!(count.stop().await.is_err());
}
