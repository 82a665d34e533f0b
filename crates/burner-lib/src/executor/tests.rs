use super::*;
use crate::cluster::{ClusterClient, InMemoryCluster, ResourceKind};
use crate::config::{ChurnPolicy, ChurnSelection, DeleteTarget, Job, JobType, ObjectSpec};
use crate::models::{JobStatus, RunId, RUN_ID_LABEL};
use crate::shutdown::Shutdown;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config_map_job(name: &str, replicas: usize) -> Job {
    let mut job = Job::new(name, "burner");
    job.poll_interval = Duration::from_millis(5);
    job.max_poll_interval = Duration::from_millis(20);
    job.max_wait_timeout = Duration::from_secs(2);
    job.objects.push(ObjectSpec {
        object_template: None,
        manifest: Some(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "data": {"k": "v"}
        })),
        replicas,
        name: Some("cm".into()),
        wait: None,
    });
    job
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ObjectEvent>>,
}

impl ObjectObserver for Recorder {
    fn observe(&self, event: &ObjectEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn test_creates_every_planned_object_with_run_label() {
    let cluster = Arc::new(InMemoryCluster::new());
    let run_id = RunId::from("run-create");
    let mut job = config_map_job("cms", 5);
    job.job_iterations = 2;

    let executor = JobExecutor::new(cluster.clone(), run_id.clone());
    let report = executor.run(&job, &Shutdown::new()).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.created, 10);
    assert_eq!(report.failed, 0);
    assert_eq!(report.readiness.count, 10);
    assert_eq!(cluster.objects_labelled(RUN_ID_LABEL, "run-create").len(), 10);
    let mut namespaces = cluster.namespace_names();
    namespaces.sort();
    assert_eq!(namespaces, vec!["burner-0", "burner-1"]);
    assert_eq!(
        cluster
            .namespace_labels("burner-0")
            .unwrap()
            .get(RUN_ID_LABEL)
            .map(String::as_str),
        Some("run-create")
    );
}

#[tokio::test]
async fn test_shared_namespace_when_iterations_not_namespaced() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut job = config_map_job("shared", 2);
    job.job_iterations = 3;
    job.namespaced_iterations = false;
    let report = JobExecutor::new(cluster.clone(), RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(report.created, 6);
    assert_eq!(cluster.namespace_names(), vec!["burner"]);
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrent_creates() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.set_create_latency(Duration::from_millis(10));
    let mut job = config_map_job("bounded", 20);
    job.concurrency = 3;
    job.wait_for_ready = false;
    let report = JobExecutor::new(cluster.clone(), RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(report.created, 20);
    assert!(cluster.peak_concurrent_creates() <= 3);
}

#[tokio::test]
async fn test_failed_creates_degrade_job() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.fail_creates_named("cm-0-2");
    let job = config_map_job("partial", 3);
    let report = JobExecutor::new(cluster.clone(), RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Degraded);
    assert_eq!(report.created, 2);
    assert_eq!(report.failed, 1);
    assert!(report.errors[0].contains("cm-0-2"));
}

#[tokio::test]
async fn test_fail_fast_stops_job() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.fail_creates_named("cm-0-1");
    let mut job = config_map_job("fast", 50);
    job.fail_fast = true;
    job.concurrency = 1;
    let report = JobExecutor::new(cluster.clone(), RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.created < 49);
}

#[tokio::test]
async fn test_never_ready_objects_counted() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.never_ready("Deployment");
    let mut job = Job::new("deploys", "burner");
    job.poll_interval = Duration::from_millis(5);
    job.max_poll_interval = Duration::from_millis(10);
    job.max_wait_timeout = Duration::from_millis(60);
    job.objects.push(ObjectSpec {
        object_template: None,
        manifest: Some(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "spec": {"replicas": 1}
        })),
        replicas: 2,
        name: None,
        wait: None,
    });
    let report = JobExecutor::new(cluster.clone(), RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Degraded);
    assert_eq!(report.not_ready, 2);
    assert_eq!(report.created, 2);
}

#[tokio::test]
async fn test_churn_replaces_share_and_never_exceeds_total() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.set_delete_delay(Duration::from_millis(15));
    let mut job = config_map_job("churny", 10);
    job.churn = Some(ChurnPolicy {
        percent: 30.0,
        cycles: Some(3),
        duration: None,
        delay: Some(Duration::from_millis(5)),
        selection: ChurnSelection::Random,
    });
    let recorder = Arc::new(Recorder::default());
    let report = JobExecutor::new(cluster.clone(), RunId::from("churn-run"))
        .with_observer(recorder.clone())
        .run(&job, &Shutdown::new())
        .await
        .unwrap();

    assert_eq!(report.churn_cycles, 3);
    assert_eq!(report.deleted, 9);
    assert_eq!(report.created, 19);
    assert!(cluster.peak_live_objects() <= 10);
    assert_eq!(cluster.objects_labelled(RUN_ID_LABEL, "churn-run").len(), 10);

    let events = recorder.events.lock().unwrap();
    let deleted = events
        .iter()
        .filter(|e| matches!(e, ObjectEvent::Deleted { .. }))
        .count();
    assert_eq!(deleted, 9);
}

#[tokio::test]
async fn test_churn_oldest_with_duration_bound() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut job = config_map_job("aging", 4);
    job.churn = Some(ChurnPolicy {
        percent: 50.0,
        cycles: None,
        duration: Some(Duration::from_millis(80)),
        delay: Some(Duration::from_millis(20)),
        selection: ChurnSelection::Oldest,
    });
    let report = JobExecutor::new(cluster.clone(), RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap();
    assert!(report.churn_cycles >= 1);
    assert_eq!(report.deleted, report.churn_cycles * 2);
    assert!(cluster.peak_live_objects() <= 4);
}

#[tokio::test]
async fn test_delete_job_removes_matching_objects() {
    let cluster = Arc::new(InMemoryCluster::new());
    let create = config_map_job("seed", 4);
    JobExecutor::new(cluster.clone(), RunId::from("seed-run"))
        .run(&create, &Shutdown::new())
        .await
        .unwrap();

    let mut delete = Job::new("cleanup", "");
    delete.job_type = JobType::Delete;
    delete.poll_interval = Duration::from_millis(5);
    delete.delete_objects.push(DeleteTarget {
        api_version: "v1".into(),
        kind: "ConfigMap".into(),
        label_selector: "burner-job=seed".into(),
        namespace: None,
    });
    let report = JobExecutor::new(cluster.clone(), RunId::from("delete-run"))
        .run(&delete, &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(report.deleted, 4);
    assert_eq!(report.status, JobStatus::Completed);
    let kind = ResourceKind::new("v1", "ConfigMap");
    assert!(cluster.list(&kind, None, "burner-job=seed").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_job_timeout_marks_timed_out() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.set_create_latency(Duration::from_millis(20));
    let mut job = config_map_job("slow", 100);
    job.concurrency = 1;
    job.timeout = Some(Duration::from_millis(100));
    let report = JobExecutor::new(cluster.clone(), RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::TimedOut);
    assert!(report.created < 100);
}

#[tokio::test]
async fn test_invalid_job_rejected_before_mutation() {
    let cluster = Arc::new(InMemoryCluster::new());
    let job = Job::new("", "burner");
    let err = JobExecutor::new(cluster.clone(), RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::BurnerError::Configuration(_)));
    assert_eq!(cluster.create_calls(), 0);
    assert!(cluster.namespace_names().is_empty());
}

#[tokio::test]
async fn test_unreachable_cluster_is_connectivity_error() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.set_unreachable(true);
    let job = config_map_job("offline", 1);
    let err = JobExecutor::new(cluster, RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::BurnerError::Connectivity(_)));
}

#[tokio::test]
async fn test_fail_fast_during_churn_marks_job_failed() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.fail_creates_after(4);
    let mut job = config_map_job("churn-fast", 4);
    job.fail_fast = true;
    job.churn = Some(ChurnPolicy {
        percent: 50.0,
        cycles: Some(3),
        duration: None,
        delay: None,
        selection: ChurnSelection::Oldest,
    });
    let report = JobExecutor::new(cluster.clone(), RunId::from("r"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.failed >= 1);
    assert_eq!(report.churn_cycles, 1);
}

#[tokio::test]
async fn test_churn_keeps_victims_whose_delete_failed() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.fail_deletes_named("cm-0-0");
    let mut job = config_map_job("sticky", 4);
    job.churn = Some(ChurnPolicy {
        percent: 100.0,
        cycles: Some(2),
        duration: None,
        delay: None,
        selection: ChurnSelection::Random,
    });
    let report = JobExecutor::new(cluster.clone(), RunId::from("sticky-run"))
        .run(&job, &Shutdown::new())
        .await
        .unwrap();

    assert_eq!(report.churn_cycles, 2);
    assert_eq!(report.deleted, 6);
    // the object is picked again in the second cycle
    let failed_deletes = report.errors.iter().filter(|e| e.contains("cm-0-0")).count();
    assert_eq!(failed_deletes, 2);
    assert_eq!(cluster.delete_calls(), 8);
    assert_eq!(cluster.objects_labelled(RUN_ID_LABEL, "sticky-run").len(), 4);
}

#[tokio::test]
async fn test_delete_job_lists_nothing_after_shutdown() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.set_unreachable(true);
    let mut delete = Job::new("late-cleanup", "");
    delete.job_type = JobType::Delete;
    for kind in ["ConfigMap", "Secret"] {
        delete.delete_objects.push(DeleteTarget {
            api_version: "v1".into(),
            kind: kind.into(),
            label_selector: "burner-job=seed".into(),
            namespace: None,
        });
    }
    let shutdown = Shutdown::new();
    shutdown.trigger();
    let report = JobExecutor::new(cluster, RunId::from("r"))
        .run(&delete, &shutdown)
        .await
        .unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(report.status, JobStatus::TimedOut);
}
