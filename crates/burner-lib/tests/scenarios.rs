//! End-to-end scenarios against the in-memory cluster and mock HTTP backends

use async_trait::async_trait;
use burner_lib::alerting::{AlertEvaluator, AlertSummary};
use burner_lib::cleanup::destroy;
use burner_lib::cluster::{ClusterClient, InMemoryCluster};
use burner_lib::config::{AlertProfile, BenchmarkSpec, EngineSettings, MetricsEndpoint};
use burner_lib::engine::Benchmark;
use burner_lib::indexer::{import_archive, write_archive, IndexWriter, Indexer, RecordStatus, WriteReport};
use burner_lib::models::{
    AlertSeverity, Record, RunId, Sample, TimeWindow, VerdictOutcome, RUN_ID_LABEL,
};
use burner_lib::{Outcome, Result, Shutdown};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TEN_CONFIGMAPS: &str = r#"
global:
  timeout: 1m
  measurements:
    - name: objectLatency
jobs:
  - name: configmaps
    namespace: scenario
    pollInterval: 5ms
    maxPollInterval: 20ms
    maxWaitTimeout: 5s
    objects:
      - replicas: 10
        manifest:
          apiVersion: v1
          kind: ConfigMap
          metadata:
            name: cm
          data:
            key: value
"#;

#[tokio::test]
async fn test_ten_objects_without_churn() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(InMemoryCluster::new());
    let spec = BenchmarkSpec::from_yaml(TEN_CONFIGMAPS).unwrap();
    let writer = IndexWriter::new(Arc::new(burner_lib::indexer::LocalIndexer::new(dir.path())));

    let report = Benchmark::from_spec(spec, cluster.clone(), RunId::from("ten"), EngineSettings::default())
        .unwrap()
        .with_writer(writer)
        .run(&Shutdown::new())
        .await;

    assert_eq!(report.outcome(), Outcome::Success);
    assert_eq!(report.outcome().exit_code(), 0);
    let job = &report.jobs[0].report;
    assert_eq!(job.created, 10);
    assert_eq!(job.failed, 0);

    let created = cluster.objects_labelled(RUN_ID_LABEL, "ten");
    assert_eq!(created.len(), 10);
    for object in &created {
        let labels = cluster.labels_of(object).unwrap();
        assert_eq!(labels.get(RUN_ID_LABEL).map(String::as_str), Some("ten"));
    }

    let latencies = std::fs::read_to_string(dir.path().join("configmaps-objectReadyLatency.jsonl")).unwrap();
    let lines: Vec<&str> = latencies.lines().collect();
    assert_eq!(lines.len(), 10);
    for line in lines {
        let Record::Measurement(sample) = serde_json::from_str::<Record>(line).unwrap() else {
            panic!("expected a measurement record");
        };
        assert!(job.window.contains(sample.timestamp));
    }
}

#[tokio::test]
async fn test_check_alerts_with_one_breach() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v1/query_range")
        .match_query(mockito::Matcher::UrlEncoded("query".into(), "apiserver_latency".into()))
        .with_body(
            r#"{"status":"success","data":{"resultType":"matrix","result":[
                {"metric":{},"values":[[1700000000,"0.2"],[1700000030,"1.7"]]}
            ]}}"#,
        )
        .create_async()
        .await;
    server
        .mock("GET", "/api/v1/query_range")
        .match_query(mockito::Matcher::UrlEncoded("query".into(), "etcd_errors".into()))
        .with_body(
            r#"{"status":"success","data":{"resultType":"matrix","result":[
                {"metric":{},"values":[[1700000000,"0"],[1700000030,"0"]]}
            ]}}"#,
        )
        .create_async()
        .await;

    let profile = AlertProfile::from_yaml(
        r#"
- expr: apiserver_latency
  comparison: ">"
  threshold: 1
  severity: error
  description: "latency {{$value}}s"
- expr: etcd_errors
  comparison: ">"
  threshold: 0
  severity: critical
"#,
    )
    .unwrap();
    let evaluator = AlertEvaluator::for_endpoint(
        &MetricsEndpoint::new(server.url()),
        &EngineSettings::default(),
        RunId::from("alerts"),
    )
    .unwrap();
    let window = TimeWindow::from_epoch(1_700_000_000, 1_700_000_060).unwrap();
    let verdicts = evaluator.evaluate(&profile, window, "check-alerts", &Shutdown::new()).await;

    assert_eq!(verdicts.len(), 2);
    assert_eq!(verdicts[0].outcome, VerdictOutcome::Failed);
    assert_eq!(verdicts[0].description, "latency 1.700s");
    assert_eq!(verdicts[1].outcome, VerdictOutcome::Passed);

    let summary = AlertSummary::new(verdicts);
    let outcome = if summary.failed(AlertSeverity::Error) {
        Outcome::AlertsFailed
    } else {
        Outcome::Success
    };
    assert_eq!(outcome.exit_code(), 3);
}

#[tokio::test]
async fn test_destroy_with_short_deadline() {
    let cluster = Arc::new(InMemoryCluster::new());
    let spec = BenchmarkSpec::from_yaml(TEN_CONFIGMAPS).unwrap();
    Benchmark::from_spec(spec, cluster.clone(), RunId::from("slow-gc"), EngineSettings::default())
        .unwrap()
        .run(&Shutdown::new())
        .await;
    cluster.set_delete_delay(Duration::from_secs(30));

    let started = std::time::Instant::now();
    let client: Arc<dyn ClusterClient> = cluster.clone();
    let report = destroy(client, &RunId::from("slow-gc"), Duration::from_millis(300))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!report.complete);
    assert!(!report.remaining.is_empty());
    assert_ne!(report.outcome().exit_code(), 0);
}

/// Fails every record once with a retryable status, then persists
#[derive(Default)]
struct OnceFlaky {
    attempts: AtomicUsize,
    stored: Mutex<Vec<Record>>,
}

#[async_trait]
impl Indexer for OnceFlaky {
    fn name(&self) -> &str {
        "once-flaky"
    }

    async fn write(&self, records: &[Record]) -> Result<WriteReport> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            let statuses = records
                .iter()
                .map(|_| RecordStatus::failed("429 too many requests", true))
                .collect();
            return Ok(WriteReport::new(statuses));
        }
        self.stored.lock().unwrap().extend_from_slice(records);
        Ok(WriteReport::new(vec![RecordStatus::Written; records.len()]))
    }
}

#[tokio::test]
async fn test_archive_replay_after_transient_failure() {
    let dir = tempfile::tempdir().unwrap();
    let run_id = RunId::from("replay");
    let records: Vec<Record> = (0..25)
        .map(|i| Record::Metric(Sample::new("cpu", i as f64, Utc::now(), "job", &run_id)))
        .collect();
    let archive = dir.path().join("bundle.tar.gz");
    write_archive(&archive, &records).unwrap();

    let indexer = Arc::new(OnceFlaky::default());
    let writer = IndexWriter::new(indexer.clone())
        .with_batch_size(10)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5));
    let summary = import_archive(&archive, &writer).await.unwrap();

    assert!(summary.is_complete());
    assert_eq!(summary.written, 25);
    assert_eq!(indexer.stored.lock().unwrap().len(), 25);
}
