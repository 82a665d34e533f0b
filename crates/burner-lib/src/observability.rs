//! Self-observability of a benchmark run
//!
//! Provides:
//! - Prometheus counters and histograms describing what the engine did
//!   (objects created/failed/deleted, readiness latency, scrape, indexing
//!   and alert outcomes)
//! - A [`RunLogger`] emitting consistently shaped `event = ...` records

use crate::models::{AlertVerdict, JobReport, RunId, VerdictOutcome};
use crate::outcome::Outcome;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Buckets for readiness latency (in seconds)
const READINESS_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Global metrics instance; `None` when registration failed
static GLOBAL_METRICS: OnceLock<Option<BurnerMetricsInner>> = OnceLock::new();

struct BurnerMetricsInner {
    registry: Registry,
    objects_created: IntCounterVec,
    objects_failed: IntCounterVec,
    objects_deleted: IntCounterVec,
    readiness_latency_seconds: HistogramVec,
    jobs_finished: IntCounterVec,
    scrape_failures: IntCounterVec,
    indexing_failures: IntCounter,
    alert_verdicts: IntCounterVec,
}

impl BurnerMetricsInner {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("burner".to_string()), None)?;

        let objects_created = IntCounterVec::new(
            Opts::new("objects_created_total", "Objects created by job workers"),
            &["job"],
        )?;
        let objects_failed = IntCounterVec::new(
            Opts::new("objects_failed_total", "Object creations that failed"),
            &["job"],
        )?;
        let objects_deleted = IntCounterVec::new(
            Opts::new("objects_deleted_total", "Objects deleted by churn, delete jobs and cleanup"),
            &["job"],
        )?;
        let readiness_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "readiness_latency_seconds",
                "Time from object creation until it reported ready",
            )
            .buckets(READINESS_BUCKETS.to_vec()),
            &["job"],
        )?;
        let jobs_finished = IntCounterVec::new(
            Opts::new("jobs_finished_total", "Jobs finished, by final status"),
            &["status"],
        )?;
        let scrape_failures = IntCounterVec::new(
            Opts::new("scrape_failures_total", "Failed queries against metric endpoints"),
            &["endpoint"],
        )?;
        let indexing_failures = IntCounter::new(
            "indexing_failures_total",
            "Records that could not be persisted after retries",
        )?;
        let alert_verdicts = IntCounterVec::new(
            Opts::new("alert_verdicts_total", "Alert verdicts, by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(objects_created.clone()))?;
        registry.register(Box::new(objects_failed.clone()))?;
        registry.register(Box::new(objects_deleted.clone()))?;
        registry.register(Box::new(readiness_latency_seconds.clone()))?;
        registry.register(Box::new(jobs_finished.clone()))?;
        registry.register(Box::new(scrape_failures.clone()))?;
        registry.register(Box::new(indexing_failures.clone()))?;
        registry.register(Box::new(alert_verdicts.clone()))?;

        Ok(Self {
            registry,
            objects_created,
            objects_failed,
            objects_deleted,
            readiness_latency_seconds,
            jobs_finished,
            scrape_failures,
            indexing_failures,
            alert_verdicts,
        })
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct BurnerMetrics {
    _private: (),
}

impl Default for BurnerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BurnerMetrics {
    /// Create a handle, registering the metrics on first call
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match BurnerMetricsInner::new() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register self-metrics, continuing without them");
                None
            }
        });
        Self { _private: () }
    }

    fn inner(&self) -> Option<&BurnerMetricsInner> {
        GLOBAL_METRICS.get().and_then(Option::as_ref)
    }

    pub fn inc_created(&self, job: &str) {
        if let Some(m) = self.inner() {
            m.objects_created.with_label_values(&[job]).inc();
        }
    }

    pub fn inc_failed(&self, job: &str) {
        if let Some(m) = self.inner() {
            m.objects_failed.with_label_values(&[job]).inc();
        }
    }

    pub fn inc_deleted(&self, job: &str, count: u64) {
        if let Some(m) = self.inner() {
            m.objects_deleted.with_label_values(&[job]).inc_by(count);
        }
    }

    pub fn observe_readiness(&self, job: &str, latency_secs: f64) {
        if let Some(m) = self.inner() {
            m.readiness_latency_seconds
                .with_label_values(&[job])
                .observe(latency_secs);
        }
    }

    pub fn inc_job_finished(&self, status: &str) {
        if let Some(m) = self.inner() {
            m.jobs_finished.with_label_values(&[status]).inc();
        }
    }

    pub fn inc_scrape_failure(&self, endpoint: &str) {
        if let Some(m) = self.inner() {
            m.scrape_failures.with_label_values(&[endpoint]).inc();
        }
    }

    pub fn inc_indexing_failures(&self, count: u64) {
        if let Some(m) = self.inner() {
            m.indexing_failures.inc_by(count);
        }
    }

    pub fn inc_alert_verdict(&self, outcome: VerdictOutcome) {
        if let Some(m) = self.inner() {
            let label = match outcome {
                VerdictOutcome::Passed => "passed",
                VerdictOutcome::Failed => "failed",
                VerdictOutcome::Error => "error",
            };
            m.alert_verdicts.with_label_values(&[label]).inc();
        }
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> String {
        let Some(m) = self.inner() else {
            return String::new();
        };
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&m.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode self-metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Structured logger for run events
#[derive(Clone)]
pub struct RunLogger {
    run_id: RunId,
}

impl RunLogger {
    pub fn new(run_id: &RunId) -> Self {
        Self {
            run_id: run_id.clone(),
        }
    }

    pub fn log_run_started(&self, jobs: usize, parallel: bool) {
        info!(
            event = "run_started",
            run_id = %self.run_id,
            jobs = jobs,
            parallel = parallel,
            "Benchmark run started"
        );
    }

    pub fn log_job_started(&self, job: &str, planned_objects: usize) {
        info!(
            event = "job_started",
            run_id = %self.run_id,
            job = %job,
            planned_objects = planned_objects,
            "Job started"
        );
    }

    /// Log a finished job
    pub fn log_job_finished(&self, report: &JobReport) {
        info!(
            event = "job_finished",
            run_id = %self.run_id,
            job = %report.job_name,
            status = %report.status,
            created = report.created,
            deleted = report.deleted,
            failed = report.failed,
            not_ready = report.not_ready,
            churn_cycles = report.churn_cycles,
            elapsed_secs = report.elapsed_secs,
            p99_ready_ms = report.readiness.p99_ms,
            "Job finished"
        );
    }

    pub fn log_measurement_error(&self, job: &str, measurement: &str, message: &str) {
        warn!(
            event = "measurement_failed",
            run_id = %self.run_id,
            job = %job,
            measurement = %measurement,
            error = %message,
            "Measurement failed, results discarded"
        );
    }

    pub fn log_scrape(&self, job: &str, endpoint: &str, samples: usize, error: Option<&str>) {
        match error {
            None => info!(
                event = "scrape_finished",
                run_id = %self.run_id,
                job = %job,
                endpoint = %endpoint,
                samples = samples,
                "Scraped metrics"
            ),
            Some(err) => warn!(
                event = "scrape_failed",
                run_id = %self.run_id,
                job = %job,
                endpoint = %endpoint,
                error = %err,
                "Scrape failed"
            ),
        }
    }

    /// Log one alert verdict; breaches are warnings
    pub fn log_alert(&self, verdict: &AlertVerdict) {
        match verdict.outcome {
            VerdictOutcome::Passed => info!(
                event = "alert_evaluated",
                run_id = %self.run_id,
                job = %verdict.job_name,
                expr = %verdict.expression,
                severity = %verdict.severity,
                value = ?verdict.value,
                "Alert passed"
            ),
            VerdictOutcome::Failed => warn!(
                event = "alert_evaluated",
                run_id = %self.run_id,
                job = %verdict.job_name,
                expr = %verdict.expression,
                severity = %verdict.severity,
                value = ?verdict.value,
                description = %verdict.description,
                "Alert breached"
            ),
            VerdictOutcome::Error => warn!(
                event = "alert_evaluated",
                run_id = %self.run_id,
                job = %verdict.job_name,
                expr = %verdict.expression,
                error = ?verdict.error,
                "Alert could not be evaluated"
            ),
        }
    }

    pub fn log_indexed(&self, job: &str, written: usize, failed: usize) {
        if failed == 0 {
            info!(
                event = "records_indexed",
                run_id = %self.run_id,
                job = %job,
                written = written,
                "Records indexed"
            );
        } else {
            warn!(
                event = "records_indexed",
                run_id = %self.run_id,
                job = %job,
                written = written,
                failed = failed,
                "Some records could not be indexed"
            );
        }
    }

    pub fn log_cleanup(&self, deleted: usize, remaining: usize, complete: bool) {
        if complete {
            info!(
                event = "cleanup_finished",
                run_id = %self.run_id,
                deleted = deleted,
                "Cleanup finished"
            );
        } else {
            warn!(
                event = "cleanup_incomplete",
                run_id = %self.run_id,
                deleted = deleted,
                remaining = remaining,
                "Cleanup deadline reached with resources left"
            );
        }
    }

    pub fn log_run_finished(&self, outcome: Outcome, elapsed_secs: f64) {
        match outcome {
            Outcome::Success => info!(
                event = "run_finished",
                run_id = %self.run_id,
                outcome = %outcome,
                elapsed_secs = elapsed_secs,
                "Benchmark run finished"
            ),
            Outcome::Fatal => error!(
                event = "run_finished",
                run_id = %self.run_id,
                outcome = %outcome,
                elapsed_secs = elapsed_secs,
                "Benchmark run aborted"
            ),
            _ => warn!(
                event = "run_finished",
                run_id = %self.run_id,
                outcome = %outcome,
                elapsed_secs = elapsed_secs,
                "Benchmark run finished with problems"
            ),
        }
    }
}
