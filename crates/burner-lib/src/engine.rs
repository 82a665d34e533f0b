//! Benchmark run orchestration
//!
//! A [`Benchmark`] drives one run end to end: optional health check, every
//! job with its measurements, scraping and alerting over each job window,
//! indexing, and garbage collection. Problems are accumulated in the
//! [`RunReport`] and folded into a single [`Outcome`].

use crate::alerting::{AlertEvaluator, AlertSummary};
use crate::cleanup::{destroy, CleanupReport};
use crate::cluster::{ClusterClient, ClusterHealth, ResourceKind};
use crate::config::{AlertProfile, BenchmarkSpec, EngineSettings, Job, JobType};
use crate::error::{BurnerError, Result};
use crate::executor::JobExecutor;
use crate::indexer::{IndexSummary, IndexWriter};
use crate::measurements::{MeasurementContext, MeasurementFailure, MeasurementScope, MeasurementSet};
use crate::models::{AlertSeverity, AlertVerdict, JobReport, JobStatus, Record, RunId};
use crate::observability::RunLogger;
use crate::outcome::Outcome;
use crate::scraper::{ScrapeFailure, Scraper};
use crate::shutdown::Shutdown;
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Everything that happened to one job
#[derive(Debug, Clone)]
pub struct JobRun {
    pub report: JobReport,
    pub measurement_failures: Vec<MeasurementFailure>,
    pub measurement_samples: usize,
    pub metric_samples: usize,
    pub scrape_failures: Vec<ScrapeFailure>,
    /// Every scraped endpoint failed
    pub scrape_dead: bool,
    pub alerts: Vec<AlertVerdict>,
    pub indexed: IndexSummary,
}

/// Aggregate result of a run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub jobs: Vec<JobRun>,
    /// Error that stopped the run
    pub fatal: Option<String>,
    /// The run deadline or an external shutdown cut the run short
    pub interrupted: bool,
    pub fail_severity: AlertSeverity,
    pub cleanup: Option<CleanupReport>,
    pub archive: Option<PathBuf>,
    /// Non-fatal problems outside any job
    pub warnings: Vec<String>,
    pub elapsed_secs: f64,
}

impl RunReport {
    fn new(run_id: RunId, fail_severity: AlertSeverity) -> Self {
        Self {
            run_id,
            jobs: Vec::new(),
            fatal: None,
            interrupted: false,
            fail_severity,
            cleanup: None,
            archive: None,
            warnings: Vec::new(),
            elapsed_secs: 0.0,
        }
    }

    pub fn alerts(&self) -> AlertSummary {
        AlertSummary::new(self.jobs.iter().flat_map(|j| j.alerts.iter().cloned()).collect())
    }

    /// Fold every problem of the run into one outcome
    pub fn outcome(&self) -> Outcome {
        let mut outcome = Outcome::Success;
        if self.fatal.is_some() {
            outcome = outcome.merge(Outcome::Fatal);
        }
        if self.interrupted {
            outcome = outcome.merge(Outcome::Timeout);
        }
        for job in &self.jobs {
            // a job's own timeout degrades the run; only the run deadline is a timeout
            outcome = outcome.merge(match job.report.status {
                JobStatus::Completed => Outcome::Success,
                JobStatus::Degraded | JobStatus::TimedOut => Outcome::Degraded,
                JobStatus::Failed => Outcome::Fatal,
            });
            if job.scrape_dead {
                outcome = outcome.merge(Outcome::Fatal);
            }
            if !job.measurement_failures.is_empty()
                || !job.scrape_failures.is_empty()
                || !job.indexed.is_complete()
            {
                outcome = outcome.merge(Outcome::Degraded);
            }
        }
        let alerts = self.alerts();
        if alerts.failed(self.fail_severity) {
            outcome = outcome.merge(Outcome::AlertsFailed);
        }
        if alerts.errors().next().is_some() {
            outcome = outcome.merge(Outcome::Degraded);
        }
        if self.cleanup.as_ref().is_some_and(|c| !c.complete) || !self.warnings.is_empty() {
            outcome = outcome.merge(Outcome::Degraded);
        }
        outcome
    }
}

/// One benchmark run against a cluster
pub struct Benchmark {
    spec: BenchmarkSpec,
    cluster: Arc<dyn ClusterClient>,
    run_id: RunId,
    settings: EngineSettings,
    timeout: Duration,
    user_metadata: BTreeMap<String, Value>,
    writer: Option<IndexWriter>,
    scraper: Option<Scraper>,
    evaluators: Vec<(AlertEvaluator, AlertProfile)>,
    logger: RunLogger,
}

impl Benchmark {
    /// Build the run from a validated spec
    ///
    /// Scrape targets, alert evaluators and the indexer are derived from the
    /// spec's endpoints and indexer section.
    pub fn from_spec(
        spec: BenchmarkSpec,
        cluster: Arc<dyn ClusterClient>,
        run_id: RunId,
        settings: EngineSettings,
    ) -> Result<Self> {
        spec.validate()?;
        let scraper = Scraper::from_endpoints(&spec.metrics_endpoints, &settings)?;
        let mut evaluators = Vec::new();
        for endpoint in spec.metrics_endpoints.iter().filter(|e| !e.alert_profile.is_empty()) {
            evaluators.push((
                AlertEvaluator::for_endpoint(endpoint, &settings, run_id.clone())?,
                endpoint.alert_profile.clone(),
            ));
        }
        let writer = match &spec.indexer {
            Some(target) => Some(target.writer(&settings)?),
            None => None,
        };
        Ok(Self {
            timeout: spec.global.timeout,
            logger: RunLogger::new(&run_id),
            spec,
            cluster,
            run_id,
            settings,
            user_metadata: BTreeMap::new(),
            writer,
            scraper: (!scraper.is_empty()).then_some(scraper),
            evaluators,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Override `global.timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extra fields merged into every job summary record
    pub fn with_user_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.user_metadata = metadata;
        self
    }

    pub fn with_writer(mut self, writer: IndexWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_scraper(mut self, scraper: Scraper) -> Self {
        self.scraper = (!scraper.is_empty()).then_some(scraper);
        self
    }

    pub fn with_alerts(mut self, evaluator: AlertEvaluator, profile: AlertProfile) -> Self {
        self.evaluators.push((evaluator, profile));
        self
    }

    /// Execute the whole run
    pub async fn run(&self, shutdown: &Shutdown) -> RunReport {
        let clock = Instant::now();
        let global = &self.spec.global;
        let mut report = RunReport::new(self.run_id.clone(), global.fail_severity);
        self.logger.log_run_started(self.spec.jobs.len(), global.parallel_jobs);

        let (stop, timer) = shutdown.child_with_deadline(clock + self.timeout);

        if global.cluster_health {
            if let Err(e) = ClusterHealth::ensure_healthy(self.cluster.as_ref()).await {
                report.fatal = Some(e.to_string());
            }
        }

        if report.fatal.is_none() {
            if global.parallel_jobs {
                let runs = join_all(
                    self.spec
                        .jobs
                        .iter()
                        .enumerate()
                        .map(|(idx, job)| self.run_job(idx, job, &stop)),
                )
                .await;
                for run in runs {
                    match run {
                        Ok(job) => report.jobs.push(job),
                        Err(e) => {
                            error!(run_id = %self.run_id, error = %e, "Job aborted the run");
                            report.fatal.get_or_insert_with(|| e.to_string());
                        }
                    }
                }
            } else {
                for (idx, job) in self.spec.jobs.iter().enumerate() {
                    if stop.is_triggered() {
                        warn!(run_id = %self.run_id, job = %job.name, "Skipping job, run is stopping");
                        break;
                    }
                    match self.run_job(idx, job, &stop).await {
                        Ok(run) => {
                            let abort = run.report.status == JobStatus::Failed || run.scrape_dead;
                            report.jobs.push(run);
                            if abort {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(run_id = %self.run_id, job = %job.name, error = %e, "Job aborted the run");
                            report.fatal = Some(e.to_string());
                            break;
                        }
                    }
                }
            }
        }
        report.interrupted = stop.is_triggered();
        timer.abort();

        if let Some(writer) = &self.writer {
            match writer.finalize().await {
                Ok(archive) => report.archive = archive,
                Err(e) => report.warnings.push(format!("finalizing indexer: {e}")),
            }
        }

        if global.gc {
            match destroy(self.cluster.clone(), &self.run_id, global.gc_timeout).await {
                Ok(cleanup) => report.cleanup = Some(cleanup),
                Err(e) => report.warnings.push(format!("garbage collection: {e}")),
            }
        }

        report.elapsed_secs = clock.elapsed().as_secs_f64();
        self.logger.log_run_finished(report.outcome(), report.elapsed_secs);
        report
    }

    /// Kinds a job creates, observed by its measurements
    fn job_kinds(job: &Job) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = match job.job_type {
            JobType::Create => job
                .objects
                .iter()
                .filter_map(|o| o.manifest())
                .filter_map(|m| ResourceKind::of_manifest(m).ok())
                .collect(),
            JobType::Delete => job
                .delete_objects
                .iter()
                .map(|t| ResourceKind::new(t.api_version.clone(), t.kind.clone()))
                .collect(),
        };
        kinds.sort();
        kinds.dedup();
        kinds
    }

    async fn run_job(&self, idx: usize, job: &Job, stop: &Shutdown) -> Result<JobRun> {
        self.logger.log_job_started(&job.name, job.total_objects());

        let measurements = Arc::new(MeasurementSet::from_config(
            &self.spec.global.measurements,
            self.settings.measurement_interval(),
        ));
        let ctx = MeasurementContext {
            cluster: self.cluster.clone(),
            run_id: self.run_id.clone(),
            job_name: job.name.clone(),
            scope: MeasurementScope::for_job(&self.run_id, &job.name, Self::job_kinds(job)),
        };
        measurements.start(ctx).await?;

        let executor = JobExecutor::new(self.cluster.clone(), self.run_id.clone())
            .with_job_index(idx)
            .with_observer(measurements.clone());
        let executed = executor.run(job, stop).await;
        measurements.collect().await;
        let output = measurements.stop().await;
        let mut report = executed?;
        // the measurement window brackets the executor's, so every sample lies inside the job window
        if let Some(window) = output.window {
            report.window = window;
        }
        report.metadata = self.user_metadata.clone();
        self.logger.log_job_finished(&report);
        for failure in &output.failures {
            self.logger
                .log_measurement_error(&job.name, &failure.measurement, &failure.message);
        }

        let window = report.window;
        let mut run = JobRun {
            report,
            measurement_failures: output.failures.clone(),
            measurement_samples: output.samples.len(),
            metric_samples: 0,
            scrape_failures: Vec::new(),
            scrape_dead: false,
            alerts: Vec::new(),
            indexed: IndexSummary::default(),
        };

        let mut metric_records = Vec::new();
        if let Some(scraper) = &self.scraper {
            let scraped = scraper.scrape(window, &job.name, &self.run_id, stop).await;
            for failure in &scraped.failures {
                self.logger
                    .log_scrape(&job.name, &failure.endpoint, 0, Some(&failure.message));
            }
            if scraped.is_clean() {
                self.logger.log_scrape(&job.name, "all", scraped.samples.len(), None);
            }
            run.metric_samples = scraped.samples.len();
            run.scrape_dead = scraped.all_failed();
            run.scrape_failures = scraped.failures;
            metric_records = scraped.samples.into_iter().map(Record::Metric).collect();
        }

        for (evaluator, profile) in &self.evaluators {
            let verdicts = evaluator.evaluate(profile, window, &job.name, stop).await;
            for verdict in &verdicts {
                self.logger.log_alert(verdict);
            }
            run.alerts.extend(verdicts);
        }

        if let Some(writer) = &self.writer {
            let mut indexed = match measurements.index(writer).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Measurements not indexed");
                    IndexSummary {
                        errors: vec![e.to_string()],
                        failed: output.samples.len(),
                        ..Default::default()
                    }
                }
            };
            let mut records = metric_records;
            records.extend(run.alerts.iter().cloned().map(Record::Alert));
            records.push(Record::JobSummary(run.report.clone()));
            indexed.merge(writer.write(records).await);
            self.logger.log_indexed(&job.name, indexed.written, indexed.failed);
            run.indexed = indexed;
        }

        info!(
            run_id = %self.run_id,
            job = %job.name,
            samples = run.measurement_samples,
            metrics = run.metric_samples,
            alerts = run.alerts.len(),
            "Job pipeline finished"
        );
        Ok(run)
    }
}

/// Measurements over objects created outside a run
#[derive(Debug, Clone)]
pub struct MeasureReport {
    pub run_id: RunId,
    pub samples: usize,
    pub failures: Vec<MeasurementFailure>,
    pub indexed: Option<IndexSummary>,
}

impl MeasureReport {
    pub fn outcome(&self) -> Outcome {
        let index_failed = self.indexed.as_ref().is_some_and(|i| !i.is_complete());
        if self.failures.is_empty() && !index_failed {
            Outcome::Success
        } else {
            Outcome::Degraded
        }
    }
}

/// Snapshot the configured measurements over an external scope
pub async fn measure(
    spec: &BenchmarkSpec,
    cluster: Arc<dyn ClusterClient>,
    run_id: RunId,
    job_name: &str,
    scope: MeasurementScope,
    settings: &EngineSettings,
) -> Result<MeasureReport> {
    if !spec.jobs.is_empty() {
        return Err(BurnerError::config("measure does not run jobs; remove them from the benchmark spec"));
    }
    if spec.global.measurements.is_empty() {
        return Err(BurnerError::config("no measurements configured in global.measurements"));
    }
    let set = MeasurementSet::from_config(&spec.global.measurements, settings.measurement_interval());
    set.start(MeasurementContext {
        cluster,
        run_id: run_id.clone(),
        job_name: job_name.to_string(),
        scope,
    })
    .await?;
    set.collect().await;
    let output = set.stop().await;
    let indexed = match &spec.indexer {
        Some(target) => Some(set.index(&target.writer(settings)?).await?),
        None => None,
    };
    info!(run_id = %run_id, job = %job_name, samples = output.samples.len(), "Measurements collected");
    Ok(MeasureReport {
        run_id,
        samples: output.samples.len(),
        failures: output.failures,
        indexed,
    })
}
