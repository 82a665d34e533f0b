use super::plan::{namespace_spec, plan_iteration, PlannedObject};
use super::rate_limiter::{RateLimiter, WorkerPool};
use super::readiness::{wait_deleted, wait_ready, PollPolicy, WaitOutcome};
use super::{churn, stats, NoopObserver, ObjectEvent, ObjectObserver};
use crate::cluster::{ClusterClient, ObjectRef, ResourceKind};
use crate::config::{Job, JobType};
use crate::error::{BurnerError, ClusterError, Result};
use crate::models::{JobReport, JobStatus, RunId, TimeWindow};
use crate::observability::BurnerMetrics;
use crate::shutdown::Shutdown;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Object created by this job and still alive
#[derive(Debug, Clone)]
pub(super) struct LiveObject {
    pub reference: ObjectRef,
    pub manifest: Value,
    pub created_at: Instant,
    pub wait: bool,
}

#[derive(Debug)]
pub(super) enum ReadyState {
    Ready(Duration),
    NotReady,
    NotWaited,
    Cancelled,
}

#[derive(Debug)]
pub(super) enum WorkerResult {
    Created(LiveObject, ReadyState),
    CreateFailed { name: String, error: ClusterError },
    Deleted(ObjectRef),
    DeleteFailed { object: ObjectRef, error: String },
}

/// Counters accumulated over a job
#[derive(Debug, Default)]
pub(super) struct Tally {
    pub created: usize,
    pub deleted: usize,
    pub failed: usize,
    pub not_ready: usize,
    pub latencies: Vec<Duration>,
    pub errors: Vec<String>,
}

impl Tally {
    /// Fold one worker result; returns the object when it is now live
    pub fn absorb(&mut self, result: WorkerResult) -> Option<LiveObject> {
        match result {
            WorkerResult::Created(live, ready) => {
                self.created += 1;
                match ready {
                    ReadyState::Ready(latency) => self.latencies.push(latency),
                    ReadyState::NotReady => self.not_ready += 1,
                    ReadyState::NotWaited | ReadyState::Cancelled => {}
                }
                Some(live)
            }
            WorkerResult::CreateFailed { name, error } => {
                self.failed += 1;
                self.errors.push(format!("create {name}: {error}"));
                None
            }
            WorkerResult::Deleted(_) => {
                self.deleted += 1;
                None
            }
            WorkerResult::DeleteFailed { object, error } => {
                self.errors.push(format!("delete {object}: {error}"));
                None
            }
        }
    }
}

/// Everything a worker task needs, cheap to clone
#[derive(Clone)]
pub(super) struct WorkerContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub observer: Arc<dyn ObjectObserver>,
    pub metrics: BurnerMetrics,
    pub job_name: String,
    pub policy: PollPolicy,
    pub fail_fast: bool,
    /// Set once a failed create stopped the job under `fail_fast`
    pub fail_fast_hit: Arc<AtomicBool>,
    pub stop: Shutdown,
}

impl WorkerContext {
    /// Create one object and optionally wait for it
    pub async fn create(self, manifest: Value, name: String, wait: bool) -> WorkerResult {
        let created_at = Instant::now();
        let reference = match self.cluster.create(&manifest).await {
            Ok(reference) => reference,
            Err(error) => {
                self.metrics.inc_failed(&self.job_name);
                warn!(job = %self.job_name, object = %name, error = %error, "Object creation failed");
                if self.fail_fast {
                    self.fail_fast_hit.store(true, Ordering::SeqCst);
                    self.stop.trigger();
                }
                return WorkerResult::CreateFailed { name, error };
            }
        };
        self.metrics.inc_created(&self.job_name);
        self.observer.observe(&ObjectEvent::Created {
            object: reference.clone(),
            job: self.job_name.clone(),
            at: Utc::now(),
        });

        let ready = if wait {
            match wait_ready(self.cluster.as_ref(), &reference, self.policy, &self.stop).await {
                WaitOutcome::Reached(latency) => {
                    self.metrics
                        .observe_readiness(&self.job_name, latency.as_secs_f64());
                    self.observer.observe(&ObjectEvent::Ready {
                        object: reference.clone(),
                        job: self.job_name.clone(),
                        latency,
                        at: Utc::now(),
                    });
                    ReadyState::Ready(latency)
                }
                WaitOutcome::Cancelled => ReadyState::Cancelled,
                other => {
                    debug!(job = %self.job_name, object = %reference, outcome = ?other, "Object not ready");
                    self.observer.observe(&ObjectEvent::NotReady {
                        object: reference.clone(),
                        job: self.job_name.clone(),
                        at: Utc::now(),
                    });
                    ReadyState::NotReady
                }
            }
        } else {
            ReadyState::NotWaited
        };

        WorkerResult::Created(
            LiveObject {
                reference,
                manifest,
                created_at,
                wait,
            },
            ready,
        )
    }

    /// Delete one object; `wait` polls until it is gone
    pub async fn delete(self, object: ObjectRef, wait: bool) -> WorkerResult {
        match self.cluster.delete(&object).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => {}
            Err(e) => {
                return WorkerResult::DeleteFailed {
                    object,
                    error: e.to_string(),
                }
            }
        }
        if wait {
            match wait_deleted(self.cluster.as_ref(), &object, self.policy, &self.stop).await {
                WaitOutcome::Reached(_) => {}
                WaitOutcome::Cancelled => {
                    return WorkerResult::DeleteFailed {
                        object,
                        error: "cancelled while waiting for deletion".to_string(),
                    }
                }
                other => {
                    return WorkerResult::DeleteFailed {
                        object,
                        error: format!("deletion not confirmed: {other:?}"),
                    }
                }
            }
        }
        self.metrics.inc_deleted(&self.job_name, 1);
        self.observer.observe(&ObjectEvent::Deleted {
            object: object.clone(),
            job: self.job_name.clone(),
            at: Utc::now(),
        });
        WorkerResult::Deleted(object)
    }
}

/// Drain every task of `tasks` into `tally`, collecting live objects
pub(super) async fn drain(
    tasks: &mut JoinSet<WorkerResult>,
    tally: &mut Tally,
    live: &mut Vec<LiveObject>,
) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => {
                if let Some(obj) = tally.absorb(result) {
                    live.push(obj);
                }
            }
            Err(e) => tally.errors.push(format!("worker task failed: {e}")),
        }
    }
}

/// Runs jobs against a cluster on behalf of one run
pub struct JobExecutor {
    cluster: Arc<dyn ClusterClient>,
    run_id: RunId,
    job_index: usize,
    observer: Arc<dyn ObjectObserver>,
    metrics: BurnerMetrics,
}

impl JobExecutor {
    pub fn new(cluster: Arc<dyn ClusterClient>, run_id: RunId) -> Self {
        Self {
            cluster,
            run_id,
            job_index: 0,
            observer: Arc::new(NoopObserver),
            metrics: BurnerMetrics::new(),
        }
    }

    /// Position of the job in the benchmark, stamped as a label
    pub fn with_job_index(mut self, index: usize) -> Self {
        self.job_index = index;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ObjectObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Execute `job` until done, timed out, or `shutdown` fires
    ///
    /// Configuration problems and an unreachable cluster are returned as
    /// errors before or instead of a report; per-object failures end up in
    /// the report.
    pub async fn run(&self, job: &Job, shutdown: &Shutdown) -> Result<JobReport> {
        job.validate()?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let (stop, forwarder) = match job.timeout {
            Some(timeout) => shutdown.child_with_deadline(Instant::now() + timeout),
            None => shutdown.child(),
        };

        let ctx = WorkerContext {
            cluster: self.cluster.clone(),
            observer: self.observer.clone(),
            metrics: self.metrics.clone(),
            job_name: job.name.clone(),
            policy: PollPolicy::new(job.poll_interval, job.max_poll_interval, job.max_wait_timeout),
            fail_fast: job.fail_fast,
            fail_fast_hit: Arc::new(AtomicBool::new(false)),
            stop: stop.clone(),
        };
        let pool = WorkerPool::new(job.concurrency, RateLimiter::new(job.qps, job.burst));

        let mut tally = Tally::default();
        let outcome = match job.job_type {
            JobType::Create => self.run_create(job, &ctx, &pool, &mut tally).await,
            JobType::Delete => self.run_delete(job, &ctx, &pool, &mut tally).await,
        };
        forwarder.abort();
        let churn_cycles = outcome?;

        let status = if ctx.fail_fast_hit.load(Ordering::SeqCst) {
            JobStatus::Failed
        } else if stop.is_triggered() {
            JobStatus::TimedOut
        } else if tally.failed > 0 || tally.not_ready > 0 {
            JobStatus::Degraded
        } else {
            JobStatus::Completed
        };
        self.metrics.inc_job_finished(&status.to_string());

        let report = JobReport {
            job_name: job.name.clone(),
            run_id: self.run_id.clone(),
            status,
            created: tally.created,
            deleted: tally.deleted,
            failed: tally.failed,
            not_ready: tally.not_ready,
            churn_cycles,
            elapsed_secs: clock.elapsed().as_secs_f64(),
            readiness: stats::summarize(&tally.latencies),
            window: TimeWindow::new(started_at, Utc::now()),
            errors: tally.errors,
            metadata: BTreeMap::new(),
        };
        info!(
            job = %report.job_name,
            status = %report.status,
            created = report.created,
            failed = report.failed,
            not_ready = report.not_ready,
            "Job execution finished"
        );
        Ok(report)
    }

    async fn ensure_namespace(&self, job: &Job, iteration: usize) -> Result<()> {
        let spec = namespace_spec(job, iteration, &self.run_id, self.job_index);
        match self.cluster.create_namespace(&spec).await {
            Ok(()) => {
                debug!(job = %job.name, namespace = %spec.name, "Namespace created");
                Ok(())
            }
            Err(ClusterError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(BurnerError::from(e)),
        }
    }

    async fn run_create(
        &self,
        job: &Job,
        ctx: &WorkerContext,
        pool: &WorkerPool,
        tally: &mut Tally,
    ) -> Result<usize> {
        let stop = &ctx.stop;
        let mut live = Vec::with_capacity(job.total_objects());
        let mut tasks = JoinSet::new();

        'iterations: for iteration in 0..job.job_iterations {
            if stop.is_triggered() {
                break;
            }
            if iteration > 0 {
                if let Some(delay) = job.job_iteration_delay {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.triggered() => break,
                    }
                }
            }
            if iteration == 0 || job.namespaced_iterations {
                self.ensure_namespace(job, iteration).await?;
            }
            for planned in plan_iteration(job, iteration, &self.run_id, self.job_index)? {
                let PlannedObject {
                    name, manifest, wait, ..
                } = planned;
                let work = ctx.clone().create(manifest, name, wait);
                if !pool.submit(&mut tasks, stop, work).await {
                    break 'iterations;
                }
            }
        }
        drain(&mut tasks, tally, &mut live).await;

        let mut cycles = 0;
        if let Some(policy) = &job.churn {
            if !stop.is_triggered() {
                cycles = churn::run(ctx, pool, policy, &mut live, tally).await;
            }
        }
        Ok(cycles)
    }

    async fn run_delete(
        &self,
        job: &Job,
        ctx: &WorkerContext,
        pool: &WorkerPool,
        tally: &mut Tally,
    ) -> Result<usize> {
        let mut tasks = JoinSet::new();
        let mut unused = Vec::new();
        'targets: for target in &job.delete_objects {
            if ctx.stop.is_triggered() {
                break;
            }
            let kind = ResourceKind::new(target.api_version.clone(), target.kind.clone());
            let objects = self
                .cluster
                .list(&kind, target.namespace.as_deref(), &target.label_selector)
                .await
                .map_err(BurnerError::from)?;
            info!(job = %job.name, kind = %kind, matched = objects.len(), "Deleting objects");
            for object in objects {
                let work = ctx.clone().delete(object, job.wait_for_ready);
                if !pool.submit(&mut tasks, &ctx.stop, work).await {
                    break 'targets;
                }
            }
        }
        drain(&mut tasks, tally, &mut unused).await;
        Ok(0)
    }
}
