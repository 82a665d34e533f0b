//! Garbage collection of everything a run created
//!
//! Resources are found by the run label alone, so a destroy works from a
//! fresh process that only knows the run id.

use crate::cluster::{ClusterClient, ClusterResult, ObjectRef, ResourceKind};
use crate::error::{BurnerError, ClusterError, Result};
use crate::executor::{RateLimiter, WorkerPool};
use crate::models::RunId;
use crate::observability::{BurnerMetrics, RunLogger};
use crate::outcome::Outcome;
use crate::shutdown::Shutdown;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

const DEFAULT_CONCURRENCY: usize = 10;
const INITIAL_POLL: Duration = Duration::from_millis(50);
const MAX_POLL: Duration = Duration::from_secs(2);

/// What a destroy achieved
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupReport {
    pub run_id: RunId,
    pub deleted_objects: usize,
    pub deleted_namespaces: usize,
    /// Labelled resources still present when the call returned
    pub remaining: Vec<ObjectRef>,
    /// Everything labelled with the run is gone
    pub complete: bool,
    pub errors: Vec<String>,
    pub elapsed_secs: f64,
}

impl CleanupReport {
    /// An incomplete cleanup ran out of time
    pub fn outcome(&self) -> Outcome {
        if self.complete {
            Outcome::Success
        } else {
            Outcome::Timeout
        }
    }
}

/// Labelled resources at one point in time
#[derive(Debug, Default)]
struct Survey {
    namespaces: Vec<String>,
    /// Objects outside the labelled namespaces
    objects: Vec<ObjectRef>,
}

impl Survey {
    fn is_empty(&self) -> bool {
        self.namespaces.is_empty() && self.objects.is_empty()
    }

    fn remaining(&self) -> Vec<ObjectRef> {
        let namespace_kind = ResourceKind::new("v1", "Namespace").cluster_scoped();
        self.namespaces
            .iter()
            .map(|ns| ObjectRef::new(namespace_kind.clone(), None, ns.clone()))
            .chain(self.objects.iter().cloned())
            .collect()
    }
}

enum Deletion {
    Object(ObjectRef, ClusterResult<()>),
    Namespace(String, ClusterResult<()>),
}

/// Deletes every resource labelled with a run id
pub struct Cleanup {
    cluster: Arc<dyn ClusterClient>,
    run_id: RunId,
    concurrency: usize,
    metrics: BurnerMetrics,
}

impl Cleanup {
    pub fn new(cluster: Arc<dyn ClusterClient>, run_id: RunId) -> Self {
        Self {
            cluster,
            run_id,
            concurrency: DEFAULT_CONCURRENCY,
            metrics: BurnerMetrics::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    async fn survey(&self, kinds: &[ResourceKind]) -> ClusterResult<Survey> {
        let selector = self.run_id.label_selector();
        let namespaces = self.cluster.list_namespaces(&selector).await?;
        let owned: BTreeSet<&str> = namespaces.iter().map(String::as_str).collect();
        let mut objects = Vec::new();
        for kind in kinds {
            match self.cluster.list(kind, None, &selector).await {
                Ok(found) => objects.extend(found.into_iter().filter(|o| {
                    o.namespace
                        .as_deref()
                        .map_or(true, |ns| !owned.contains(ns))
                })),
                Err(ClusterError::Unreachable(e)) => return Err(ClusterError::Unreachable(e)),
                Err(e) => debug!(kind = %kind, error = %e, "Skipping kind during cleanup"),
            }
        }
        Ok(Survey {
            namespaces,
            objects,
        })
    }

    /// Delete everything labelled with the run id, giving up at `timeout`
    ///
    /// Returns at the deadline at the latest; resources still present then
    /// are listed in the report. Only an unreachable cluster is an error.
    pub async fn destroy(&self, timeout: Duration) -> Result<CleanupReport> {
        let clock = Instant::now();
        let deadline = clock + timeout;
        let logger = RunLogger::new(&self.run_id);
        let mut report = CleanupReport {
            run_id: self.run_id.clone(),
            deleted_objects: 0,
            deleted_namespaces: 0,
            remaining: Vec::new(),
            complete: false,
            errors: Vec::new(),
            elapsed_secs: 0.0,
        };

        let first = timeout_at(deadline, async {
            let kinds = self.cluster.deletable_kinds().await?;
            let survey = self.survey(&kinds).await?;
            Ok::<_, ClusterError>((kinds, survey))
        })
        .await;
        let (kinds, survey) = match first {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => return Err(BurnerError::from(e)),
            Err(_) => {
                report.errors.push("deadline passed while listing resources".to_string());
                report.elapsed_secs = clock.elapsed().as_secs_f64();
                logger.log_cleanup(0, 0, false);
                return Ok(report);
            }
        };
        info!(
            run_id = %self.run_id,
            namespaces = survey.namespaces.len(),
            objects = survey.objects.len(),
            "Destroying run resources"
        );

        if !survey.is_empty() {
            self.delete_all(&survey, deadline, &mut report).await;
        }

        let mut last = survey;
        let mut interval = INITIAL_POLL;
        loop {
            if last.is_empty() {
                report.complete = true;
                break;
            }
            if Instant::now() + interval >= deadline {
                break;
            }
            tokio::time::sleep(interval).await;
            interval = std::cmp::min(interval * 2, MAX_POLL);
            match timeout_at(deadline, self.survey(&kinds)).await {
                Ok(Ok(survey)) => last = survey,
                Ok(Err(e)) => {
                    warn!(run_id = %self.run_id, error = %e, "Cleanup survey failed");
                    report.errors.push(e.to_string());
                }
                Err(_) => break,
            }
        }

        if !report.complete {
            report.remaining = last.remaining();
        }
        report.elapsed_secs = clock.elapsed().as_secs_f64();
        logger.log_cleanup(
            report.deleted_objects + report.deleted_namespaces,
            report.remaining.len(),
            report.complete,
        );
        Ok(report)
    }

    async fn delete_all(&self, survey: &Survey, deadline: Instant, report: &mut CleanupReport) {
        let (stop, forwarder) = Shutdown::new().child_with_deadline(deadline);
        let pool = WorkerPool::new(self.concurrency, RateLimiter::unlimited());
        let mut tasks = JoinSet::new();

        'submit: {
            for object in &survey.objects {
                let cluster = self.cluster.clone();
                let object = object.clone();
                let work = async move {
                    let result = cluster.delete(&object).await;
                    Deletion::Object(object, result)
                };
                if !pool.submit(&mut tasks, &stop, work).await {
                    break 'submit;
                }
            }
            for namespace in &survey.namespaces {
                let cluster = self.cluster.clone();
                let namespace = namespace.clone();
                let work = async move {
                    let result = cluster.delete_namespace(&namespace).await;
                    Deletion::Namespace(namespace, result)
                };
                if !pool.submit(&mut tasks, &stop, work).await {
                    break 'submit;
                }
            }
        }

        loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = stop.triggered() => {
                    // issued deletions run to completion on their own
                    debug!(in_flight = tasks.len(), "Cleanup deadline reached, no new deletions");
                    tasks.detach_all();
                    break;
                }
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok(Deletion::Object(_, Ok(()) | Err(ClusterError::NotFound(_)))) => {
                    report.deleted_objects += 1;
                }
                Ok(Deletion::Namespace(_, Ok(()) | Err(ClusterError::NotFound(_)))) => {
                    report.deleted_namespaces += 1;
                }
                Ok(Deletion::Object(object, Err(e))) => {
                    warn!(object = %object, error = %e, "Delete failed");
                    report.errors.push(format!("{object}: {e}"));
                }
                Ok(Deletion::Namespace(namespace, Err(e))) => {
                    warn!(namespace = %namespace, error = %e, "Namespace delete failed");
                    report.errors.push(format!("namespace {namespace}: {e}"));
                }
                Err(e) => report.errors.push(format!("delete task stopped: {e}")),
            }
        }
        forwarder.abort();
        self.metrics.inc_deleted("cleanup", report.deleted_objects as u64);
    }
}

/// Delete everything labelled with `run_id`
pub async fn destroy(cluster: Arc<dyn ClusterClient>, run_id: &RunId, timeout: Duration) -> Result<CleanupReport> {
    Cleanup::new(cluster, run_id.clone()).destroy(timeout).await
}
