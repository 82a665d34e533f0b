//! Measurement collectors and their lifecycle
//!
//! A [`MeasurementSet`] drives every configured [`Measurement`] through
//! `Created -> Collecting -> Stopped -> Indexed`. Collectors are isolated
//! from each other: one that fails or panics is logged, its partial
//! results are dropped and the others carry on.

mod object_count;
mod object_latency;
pub mod poller;

pub use object_count::ObjectCount;
pub use object_latency::ObjectLatency;

use crate::cluster::{ClusterClient, ResourceKind};
use crate::config::{MeasurementConfig, MeasurementKind};
use crate::error::{BurnerError, Result};
use crate::executor::{ObjectEvent, ObjectObserver};
use crate::indexer::{IndexSummary, IndexWriter};
use crate::models::{Record, RunId, Sample, TimeWindow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a measurement observes
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementScope {
    /// Restrict listing to these namespaces; every namespace when empty
    pub namespaces: Vec<String>,
    pub label_selector: String,
    /// Kinds counted or tracked
    pub kinds: Vec<ResourceKind>,
    /// Objects are reported by a job executor instead of discovered by polling
    pub follow_events: bool,
}

impl MeasurementScope {
    /// Scope of a job executed by this run
    pub fn for_job(run_id: &RunId, job_name: &str, kinds: Vec<ResourceKind>) -> Self {
        Self {
            namespaces: Vec::new(),
            label_selector: format!(
                "{},{}={}",
                run_id.label_selector(),
                crate::models::JOB_LABEL,
                job_name
            ),
            kinds,
            follow_events: true,
        }
    }

    /// Scope of objects created by someone else (`measure`)
    pub fn external(namespaces: Vec<String>, label_selector: impl Into<String>, kinds: Vec<ResourceKind>) -> Self {
        Self {
            namespaces,
            label_selector: label_selector.into(),
            kinds,
            follow_events: false,
        }
    }
}

/// Everything a collector receives when it starts
#[derive(Clone)]
pub struct MeasurementContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub run_id: RunId,
    pub job_name: String,
    pub scope: MeasurementScope,
}

/// A collector of samples over one job window
#[async_trait]
pub trait Measurement: Send + Sync {
    fn name(&self) -> &str;

    /// Begin collecting; background polling starts here
    async fn start(&self, ctx: MeasurementContext) -> Result<()>;

    /// Force an immediate snapshot
    async fn collect(&self) -> Result<()>;

    /// Stop collecting and hand over every sample gathered
    async fn stop(&self) -> Result<Vec<Sample>>;

    /// Object events from the executor; ignored by default
    fn observe(&self, _event: &ObjectEvent) {}
}

/// Build the collector configured by `config`
pub fn build(config: &MeasurementConfig, default_interval: Duration) -> Arc<dyn Measurement> {
    let interval = config.interval.unwrap_or(default_interval);
    match config.name {
        MeasurementKind::ObjectLatency => Arc::new(ObjectLatency::new(interval)),
        MeasurementKind::ObjectCount => Arc::new(ObjectCount::new(interval)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementState {
    Created,
    Collecting,
    Stopped,
    Indexed,
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MeasurementState::Created => "created",
            MeasurementState::Collecting => "collecting",
            MeasurementState::Stopped => "stopped",
            MeasurementState::Indexed => "indexed",
        };
        f.write_str(s)
    }
}

/// A collector that failed, with the reason
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementFailure {
    pub measurement: String,
    pub message: String,
}

impl From<MeasurementFailure> for BurnerError {
    fn from(f: MeasurementFailure) -> Self {
        BurnerError::Measurement {
            measurement: f.measurement,
            message: f.message,
        }
    }
}

/// Finalized output of a set
#[derive(Debug, Clone, Default)]
pub struct MeasurementOutput {
    pub samples: Vec<Sample>,
    pub failures: Vec<MeasurementFailure>,
    pub window: Option<TimeWindow>,
}

struct Member {
    measurement: Arc<dyn Measurement>,
    failed: AtomicBool,
}

struct SetState {
    state: MeasurementState,
    started_at: Option<DateTime<Utc>>,
    job_name: String,
    failures: Vec<MeasurementFailure>,
    output: Option<MeasurementOutput>,
}

/// The collectors attached to one job
pub struct MeasurementSet {
    members: Vec<Member>,
    inner: Mutex<SetState>,
}

impl MeasurementSet {
    pub fn new(measurements: Vec<Arc<dyn Measurement>>) -> Self {
        Self {
            members: measurements
                .into_iter()
                .map(|measurement| Member {
                    measurement,
                    failed: AtomicBool::new(false),
                })
                .collect(),
            inner: Mutex::new(SetState {
                state: MeasurementState::Created,
                started_at: None,
                job_name: String::new(),
                failures: Vec::new(),
                output: None,
            }),
        }
    }

    /// Build from configuration entries
    pub fn from_config(configs: &[MeasurementConfig], default_interval: Duration) -> Self {
        Self::new(configs.iter().map(|c| build(c, default_interval)).collect())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SetState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> MeasurementState {
        self.lock().state
    }

    fn fail(&self, member: &Member, message: String) {
        member.failed.store(true, Ordering::SeqCst);
        let name = member.measurement.name().to_string();
        let mut inner = self.lock();
        warn!(job = %inner.job_name, measurement = %name, error = %message, "Measurement failed");
        inner.failures.push(MeasurementFailure {
            measurement: name,
            message,
        });
    }

    fn active(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(|m| !m.failed.load(Ordering::SeqCst))
    }

    /// Start every collector; the window opens now
    pub async fn start(&self, ctx: MeasurementContext) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.state != MeasurementState::Created {
                return Err(BurnerError::Measurement {
                    measurement: "set".into(),
                    message: format!("cannot start from state {}", inner.state),
                });
            }
            inner.state = MeasurementState::Collecting;
            inner.started_at = Some(Utc::now());
            inner.job_name = ctx.job_name.clone();
        }
        for member in &self.members {
            let measurement = member.measurement.clone();
            let ctx = ctx.clone();
            let joined = tokio::spawn(async move { measurement.start(ctx).await }).await;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.fail(member, e.to_string()),
                Err(e) => self.fail(member, format!("panicked during start: {e}")),
            }
        }
        info!(
            job = %ctx.job_name,
            measurements = self.members.len(),
            "Measurements started"
        );
        Ok(())
    }

    /// Snapshot every running collector
    pub async fn collect(&self) {
        if self.state() != MeasurementState::Collecting {
            return;
        }
        for member in self.active() {
            let measurement = member.measurement.clone();
            match tokio::spawn(async move { measurement.collect().await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.fail(member, e.to_string()),
                Err(e) => self.fail(member, format!("panicked during collect: {e}")),
            }
        }
    }

    /// Stop every collector and finalize the output
    ///
    /// Failed collectors are stopped too but contribute nothing. Samples
    /// outside the collection window are dropped. Calling `stop` again
    /// returns the same output.
    pub async fn stop(&self) -> MeasurementOutput {
        {
            let inner = self.lock();
            if let Some(output) = &inner.output {
                return output.clone();
            }
        }
        let mut collected = Vec::new();
        for member in &self.members {
            let measurement = member.measurement.clone();
            let stopped = tokio::spawn(async move { measurement.stop().await }).await;
            if member.failed.load(Ordering::SeqCst) {
                // already reported; stopping only ends its background work
                debug!(measurement = %member.measurement.name(), "Stopped failed measurement");
                continue;
            }
            match stopped {
                Ok(Ok(samples)) => collected.push(samples),
                Ok(Err(e)) => self.fail(member, e.to_string()),
                Err(e) => self.fail(member, format!("panicked during stop: {e}")),
            }
        }
        let stopped_at = Utc::now();

        let mut inner = self.lock();
        if let Some(output) = &inner.output {
            return output.clone();
        }
        let window = inner.started_at.map(|start| TimeWindow::new(start, stopped_at));
        let samples: Vec<Sample> = collected
            .into_iter()
            .flatten()
            .filter(|s| window.is_some_and(|w| w.contains(s.timestamp)))
            .collect();
        let output = MeasurementOutput {
            samples,
            failures: inner.failures.clone(),
            window,
        };
        inner.state = MeasurementState::Stopped;
        inner.output = Some(output.clone());
        output
    }

    /// Persist the finalized samples as measurement records
    pub async fn index(&self, writer: &IndexWriter) -> Result<IndexSummary> {
        let samples = {
            let inner = self.lock();
            match (&inner.state, &inner.output) {
                (MeasurementState::Stopped, Some(output)) => output.samples.clone(),
                (state, _) => {
                    return Err(BurnerError::Measurement {
                        measurement: "set".into(),
                        message: format!("cannot index from state {state}"),
                    })
                }
            }
        };
        let records: Vec<Record> = samples.into_iter().map(Record::Measurement).collect();
        let summary = writer.write(records).await;
        self.lock().state = MeasurementState::Indexed;
        Ok(summary)
    }
}

impl ObjectObserver for MeasurementSet {
    fn observe(&self, event: &ObjectEvent) {
        if self.state() != MeasurementState::Collecting {
            return;
        }
        for member in self.active() {
            let measurement = &member.measurement;
            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| measurement.observe(event)));
            if delivered.is_err() {
                self.fail(member, "panicked while observing an object event".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests;
