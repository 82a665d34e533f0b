//! Creation-to-ready latency of every object in scope

use super::poller::Poller;
use super::{Measurement, MeasurementContext};
use crate::cluster::{ClusterClient, ObjectRef};
use crate::error::{BurnerError, Result};
use crate::executor::stats::summarize;
use crate::executor::{is_ready, ObjectEvent};
use crate::models::Sample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NAME: &str = "objectLatency";
pub const LATENCY_METRIC: &str = "objectReadyLatency";
pub const QUANTILES_METRIC: &str = "objectReadyLatencyQuantiles";

#[derive(Default)]
struct Tracker {
    ctx: Option<MeasurementContext>,
    created: HashMap<ObjectRef, DateTime<Utc>>,
    samples: Vec<Sample>,
    latencies: Vec<Duration>,
    not_ready: usize,
}

impl Tracker {
    fn record_ready(&mut self, object: &ObjectRef, latency: Duration, at: DateTime<Utc>) {
        let Some(ctx) = &self.ctx else {
            return;
        };
        let sample = Sample::new(
            LATENCY_METRIC,
            latency.as_secs_f64() * 1000.0,
            at,
            ctx.job_name.clone(),
            &ctx.run_id,
        )
        .with_label("kind", object.kind.kind.clone())
        .with_label("namespace", object.namespace.clone().unwrap_or_default())
        .with_label("name", object.name.clone());
        self.samples.push(sample);
        self.latencies.push(latency);
        self.created.remove(object);
    }
}

/// Tracks objects from creation until they report ready
///
/// Inside a run, timing comes from executor events. For externally created
/// objects it polls the scope and uses `metadata.creationTimestamp`.
pub struct ObjectLatency {
    interval: Duration,
    tracker: Arc<Mutex<Tracker>>,
    poller: tokio::sync::Mutex<Option<Poller>>,
}

impl ObjectLatency {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            tracker: Arc::new(Mutex::new(Tracker::default())),
            poller: tokio::sync::Mutex::new(None),
        }
    }

    fn tracker(tracker: &Mutex<Tracker>) -> std::sync::MutexGuard<'_, Tracker> {
        tracker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn creation_timestamp(object: &serde_json::Value) -> Option<DateTime<Utc>> {
    let raw = object.get("metadata")?.get("creationTimestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

/// One discovery pass over an external scope
async fn scan(ctx: &MeasurementContext, tracker: &Mutex<Tracker>) -> Result<()> {
    let cluster: &dyn ClusterClient = ctx.cluster.as_ref();
    let namespaces: Vec<Option<&str>> = if ctx.scope.namespaces.is_empty() {
        vec![None]
    } else {
        ctx.scope.namespaces.iter().map(|n| Some(n.as_str())).collect()
    };
    for kind in &ctx.scope.kinds {
        for ns in &namespaces {
            let objects = cluster
                .list(kind, *ns, &ctx.scope.label_selector)
                .await
                .map_err(BurnerError::from)?;
            for object in objects {
                let already_done = {
                    let t = ObjectLatency::tracker(tracker);
                    t.samples.iter().any(|s| {
                        s.labels.get("name") == Some(&object.name)
                            && s.labels.get("namespace").map(String::as_str)
                                == Some(object.namespace.as_deref().unwrap_or_default())
                    })
                };
                if already_done {
                    continue;
                }
                let Some(observed) = cluster.get(&object).await.map_err(BurnerError::from)? else {
                    continue;
                };
                let now = Utc::now();
                let created = creation_timestamp(&observed).unwrap_or(now);
                let mut t = ObjectLatency::tracker(tracker);
                let first_seen = *t.created.entry(object.clone()).or_insert(created);
                if is_ready(&observed) {
                    let latency = (now - first_seen).to_std().unwrap_or_default();
                    t.record_ready(&object, latency, now);
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Measurement for ObjectLatency {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&self, ctx: MeasurementContext) -> Result<()> {
        let external = !ctx.scope.follow_events;
        {
            let mut t = Self::tracker(&self.tracker);
            if t.ctx.is_some() {
                return Err(BurnerError::Measurement {
                    measurement: NAME.into(),
                    message: "already started".into(),
                });
            }
            t.ctx = Some(ctx.clone());
        }
        if external {
            let tracker = self.tracker.clone();
            let poller = Poller::spawn(NAME, self.interval, move || {
                let tracker = tracker.clone();
                let ctx = ctx.clone();
                async move { scan(&ctx, &tracker).await }
            });
            *self.poller.lock().await = Some(poller);
        }
        Ok(())
    }

    async fn collect(&self) -> Result<()> {
        let ctx = Self::tracker(&self.tracker).ctx.clone();
        match ctx {
            Some(ctx) if !ctx.scope.follow_events => scan(&ctx, &self.tracker).await,
            _ => Ok(()),
        }
    }

    async fn stop(&self) -> Result<Vec<Sample>> {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop().await;
        }
        let mut t = Self::tracker(&self.tracker);
        let Some(ctx) = t.ctx.clone() else {
            return Err(BurnerError::Measurement {
                measurement: NAME.into(),
                message: "stopped before start".into(),
            });
        };
        let mut samples = std::mem::take(&mut t.samples);
        if !t.latencies.is_empty() {
            let summary = summarize(&t.latencies);
            let now = Utc::now();
            for (quantile, value) in [
                ("P50", summary.p50_ms),
                ("P95", summary.p95_ms),
                ("P99", summary.p99_ms),
                ("max", summary.max_ms),
                ("avg", summary.avg_ms),
            ] {
                samples.push(
                    Sample::new(QUANTILES_METRIC, value, now, ctx.job_name.clone(), &ctx.run_id)
                        .with_label("quantile", quantile),
                );
            }
        }
        if t.not_ready > 0 {
            samples.push(
                Sample::new(
                    "objectNotReady",
                    t.not_ready as f64,
                    Utc::now(),
                    ctx.job_name.clone(),
                    &ctx.run_id,
                ),
            );
        }
        Ok(samples)
    }

    fn observe(&self, event: &ObjectEvent) {
        let mut t = Self::tracker(&self.tracker);
        match event {
            ObjectEvent::Created { object, at, .. } => {
                t.created.insert(object.clone(), *at);
            }
            ObjectEvent::Ready {
                object, latency, at, ..
            } => t.record_ready(object, *latency, *at),
            ObjectEvent::NotReady { object, .. } => {
                t.not_ready += 1;
                t.created.remove(object);
            }
            ObjectEvent::Deleted { .. } => {}
        }
    }
}
