//! Periodic count of live objects per kind

use super::poller::Poller;
use super::{Measurement, MeasurementContext};
use crate::error::{BurnerError, Result};
use crate::models::Sample;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const NAME: &str = "objectCount";
pub const COUNT_METRIC: &str = "objectCount";

/// Counts objects in scope on every tick
pub struct ObjectCount {
    interval: Duration,
    ctx: Mutex<Option<MeasurementContext>>,
    samples: Arc<Mutex<Vec<Sample>>>,
    poller: tokio::sync::Mutex<Option<Poller>>,
}

impl ObjectCount {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ctx: Mutex::new(None),
            samples: Arc::new(Mutex::new(Vec::new())),
            poller: tokio::sync::Mutex::new(None),
        }
    }

    fn context(&self) -> Option<MeasurementContext> {
        self.ctx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

async fn snapshot(ctx: &MeasurementContext, samples: &Mutex<Vec<Sample>>) -> Result<()> {
    let mut batch = Vec::with_capacity(ctx.scope.kinds.len());
    for kind in &ctx.scope.kinds {
        let mut total = 0usize;
        if ctx.scope.namespaces.is_empty() {
            total += ctx
                .cluster
                .list(kind, None, &ctx.scope.label_selector)
                .await
                .map_err(BurnerError::from)?
                .len();
        } else {
            for ns in &ctx.scope.namespaces {
                total += ctx
                    .cluster
                    .list(kind, Some(ns), &ctx.scope.label_selector)
                    .await
                    .map_err(BurnerError::from)?
                    .len();
            }
        }
        batch.push(
            Sample::new(COUNT_METRIC, total as f64, Utc::now(), ctx.job_name.clone(), &ctx.run_id)
                .with_label("kind", kind.kind.clone())
                .with_label("apiVersion", kind.api_version.clone()),
        );
    }
    samples
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .extend(batch);
    Ok(())
}

#[async_trait]
impl Measurement for ObjectCount {
    fn name(&self) -> &str {
        NAME
    }

    async fn start(&self, ctx: MeasurementContext) -> Result<()> {
        if ctx.scope.kinds.is_empty() {
            return Err(BurnerError::Measurement {
                measurement: NAME.into(),
                message: "no kinds to count".into(),
            });
        }
        *self.ctx.lock().unwrap_or_else(|e| e.into_inner()) = Some(ctx.clone());
        let samples = self.samples.clone();
        let poller = Poller::spawn(NAME, self.interval, move || {
            let ctx = ctx.clone();
            let samples = samples.clone();
            async move { snapshot(&ctx, &samples).await }
        });
        *self.poller.lock().await = Some(poller);
        Ok(())
    }

    async fn collect(&self) -> Result<()> {
        match self.context() {
            Some(ctx) => snapshot(&ctx, &self.samples).await,
            None => Err(BurnerError::Measurement {
                measurement: NAME.into(),
                message: "collect before start".into(),
            }),
        }
    }

    async fn stop(&self) -> Result<Vec<Sample>> {
        let poller = self.poller.lock().await.take();
        let Some(poller) = poller else {
            return Err(BurnerError::Measurement {
                measurement: NAME.into(),
                message: "stopped before start".into(),
            });
        };
        let stats = poller.stop().await;
        if stats.ticks > 0 && stats.errors == stats.ticks {
            return Err(BurnerError::Measurement {
                measurement: NAME.into(),
                message: format!("all {} polls failed", stats.ticks),
            });
        }
        let samples = std::mem::take(&mut *self.samples.lock().unwrap_or_else(|e| e.into_inner()));
        Ok(samples)
    }
}
