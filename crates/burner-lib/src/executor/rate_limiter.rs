//! Token bucket and worker pool shared by the workers of one job

use crate::shutdown::Shutdown;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

type DirectLimiter = Governor<NotKeyed, InMemoryState, DefaultClock>;

/// Per-job request limiter
///
/// `qps <= 0` disables limiting. The burst defaults to `ceil(qps)`.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<DirectLimiter>>,
}

impl RateLimiter {
    pub fn new(qps: f64, burst: Option<u32>) -> Self {
        if qps <= 0.0 || !qps.is_finite() {
            return Self::unlimited();
        }
        let burst = burst.unwrap_or_else(|| qps.ceil() as u32);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let inner = Quota::with_period(Duration::from_secs_f64(1.0 / qps))
            .map(|quota| Arc::new(Governor::direct(quota.allow_burst(burst))));
        Self { inner }
    }

    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    pub fn is_limited(&self) -> bool {
        self.inner.is_some()
    }

    /// Wait for one token
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}

/// Bounded set of workers gated by a [`RateLimiter`]
///
/// `submit` blocks the producer until both a worker slot and a token are
/// available, so no work item is ever dropped.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    limiter: RateLimiter,
}

impl WorkerPool {
    pub fn new(concurrency: usize, limiter: RateLimiter) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            limiter,
        }
    }

    /// Spawn `work` into `tasks` once a slot and a token are free
    ///
    /// Returns false without spawning when `shutdown` fires first.
    pub async fn submit<F, T>(&self, tasks: &mut JoinSet<T>, shutdown: &Shutdown, work: F) -> bool
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if shutdown.is_triggered() {
            return false;
        }
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
            _ = shutdown.triggered() => return false,
        };
        tokio::select! {
            _ = self.limiter.acquire() => {}
            _ = shutdown.triggered() => return false,
        }
        tasks.spawn(async move {
            let _permit = permit;
            work.await
        });
        true
    }
}
