//! Metrics scraping from external time-series endpoints
//!
//! After a job window closes, every metric profile query is run against its
//! endpoint over that window and the result normalized into [`Sample`]s.
//! Endpoints are scraped concurrently and fail independently.

mod prometheus;

pub use prometheus::PrometheusSource;

use crate::config::{EngineSettings, MetricQuery, MetricsEndpoint};
use crate::error::{BurnerError, Result};
use crate::models::{RunId, Sample, TimeWindow};
use crate::observability::BurnerMetrics;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One timestamped value of a series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A labelled series returned by a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<SeriesPoint>,
}

/// Read access to a time-series store
#[async_trait]
pub trait TimeSeriesSource: Send + Sync {
    /// Alias or URL, used to tag samples and failures
    fn name(&self) -> &str;

    /// Evaluate `query` over `window` at `step` resolution
    async fn query_range(&self, query: &str, window: &TimeWindow, step: Duration) -> Result<Vec<Series>>;

    /// Evaluate `query` once at `at`
    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Series>>;
}

/// Endpoint plus the queries to run against it
#[derive(Clone)]
pub struct ScrapeTarget {
    pub source: Arc<dyn TimeSeriesSource>,
    pub queries: Vec<MetricQuery>,
    pub step: Duration,
}

/// An endpoint that could not be fully scraped
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeFailure {
    pub endpoint: String,
    pub message: String,
    pub retryable: bool,
}

impl From<ScrapeFailure> for BurnerError {
    fn from(f: ScrapeFailure) -> Self {
        BurnerError::Scrape {
            endpoint: f.endpoint,
            message: f.message,
            retryable: f.retryable,
        }
    }
}

/// Result of scraping every endpoint for one window
#[derive(Debug, Clone, Default)]
pub struct ScrapeReport {
    pub samples: Vec<Sample>,
    pub failures: Vec<ScrapeFailure>,
    /// Endpoints attempted
    pub endpoints: usize,
    /// Endpoints that returned nothing because every query failed
    pub dead_endpoints: usize,
    /// The stop signal fired while scraping
    pub cancelled: bool,
}

impl ScrapeReport {
    /// Every endpoint failed outright; a cancelled scrape never counts
    pub fn all_failed(&self) -> bool {
        !self.cancelled && self.endpoints > 0 && self.dead_endpoints == self.endpoints
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct EndpointResult {
    samples: Vec<Sample>,
    failures: Vec<ScrapeFailure>,
    dead: bool,
}

/// Runs metric profiles against their endpoints
pub struct Scraper {
    targets: Vec<ScrapeTarget>,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    metrics: BurnerMetrics,
}

impl Scraper {
    pub fn new(targets: Vec<ScrapeTarget>) -> Self {
        Self {
            targets,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            metrics: BurnerMetrics::new(),
        }
    }

    /// One Prometheus source per endpoint carrying a metric profile
    pub fn from_endpoints(endpoints: &[MetricsEndpoint], settings: &EngineSettings) -> Result<Self> {
        let mut targets = Vec::new();
        for endpoint in endpoints.iter().filter(|e| !e.metric_profile.is_empty()) {
            targets.push(ScrapeTarget {
                source: Arc::new(PrometheusSource::new(endpoint, settings.request_timeout())?),
                queries: endpoint.metric_profile.clone(),
                step: endpoint.step,
            });
        }
        Ok(Self::new(targets).with_max_retries(settings.scrape_max_retries))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Scrape every endpoint over `window`
    ///
    /// Queries and retry backoffs are abandoned once `stop` fires.
    pub async fn scrape(&self, window: TimeWindow, job_name: &str, run_id: &RunId, stop: &Shutdown) -> ScrapeReport {
        let results = join_all(
            self.targets
                .iter()
                .map(|target| self.scrape_target(target, &window, job_name, run_id, stop)),
        )
        .await;

        let mut report = ScrapeReport {
            endpoints: self.targets.len(),
            cancelled: stop.is_triggered(),
            ..Default::default()
        };
        for result in results {
            report.samples.extend(result.samples);
            report.failures.extend(result.failures);
            if result.dead {
                report.dead_endpoints += 1;
            }
        }
        report
    }

    async fn scrape_target(
        &self,
        target: &ScrapeTarget,
        window: &TimeWindow,
        job_name: &str,
        run_id: &RunId,
        stop: &Shutdown,
    ) -> EndpointResult {
        let endpoint = target.source.name().to_string();
        let mut samples = Vec::new();
        let mut failures = Vec::new();
        for query in &target.queries {
            match self.run_with_retry(target, query, window, stop).await {
                Ok(series) => {
                    let before = samples.len();
                    normalize(&mut samples, series, query, &endpoint, job_name, run_id, window);
                    debug!(
                        endpoint = %endpoint,
                        metric = %query.metric_name,
                        samples = samples.len() - before,
                        "Query scraped"
                    );
                }
                Err(e) => {
                    self.metrics.inc_scrape_failure(&endpoint);
                    warn!(endpoint = %endpoint, metric = %query.metric_name, error = %e, "Query failed");
                    failures.push(ScrapeFailure {
                        endpoint: endpoint.clone(),
                        message: format!("{}: {e}", query.metric_name),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }
        let dead = !target.queries.is_empty() && failures.len() == target.queries.len();
        EndpointResult {
            samples,
            failures,
            dead,
        }
    }

    async fn run_with_retry(
        &self,
        target: &ScrapeTarget,
        query: &MetricQuery,
        window: &TimeWindow,
        stop: &Shutdown,
    ) -> Result<Vec<Series>> {
        let cancelled = || BurnerError::Timeout(format!("query {} abandoned, run is stopping", query.metric_name));
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;
        loop {
            if stop.is_triggered() {
                return Err(cancelled());
            }
            let pending = async {
                if query.instant {
                    target.source.query(&query.query, window.end).await
                } else {
                    target.source.query_range(&query.query, window, target.step).await
                }
            };
            let result = tokio::select! {
                result = pending => result,
                _ = stop.triggered() => return Err(cancelled()),
            };
            match result {
                Ok(series) => return Ok(series),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(
                        endpoint = %target.source.name(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying query"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop.triggered() => return Err(cancelled()),
                    }
                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn normalize(
    out: &mut Vec<Sample>,
    series: Vec<Series>,
    query: &MetricQuery,
    endpoint: &str,
    job_name: &str,
    run_id: &RunId,
    window: &TimeWindow,
) {
    for s in series {
        for point in s.points {
            if !query.instant && !window.covers(point.timestamp) {
                continue;
            }
            let timestamp = if query.instant { window.end } else { point.timestamp };
            let mut sample = Sample::new(&query.metric_name, point.value, timestamp, job_name, run_id);
            sample.labels = s.labels.clone();
            sample.labels.insert("endpoint".to_string(), endpoint.to_string());
            sample.query = Some(query.query.clone());
            out.push(sample);
        }
    }
}
