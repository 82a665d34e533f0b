//! Core data models shared by every stage of a benchmark run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Label stamped on every namespace and object created by a run
pub const RUN_ID_LABEL: &str = "burner-uuid";
/// Label carrying the name of the job that created an object
pub const JOB_LABEL: &str = "burner-job";
/// Label carrying the position of the job inside the benchmark
pub const JOB_INDEX_LABEL: &str = "burner-index";

/// Unique token correlating every resource and record of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Mint a fresh identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Use the caller-provided identifier, or mint one when absent/blank
    pub fn from_option(id: Option<String>) -> Self {
        match id {
            Some(id) if !id.trim().is_empty() => Self(id.trim().to_string()),
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Label selector matching everything stamped with this identifier
    pub fn label_selector(&self) -> String {
        format!("{}={}", RUN_ID_LABEL, self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Wall-clock interval of a job or query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Build a window from unix epoch seconds
    pub fn from_epoch(start: i64, end: i64) -> Option<Self> {
        let start = DateTime::<Utc>::from_timestamp(start, 0)?;
        let end = DateTime::<Utc>::from_timestamp(end, 0)?;
        Some(Self { start, end })
    }

    /// Inclusive containment check used to bracket measurement samples
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Half-open check `[start, end)` used for scraped points
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }
}

/// A single numeric observation
///
/// Used both for measurement samples (direct cluster observation) and
/// metric samples (external time-series source); the enclosing
/// [`Record`] variant tells them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub job_name: String,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

pub type MeasurementSample = Sample;
pub type MetricSample = Sample;

impl Sample {
    pub fn new(
        metric_name: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        job_name: impl Into<String>,
        run_id: &RunId,
    ) -> Self {
        Self {
            timestamp,
            metric_name: metric_name.into(),
            value,
            labels: BTreeMap::new(),
            job_name: job_name.into(),
            run_id: run_id.clone(),
            query: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Severity attached to an alert profile entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for AlertSeverity {
    fn default() -> Self {
        AlertSeverity::Error
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Error => write!(f, "error"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(AlertSeverity::Info),
            "warning" => Ok(AlertSeverity::Warning),
            "error" => Ok(AlertSeverity::Error),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(format!("unknown severity {other:?}")),
        }
    }
}

/// Result of evaluating one alert profile entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictOutcome {
    Passed,
    Failed,
    /// The expression could not be evaluated
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertVerdict {
    /// Position of the entry inside its profile
    pub index: usize,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub severity: AlertSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub outcome: VerdictOutcome,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub job_name: String,
    pub run_id: RunId,
    pub window: TimeWindow,
    pub timestamp: DateTime<Utc>,
}

impl AlertVerdict {
    pub fn is_failed(&self) -> bool {
        self.outcome == VerdictOutcome::Failed
    }
}

/// Final state of one executed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    /// Finished, but some objects never became ready or failed to be created
    Degraded,
    /// Aborted by the fail-fast policy
    Failed,
    TimedOut,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Degraded => write!(f, "degraded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Summary statistics over a set of readiness latencies (milliseconds)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Per-job execution report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_name: String,
    pub run_id: RunId,
    pub status: JobStatus,
    pub created: usize,
    pub deleted: usize,
    pub failed: usize,
    pub not_ready: usize,
    pub churn_cycles: usize,
    pub elapsed_secs: f64,
    pub readiness: LatencySummary,
    pub window: TimeWindow,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Unit of persistence handed to indexers and archive bundles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "recordType", content = "data", rename_all = "camelCase")]
pub enum Record {
    Measurement(Sample),
    Metric(Sample),
    Alert(AlertVerdict),
    JobSummary(JobReport),
}

impl Record {
    pub fn run_id(&self) -> &RunId {
        match self {
            Record::Measurement(s) | Record::Metric(s) => &s.run_id,
            Record::Alert(v) => &v.run_id,
            Record::JobSummary(r) => &r.run_id,
        }
    }

    pub fn job_name(&self) -> &str {
        match self {
            Record::Measurement(s) | Record::Metric(s) => &s.job_name,
            Record::Alert(v) => &v.job_name,
            Record::JobSummary(r) => &r.job_name,
        }
    }

    /// Logical series the record belongs to, used for file and index naming
    pub fn metric_name(&self) -> &str {
        match self {
            Record::Measurement(s) | Record::Metric(s) => &s.metric_name,
            Record::Alert(_) => "alerts",
            Record::JobSummary(_) => "jobSummary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_generated_when_missing() {
        let a = RunId::from_option(None);
        let b = RunId::from_option(Some("  ".to_string()));
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_run_id_keeps_provided_value() {
        let id = RunId::from_option(Some("abc-123".to_string()));
        assert_eq!(id.as_str(), "abc-123");
        assert_eq!(id.label_selector(), "burner-uuid=abc-123");
    }

    #[test]
    fn test_window_contains_bounds() {
        let window = TimeWindow::from_epoch(100, 200).unwrap();
        assert!(window.contains(window.start));
        assert!(window.contains(window.end));
        assert!(!window.contains(DateTime::<Utc>::from_timestamp(99, 0).unwrap()));
        assert!(window.covers(window.start));
        assert!(!window.covers(window.end));
        assert_eq!(window.duration(), Duration::from_secs(100));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Error);
        assert!(AlertSeverity::Warning < AlertSeverity::Error);
        assert_eq!("Warning".parse::<AlertSeverity>(), Ok(AlertSeverity::Warning));
    }

    #[test]
    fn test_record_serialization_is_tagged() {
        let run_id = RunId::from("run-1");
        let sample = Sample::new("podLatency", 12.0, Utc::now(), "job-a", &run_id);
        let json = serde_json::to_value(Record::Measurement(sample)).unwrap();
        assert_eq!(json["recordType"], "measurement");
        assert_eq!(json["data"]["metricName"], "podLatency");
        assert_eq!(json["data"]["runId"], "run-1");
    }
}
