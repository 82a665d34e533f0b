//! Alert profile evaluation
//!
//! Each entry of an alert profile is evaluated over a window and yields
//! exactly one [`AlertVerdict`]. Entries are independent: a query error
//! becomes an `error` verdict for that entry only.

use crate::config::{AlertEntry, AlertProfile, Comparison, EngineSettings, MetricsEndpoint};
use crate::error::{BurnerError, Result};
use crate::models::{AlertSeverity, AlertVerdict, RunId, TimeWindow, VerdictOutcome};
use crate::observability::BurnerMetrics;
use crate::scraper::{PrometheusSource, Series, TimeSeriesSource};
use crate::shutdown::Shutdown;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Evaluates alert profiles against one time-series source
pub struct AlertEvaluator {
    source: Arc<dyn TimeSeriesSource>,
    step: Duration,
    run_id: RunId,
    metrics: BurnerMetrics,
}

impl AlertEvaluator {
    pub fn new(source: Arc<dyn TimeSeriesSource>, step: Duration, run_id: RunId) -> Self {
        Self {
            source,
            step,
            run_id,
            metrics: BurnerMetrics::new(),
        }
    }

    /// Evaluator querying `endpoint` over HTTP
    pub fn for_endpoint(endpoint: &MetricsEndpoint, settings: &EngineSettings, run_id: RunId) -> Result<Self> {
        let source = PrometheusSource::new(endpoint, settings.request_timeout())?;
        Ok(Self::new(Arc::new(source), endpoint.step, run_id))
    }

    /// One verdict per entry, in profile order
    ///
    /// Entries still querying when `stop` fires get an error verdict.
    pub async fn evaluate(
        &self,
        profile: &AlertProfile,
        window: TimeWindow,
        job_name: &str,
        stop: &Shutdown,
    ) -> Vec<AlertVerdict> {
        let verdicts = join_all(
            profile
                .entries
                .iter()
                .enumerate()
                .map(|(index, entry)| self.evaluate_entry(index, entry, window, job_name, stop)),
        )
        .await;
        for verdict in &verdicts {
            self.metrics.inc_alert_verdict(verdict.outcome);
        }
        verdicts
    }

    async fn evaluate_entry(
        &self,
        index: usize,
        entry: &AlertEntry,
        window: TimeWindow,
        job_name: &str,
        stop: &Shutdown,
    ) -> AlertVerdict {
        let mut verdict = AlertVerdict {
            index,
            expression: entry.expr.clone(),
            comparison: entry.comparison.map(|c| c.to_string()),
            threshold: entry.threshold,
            severity: entry.severity,
            value: None,
            outcome: VerdictOutcome::Passed,
            description: String::new(),
            error: None,
            job_name: job_name.to_string(),
            run_id: self.run_id.clone(),
            window,
            timestamp: Utc::now(),
        };
        let queried = if stop.is_triggered() {
            Err(BurnerError::Timeout("evaluation abandoned, run is stopping".into()))
        } else {
            tokio::select! {
                result = self.source.query_range(&entry.expr, &window, self.step) => result,
                _ = stop.triggered() => Err(BurnerError::Timeout("evaluation abandoned, run is stopping".into())),
            }
        };
        match queried {
            Ok(series) => {
                let (value, breached) = judge(entry, &series);
                verdict.value = value;
                if breached {
                    verdict.outcome = VerdictOutcome::Failed;
                }
            }
            Err(e) => {
                verdict.outcome = VerdictOutcome::Error;
                verdict.error = Some(e.to_string());
            }
        }
        verdict.description = render_description(&entry.description, verdict.value);
        debug!(
            job = %job_name,
            index,
            expr = %entry.expr,
            outcome = ?verdict.outcome,
            value = ?verdict.value,
            "Alert entry evaluated"
        );
        verdict
    }
}

/// Evaluated value and whether it breaches the entry
fn judge(entry: &AlertEntry, series: &[Series]) -> (Option<f64>, bool) {
    let values: Vec<f64> = series
        .iter()
        .flat_map(|s| s.points.iter().map(|p| p.value))
        .collect();
    if values.is_empty() {
        return (None, false);
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);

    match (entry.comparison, entry.threshold) {
        (Some(cmp @ (Comparison::Greater | Comparison::GreaterOrEqual)), Some(threshold)) => {
            (Some(max), cmp.breaches(max, threshold))
        }
        (Some(cmp @ (Comparison::Less | Comparison::LessOrEqual)), Some(threshold)) => {
            (Some(min), cmp.breaches(min, threshold))
        }
        (Some(cmp @ (Comparison::Equal | Comparison::NotEqual)), Some(threshold)) => {
            match values.iter().copied().find(|v| cmp.breaches(*v, threshold)) {
                Some(hit) => (Some(hit), true),
                None => (Some(values[0]), false),
            }
        }
        // Without a comparison any returned point is a breach
        _ => (Some(max), true),
    }
}

fn render_description(template: &str, value: Option<f64>) -> String {
    let rendered = match value {
        Some(v) => format_value(v),
        None => "n/a".to_string(),
    };
    template
        .replace("{{$value}}", &rendered)
        .replace("{{ $value }}", &rendered)
}

fn format_value(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v:.3}")
    }
}

/// Verdicts of one or more evaluations
#[derive(Debug, Clone, Default)]
pub struct AlertSummary {
    pub verdicts: Vec<AlertVerdict>,
}

impl AlertSummary {
    pub fn new(verdicts: Vec<AlertVerdict>) -> Self {
        Self { verdicts }
    }

    pub fn extend(&mut self, verdicts: impl IntoIterator<Item = AlertVerdict>) {
        self.verdicts.extend(verdicts);
    }

    /// A breach at or above `min_severity` fails the run
    pub fn failed(&self, min_severity: AlertSeverity) -> bool {
        self.verdicts
            .iter()
            .any(|v| v.is_failed() && v.severity >= min_severity)
    }

    pub fn count(&self, outcome: VerdictOutcome) -> usize {
        self.verdicts.iter().filter(|v| v.outcome == outcome).count()
    }

    /// Entries that could not be evaluated
    pub fn errors(&self) -> impl Iterator<Item = &AlertVerdict> {
        self.verdicts
            .iter()
            .filter(|v| v.outcome == VerdictOutcome::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::testing::ScriptedSource;
    use chrono::{DateTime, Utc};

    fn window() -> TimeWindow {
        TimeWindow::from_epoch(1_700_000_000, 1_700_000_600).unwrap()
    }

    fn at(offset: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + offset, 0).unwrap()
    }

    fn entry(expr: &str, comparison: Option<Comparison>, threshold: Option<f64>, severity: AlertSeverity) -> AlertEntry {
        AlertEntry {
            expr: expr.to_string(),
            comparison,
            threshold,
            severity,
            description: String::new(),
        }
    }

    fn evaluator(source: ScriptedSource) -> AlertEvaluator {
        AlertEvaluator::new(Arc::new(source), Duration::from_secs(30), RunId::from("alert-run"))
    }

    #[tokio::test]
    async fn test_one_verdict_per_entry_in_order() {
        let source = ScriptedSource::new("prom")
            .answer("latency", &[(at(10), 0.5), (at(20), 2.5)])
            .answer("errors", &[(at(10), 0.0)])
            .empty("absent");
        let profile = AlertProfile::new(vec![
            entry("latency", Some(Comparison::Greater), Some(1.0), AlertSeverity::Critical),
            entry("errors", Some(Comparison::Greater), Some(1.0), AlertSeverity::Error),
            entry("absent", None, None, AlertSeverity::Warning),
            entry("unknown", None, None, AlertSeverity::Error),
        ]);

        let verdicts = evaluator(source).evaluate(&profile, window(), "job", &Shutdown::new()).await;
        let outcomes: Vec<VerdictOutcome> = verdicts.iter().map(|v| v.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                VerdictOutcome::Failed,
                VerdictOutcome::Passed,
                VerdictOutcome::Passed,
                VerdictOutcome::Error
            ]
        );
        assert_eq!(verdicts.iter().map(|v| v.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(verdicts[0].value, Some(2.5));
        assert_eq!(verdicts[2].value, None);
        assert!(verdicts[3].error.is_some());
    }

    #[tokio::test]
    async fn test_stopped_run_yields_error_verdicts() {
        let source = ScriptedSource::new("prom").answer("latency", &[(at(10), 5.0)]);
        let profile = AlertProfile::new(vec![entry(
            "latency",
            Some(Comparison::Greater),
            Some(1.0),
            AlertSeverity::Critical,
        )]);
        let stop = Shutdown::new();
        stop.trigger();
        let verdicts = evaluator(source).evaluate(&profile, window(), "job", &stop).await;
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].outcome, VerdictOutcome::Error);
        assert!(verdicts[0].error.as_deref().unwrap().contains("stopping"));
    }

    #[tokio::test]
    async fn test_empty_profile_yields_no_verdicts() {
        let verdicts = evaluator(ScriptedSource::new("prom"))
            .evaluate(&AlertProfile::default(), window(), "job", &Shutdown::new())
            .await;
        assert!(verdicts.is_empty());
    }

    #[test]
    fn test_value_selection_per_comparison() {
        let series = vec![Series {
            labels: Default::default(),
            points: [3.0, 1.0, 5.0, 1.0]
                .iter()
                .enumerate()
                .map(|(i, v)| crate::scraper::SeriesPoint {
                    timestamp: at(i as i64),
                    value: *v,
                })
                .collect(),
        }];
        let e = |c| entry("x", Some(c), Some(2.0), AlertSeverity::Error);

        assert_eq!(judge(&e(Comparison::Greater), &series), (Some(5.0), true));
        assert_eq!(judge(&e(Comparison::Less), &series), (Some(1.0), true));
        assert_eq!(judge(&e(Comparison::LessOrEqual), &series), (Some(1.0), true));
        assert_eq!(judge(&e(Comparison::NotEqual), &series), (Some(3.0), true));
        assert_eq!(judge(&e(Comparison::Equal), &series), (Some(3.0), false));
        assert_eq!(
            judge(&entry("x", None, None, AlertSeverity::Error), &series),
            (Some(5.0), true)
        );
        assert_eq!(judge(&e(Comparison::Greater), &[]), (None, false));
    }

    #[tokio::test]
    async fn test_description_renders_value() {
        let source = ScriptedSource::new("prom").answer("lat", &[(at(1), 1.25)]);
        let mut e = entry("lat", Some(Comparison::Greater), Some(1.0), AlertSeverity::Error);
        e.description = "latency was {{$value}}s".into();
        let verdicts = evaluator(source)
            .evaluate(&AlertProfile::new(vec![e]), window(), "job", &Shutdown::new())
            .await;
        assert_eq!(verdicts[0].description, "latency was 1.250s");
    }

    #[test]
    fn test_summary_respects_min_severity() {
        let verdict = |severity, outcome| AlertVerdict {
            index: 0,
            expression: "x".into(),
            comparison: None,
            threshold: None,
            severity,
            value: None,
            outcome,
            description: String::new(),
            error: None,
            job_name: "job".into(),
            run_id: RunId::from("r"),
            window: window(),
            timestamp: Utc::now(),
        };
        let summary = AlertSummary::new(vec![
            verdict(AlertSeverity::Warning, VerdictOutcome::Failed),
            verdict(AlertSeverity::Critical, VerdictOutcome::Passed),
            verdict(AlertSeverity::Critical, VerdictOutcome::Error),
        ]);
        assert!(!summary.failed(AlertSeverity::Error));
        assert!(summary.failed(AlertSeverity::Warning));
        assert_eq!(summary.count(VerdictOutcome::Failed), 1);
        assert_eq!(summary.errors().count(), 1);
    }
}
