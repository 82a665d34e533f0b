//! Metric and alert profiles
//!
//! A metric profile lists the time-series queries scraped after every job;
//! an alert profile lists the threshold expressions evaluated over the same
//! window. Both are plain YAML sequences.

use crate::error::{BurnerError, Result};
use crate::models::AlertSeverity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// One query of a metric profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricQuery {
    pub query: String,
    pub metric_name: String,
    /// Evaluate once at the end of the window instead of over the range
    #[serde(default)]
    pub instant: bool,
}

/// Comparison applied between the evaluated value and the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl Comparison {
    /// True when `value` breaches `threshold`
    pub fn breaches(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Greater => value > threshold,
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::Less => value < threshold,
            Comparison::LessOrEqual => value <= threshold,
            Comparison::Equal => (value - threshold).abs() < f64::EPSILON,
            Comparison::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
        };
        f.write_str(s)
    }
}

/// One threshold expression of an alert profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEntry {
    pub expr: String,
    /// When absent, any data returned by `expr` counts as a breach
    #[serde(default)]
    pub comparison: Option<Comparison>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub severity: AlertSeverity,
    #[serde(default)]
    pub description: String,
}

/// Ordered list of alert entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertProfile {
    pub entries: Vec<AlertEntry>,
}

impl AlertProfile {
    pub fn new(entries: Vec<AlertEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let profile: AlertProfile = serde_yaml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = read_profile(path)?;
        Self::from_yaml(&content)
            .map_err(|e| BurnerError::config(format!("alert profile {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.expr.trim().is_empty() {
                return Err(BurnerError::config(format!("alert entry {idx} has an empty expr")));
            }
            if entry.comparison.is_some() != entry.threshold.is_some() {
                return Err(BurnerError::config(format!(
                    "alert entry {idx} must set both comparison and threshold, or neither"
                )));
            }
        }
        Ok(())
    }

    /// Concatenate several profiles, preserving order
    pub fn merge(profiles: impl IntoIterator<Item = AlertProfile>) -> Self {
        Self {
            entries: profiles.into_iter().flat_map(|p| p.entries).collect(),
        }
    }
}

/// Parse a metric profile
pub fn parse_metric_profile(content: &str) -> Result<Vec<MetricQuery>> {
    let queries: Vec<MetricQuery> = serde_yaml::from_str(content)?;
    for (idx, q) in queries.iter().enumerate() {
        if q.query.trim().is_empty() || q.metric_name.trim().is_empty() {
            return Err(BurnerError::config(format!(
                "metric profile entry {idx} needs both query and metricName"
            )));
        }
    }
    Ok(queries)
}

pub fn load_metric_profile(path: &Path) -> Result<Vec<MetricQuery>> {
    let content = read_profile(path)?;
    parse_metric_profile(&content)
        .map_err(|e| BurnerError::config(format!("metric profile {}: {e}", path.display())))
}

fn read_profile(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| BurnerError::config(format!("cannot read profile {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_alert_profile() {
        let yaml = r#"
- expr: avg_over_time(apiserver_latency[5m])
  comparison: ">"
  threshold: 1.5
  severity: critical
  description: "API latency {{$value}}s"
- expr: up == 0
  severity: warning
"#;
        let profile = AlertProfile::from_yaml(yaml).unwrap();
        assert_eq!(profile.len(), 2);
        assert_eq!(profile.entries[0].comparison, Some(Comparison::Greater));
        assert_eq!(profile.entries[0].severity, AlertSeverity::Critical);
        assert!(profile.entries[1].comparison.is_none());
    }

    #[test]
    fn test_alert_profile_requires_threshold_with_comparison() {
        let yaml = "- expr: foo\n  comparison: \">\"\n";
        assert!(AlertProfile::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_empty_alert_profile_is_valid() {
        let profile = AlertProfile::from_yaml("[]").unwrap();
        assert!(profile.is_empty());
    }

    #[test]
    fn test_comparisons() {
        assert!(Comparison::Greater.breaches(2.0, 1.0));
        assert!(!Comparison::Greater.breaches(1.0, 1.0));
        assert!(Comparison::GreaterOrEqual.breaches(1.0, 1.0));
        assert!(Comparison::Less.breaches(0.5, 1.0));
        assert!(Comparison::NotEqual.breaches(0.5, 1.0));
        assert!(Comparison::Equal.breaches(1.0, 1.0));
    }

    #[test]
    fn test_parse_metric_profile() {
        let yaml = r#"
- query: sum(rate(apiserver_request_total[2m])) by (verb)
  metricName: apiRequestRate
- query: count(kube_namespace_created)
  metricName: namespaceCount
  instant: true
"#;
        let queries = parse_metric_profile(yaml).unwrap();
        assert_eq!(queries.len(), 2);
        assert!(queries[1].instant);
        assert!(parse_metric_profile("- query: x\n  metricName: ''\n").is_err());
    }
}
