//! Latency aggregation

use crate::models::LatencySummary;
use std::time::Duration;

/// Summarize readiness latencies; empty input gives an all-zero summary
pub fn summarize(latencies: &[Duration]) -> LatencySummary {
    if latencies.is_empty() {
        return LatencySummary::default();
    }
    let mut millis: Vec<f64> = latencies.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    millis.sort_by(|a, b| a.total_cmp(b));

    let sum: f64 = millis.iter().sum();
    LatencySummary {
        count: millis.len(),
        avg_ms: sum / millis.len() as f64,
        p50_ms: percentile(&millis, 50.0),
        p95_ms: percentile(&millis, 95.0),
        p99_ms: percentile(&millis, 99.0),
        max_ms: millis[millis.len() - 1],
    }
}

/// Nearest-rank percentile over sorted data
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_of_uniform_latencies() {
        let latencies: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        let summary = summarize(&latencies);
        assert_eq!(summary.count, 100);
        assert!((summary.avg_ms - 50.5).abs() < 1e-6);
        assert!((summary.p50_ms - 51.0).abs() < 1e-6 || (summary.p50_ms - 50.0).abs() < 1e-6);
        assert!((summary.p99_ms - 99.0).abs() < 1.01);
        assert!((summary.max_ms - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(summarize(&[]), LatencySummary::default());
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
