//! Run outcome aggregation
//!
//! Handlers compute an [`Outcome`]; only the binary entry point turns it
//! into a process exit code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate result of a command, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Completed, but with non-fatal errors (degraded jobs, failed collectors, indexing errors)
    Degraded,
    /// At least one alert at or above the failing severity breached
    AlertsFailed,
    Timeout,
    /// Configuration, connectivity or fail-fast error stopped the run
    Fatal,
}

impl Outcome {
    /// Process exit code for this outcome
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Fatal => 1,
            Outcome::Degraded => 2,
            Outcome::AlertsFailed => 3,
            Outcome::Timeout => 4,
        }
    }

    /// Combine two outcomes keeping the most severe one
    pub fn merge(self, other: Outcome) -> Outcome {
        self.max(other)
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

impl Default for Outcome {
    fn default() -> Self {
        Outcome::Success
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Degraded => write!(f, "degraded"),
            Outcome::AlertsFailed => write!(f, "alerts failed"),
            Outcome::Timeout => write!(f, "timeout"),
            Outcome::Fatal => write!(f, "fatal"),
        }
    }
}

impl FromIterator<Outcome> for Outcome {
    fn from_iter<I: IntoIterator<Item = Outcome>>(iter: I) -> Self {
        iter.into_iter().fold(Outcome::Success, Outcome::merge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes: std::collections::HashSet<i32> = [
            Outcome::Success,
            Outcome::Degraded,
            Outcome::AlertsFailed,
            Outcome::Timeout,
            Outcome::Fatal,
        ]
        .iter()
        .map(|o| o.exit_code())
        .collect();
        assert_eq!(codes.len(), 5);
        assert_eq!(Outcome::Success.exit_code(), 0);
    }

    #[test]
    fn test_merge_keeps_most_severe() {
        assert_eq!(Outcome::Degraded.merge(Outcome::AlertsFailed), Outcome::AlertsFailed);
        assert_eq!(Outcome::Timeout.merge(Outcome::AlertsFailed), Outcome::Timeout);
        assert_eq!(Outcome::Fatal.merge(Outcome::Success), Outcome::Fatal);
        let all: Outcome = vec![Outcome::Success, Outcome::Degraded].into_iter().collect();
        assert_eq!(all, Outcome::Degraded);
    }
}
