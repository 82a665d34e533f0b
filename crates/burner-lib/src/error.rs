//! Error taxonomy for the benchmark engine

use thiserror::Error;

/// Errors raised by the engine, grouped by how the run reacts to them
#[derive(Error, Debug)]
pub enum BurnerError {
    /// Malformed spec or missing required field; raised before any cluster mutation
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cluster or metric endpoint unreachable
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Object lifecycle failure escalated by a fail-fast policy
    #[error("execution error in job {job}: {message}")]
    Execution { job: String, message: String },

    /// A single measurement collector failed; never aborts a job
    #[error("measurement {measurement} failed: {message}")]
    Measurement { measurement: String, message: String },

    /// Query against a time-series endpoint failed
    #[error("scrape error at {endpoint}: {message}")]
    Scrape {
        endpoint: String,
        message: String,
        retryable: bool,
    },

    /// Records could not be persisted after the allowed retries
    #[error("indexing error: {0}")]
    Indexing(String),

    /// A deadline expired before the operation finished
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BurnerError {
    pub fn config(message: impl Into<String>) -> Self {
        BurnerError::Configuration(message.into())
    }

    pub fn scrape(endpoint: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        BurnerError::Scrape {
            endpoint: endpoint.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Whether a caller may reasonably retry the failed operation
    pub fn is_retryable(&self) -> bool {
        match self {
            BurnerError::Scrape { retryable, .. } => *retryable,
            BurnerError::Connectivity(_) | BurnerError::Indexing(_) => true,
            _ => false,
        }
    }

    /// Whether the error stops the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BurnerError::Configuration(_)
                | BurnerError::Connectivity(_)
                | BurnerError::Execution { .. }
                | BurnerError::Io(_)
        )
    }
}

impl From<serde_yaml::Error> for BurnerError {
    fn from(e: serde_yaml::Error) -> Self {
        BurnerError::Configuration(e.to_string())
    }
}

/// Errors returned by a [`crate::cluster::ClusterClient`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("invalid object: {0}")]
    InvalidObject(String),
}

impl From<ClusterError> for BurnerError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Unreachable(msg) => BurnerError::Connectivity(msg),
            ClusterError::InvalidObject(msg) => BurnerError::Configuration(msg),
            other => BurnerError::Connectivity(other.to_string()),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, BurnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_error_retryable_flag() {
        assert!(BurnerError::scrape("prom", "503", true).is_retryable());
        assert!(!BurnerError::scrape("prom", "bad query", false).is_retryable());
    }

    #[test]
    fn test_fatal_categories() {
        assert!(BurnerError::config("missing name").is_fatal());
        assert!(BurnerError::Connectivity("down".into()).is_fatal());
        assert!(!BurnerError::Indexing("bulk rejected".into()).is_fatal());
        assert!(!BurnerError::Measurement {
            measurement: "objectCount".into(),
            message: "forbidden".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_cluster_error_conversion() {
        let err: BurnerError = ClusterError::Unreachable("connection refused".into()).into();
        assert!(matches!(err, BurnerError::Connectivity(_)));
        let err: BurnerError = ClusterError::InvalidObject("no kind".into()).into();
        assert!(matches!(err, BurnerError::Configuration(_)));
    }
}
