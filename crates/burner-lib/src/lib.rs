//! Kubernetes control-plane load generation and measurement
//!
//! This crate provides the core functionality for:
//! - Rendering and creating labelled objects at a controlled rate
//! - Latency and count measurements over the objects of a job
//! - Scraping time-series endpoints over each job window
//! - Alert profile evaluation
//! - Indexing results to local files, search clusters and archives
//! - Cleanup of everything a run created

pub mod alerting;
pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod indexer;
pub mod measurements;
pub mod models;
pub mod observability;
pub mod outcome;
pub mod scraper;
pub mod shutdown;

pub use alerting::{AlertEvaluator, AlertSummary};
pub use cleanup::{Cleanup, CleanupReport};
pub use config::{BenchmarkSpec, EngineSettings};
pub use engine::{measure, Benchmark, JobRun, MeasureReport, RunReport};
pub use error::{BurnerError, Result};
pub use models::*;
pub use observability::{BurnerMetrics, RunLogger};
pub use outcome::Outcome;
pub use shutdown::Shutdown;
