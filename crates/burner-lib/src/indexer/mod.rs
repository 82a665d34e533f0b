//! Result persistence
//!
//! Records produced by a run (measurement samples, scraped metrics, alert
//! verdicts, job summaries) are handed to an [`Indexer`] through an
//! [`IndexWriter`], which batches them and retries what failed. The backend
//! is picked once from an [`IndexerTarget`].

mod archive;
mod local;
mod search;
mod writer;

pub use archive::{import_archive, read_archive, write_archive, ArchiveHeader, ARCHIVE_VERSION};
pub use local::LocalIndexer;
pub use search::{document_id, SearchIndexer};
pub use writer::{IndexSummary, IndexWriter};

use crate::config::EngineSettings;
use crate::error::{BurnerError, Result};
use crate::models::Record;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Outcome of persisting one record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordStatus {
    Written,
    Failed { message: String, retryable: bool },
}

impl RecordStatus {
    pub fn failed(message: impl Into<String>, retryable: bool) -> Self {
        RecordStatus::Failed {
            message: message.into(),
            retryable,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, RecordStatus::Written)
    }
}

/// Per-record result of one [`Indexer::write`] call, aligned with its input
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub statuses: Vec<RecordStatus>,
}

impl WriteReport {
    pub fn new(statuses: Vec<RecordStatus>) -> Self {
        Self { statuses }
    }

    pub fn all_written(count: usize) -> Self {
        Self {
            statuses: vec![RecordStatus::Written; count],
        }
    }

    pub fn written(&self) -> usize {
        self.statuses.iter().filter(|s| s.is_written()).count()
    }

    pub fn failed(&self) -> usize {
        self.statuses.len() - self.written()
    }
}

/// A persistence backend
#[async_trait]
pub trait Indexer: Send + Sync {
    fn name(&self) -> &str;

    /// Persist a batch
    ///
    /// `Err` means no record of the batch is known to be stored; partial
    /// success is reported record by record in the [`WriteReport`].
    async fn write(&self, records: &[Record]) -> Result<WriteReport>;

    /// Flush and close; returns the archive produced, if any
    async fn finalize(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

fn default_metrics_directory() -> PathBuf {
    PathBuf::from("collected-metrics")
}

fn default_true() -> bool {
    true
}

/// Where results go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IndexerTarget {
    /// JSON-lines files under a directory, optionally bundled into an archive
    #[serde(rename_all = "camelCase")]
    Local {
        #[serde(default = "default_metrics_directory")]
        metrics_directory: PathBuf,
        #[serde(default)]
        tarball_name: Option<String>,
    },
    /// Elasticsearch-compatible bulk API
    #[serde(rename_all = "camelCase")]
    Search {
        servers: Vec<String>,
        index: String,
        #[serde(default = "default_true", rename = "skipTLSVerify")]
        skip_tls_verify: bool,
    },
}

impl IndexerTarget {
    pub fn local(directory: impl Into<PathBuf>) -> Self {
        IndexerTarget::Local {
            metrics_directory: directory.into(),
            tarball_name: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            IndexerTarget::Local {
                metrics_directory,
                tarball_name,
            } => {
                if metrics_directory.as_os_str().is_empty() {
                    return Err(BurnerError::config("local indexer needs a metricsDirectory"));
                }
                if let Some(name) = tarball_name {
                    if name.trim().is_empty() || name.contains('/') {
                        return Err(BurnerError::config(format!(
                            "invalid tarballName {name:?}"
                        )));
                    }
                }
            }
            IndexerTarget::Search { servers, index, .. } => {
                if servers.is_empty() {
                    return Err(BurnerError::config("search indexer needs at least one server"));
                }
                for server in servers {
                    url::Url::parse(server).map_err(|e| {
                        BurnerError::config(format!("invalid search server {server:?}: {e}"))
                    })?;
                }
                if index.is_empty() || index.chars().any(|c| c.is_ascii_uppercase()) {
                    return Err(BurnerError::config(format!(
                        "search index {index:?} must be a non-empty lowercase name"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the backend this target describes
    pub fn build(&self, settings: &EngineSettings) -> Result<Arc<dyn Indexer>> {
        self.validate()?;
        let indexer: Arc<dyn Indexer> = match self {
            IndexerTarget::Local {
                metrics_directory,
                tarball_name,
            } => {
                let mut local = LocalIndexer::new(metrics_directory);
                if let Some(name) = tarball_name {
                    local = local.with_tarball(name);
                }
                Arc::new(local)
            }
            IndexerTarget::Search {
                servers,
                index,
                skip_tls_verify,
            } => Arc::new(SearchIndexer::new(
                servers,
                index,
                *skip_tls_verify,
                settings.request_timeout(),
            )?),
        };
        Ok(indexer)
    }

    /// Build the backend wrapped in a writer tuned by `settings`
    pub fn writer(&self, settings: &EngineSettings) -> Result<IndexWriter> {
        Ok(IndexWriter::from_settings(self.build(settings)?, settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parses_both_backends() {
        let local: IndexerTarget =
            serde_yaml::from_str("type: local\nmetricsDirectory: out\ntarballName: run.gz\n").unwrap();
        assert_eq!(
            local,
            IndexerTarget::Local {
                metrics_directory: PathBuf::from("out"),
                tarball_name: Some("run.gz".into()),
            }
        );

        let search: IndexerTarget = serde_yaml::from_str(
            "type: search\nservers: [\"https://es:9200\"]\nindex: burner\nskipTLSVerify: false\n",
        )
        .unwrap();
        assert!(matches!(
            search,
            IndexerTarget::Search { skip_tls_verify: false, .. }
        ));
    }

    #[test]
    fn test_local_defaults_directory() {
        let local: IndexerTarget = serde_yaml::from_str("type: local\n").unwrap();
        assert_eq!(local, IndexerTarget::local("collected-metrics"));
    }

    #[test]
    fn test_validate_rejects_bad_targets() {
        let no_servers = IndexerTarget::Search {
            servers: vec![],
            index: "burner".into(),
            skip_tls_verify: true,
        };
        assert!(no_servers.validate().is_err());

        let upper = IndexerTarget::Search {
            servers: vec!["http://es:9200".into()],
            index: "Burner".into(),
            skip_tls_verify: true,
        };
        assert!(upper.validate().is_err());

        let bad_url = IndexerTarget::Search {
            servers: vec!["not a url".into()],
            index: "burner".into(),
            skip_tls_verify: true,
        };
        assert!(bad_url.validate().is_err());

        let bad_tarball = IndexerTarget::Local {
            metrics_directory: PathBuf::from("out"),
            tarball_name: Some("a/b".into()),
        };
        assert!(bad_tarball.validate().is_err());
    }

    #[test]
    fn test_write_report_counts() {
        let report = WriteReport::new(vec![
            RecordStatus::Written,
            RecordStatus::failed("boom", true),
            RecordStatus::Written,
        ]);
        assert_eq!(report.written(), 2);
        assert_eq!(report.failed(), 1);
    }
}
