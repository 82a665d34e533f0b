//! Batching and retry in front of an indexer

use super::{Indexer, RecordStatus};
use crate::config::EngineSettings;
use crate::error::BurnerError;
use crate::models::Record;
use crate::observability::BurnerMetrics;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// What a [`IndexWriter::write`] call achieved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexSummary {
    pub written: usize,
    pub failed: usize,
    /// One message per record that stayed unwritten
    pub errors: Vec<String>,
}

impl IndexSummary {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    pub fn merge(&mut self, other: IndexSummary) {
        self.written += other.written;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }

    /// Indexing error describing what remained unwritten
    pub fn error(&self) -> Option<BurnerError> {
        if self.is_complete() {
            return None;
        }
        let first = self.errors.first().map(String::as_str).unwrap_or("unknown error");
        Some(BurnerError::Indexing(format!(
            "{} of {} records not persisted: {first}",
            self.failed,
            self.written + self.failed
        )))
    }
}

/// Failure message naming the record it belongs to
fn record_error(record: &Record, message: &str) -> String {
    let kind = match record {
        Record::Measurement(_) => "measurement",
        Record::Metric(_) => "metric",
        Record::Alert(_) => "alert",
        Record::JobSummary(_) => "jobSummary",
    };
    format!("{kind} {}/{}: {message}", record.job_name(), record.metric_name())
}

/// Record waiting to be written, with the last failure seen for it
struct Pending {
    record: Record,
    last_error: Option<String>,
}

/// Writes records through an [`Indexer`] in batches
///
/// Each batch is retried with exponential backoff; only the records the
/// backend reported as failed (or the whole batch on a transport error) are
/// resent. Records still failing after `max_retries` are counted in the
/// returned [`IndexSummary`].
#[derive(Clone)]
pub struct IndexWriter {
    indexer: Arc<dyn Indexer>,
    batch_size: usize,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    metrics: BurnerMetrics,
}

impl IndexWriter {
    pub fn new(indexer: Arc<dyn Indexer>) -> Self {
        Self {
            indexer,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            metrics: BurnerMetrics::new(),
        }
    }

    pub fn from_settings(indexer: Arc<dyn Indexer>, settings: &EngineSettings) -> Self {
        Self::new(indexer)
            .with_batch_size(settings.indexer_batch_size)
            .with_max_retries(settings.indexer_max_retries)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
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

    pub fn indexer_name(&self) -> &str {
        self.indexer.name()
    }

    /// Persist `records`, batch by batch
    pub async fn write(&self, records: Vec<Record>) -> IndexSummary {
        let mut summary = IndexSummary::default();
        if records.is_empty() {
            return summary;
        }
        let total = records.len();
        let mut queue: VecDeque<Record> = records.into();
        while !queue.is_empty() {
            let take = self.batch_size.min(queue.len());
            let batch: Vec<Record> = queue.drain(..take).collect();
            summary.merge(self.write_batch(batch).await);
        }
        if summary.failed > 0 {
            self.metrics.inc_indexing_failures(summary.failed as u64);
            warn!(
                indexer = %self.indexer.name(),
                written = summary.written,
                failed = summary.failed,
                "Some records could not be indexed"
            );
        } else {
            info!(indexer = %self.indexer.name(), records = total, "Records indexed");
        }
        summary
    }

    async fn write_batch(&self, batch: Vec<Record>) -> IndexSummary {
        let mut summary = IndexSummary::default();
        let mut pending: Vec<Pending> = batch
            .into_iter()
            .map(|record| Pending {
                record,
                last_error: None,
            })
            .collect();
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        while !pending.is_empty() {
            let records: Vec<Record> = pending.iter().map(|p| p.record.clone()).collect();
            let mut retry = Vec::new();
            match self.indexer.write(&records).await {
                Ok(report) if report.statuses.len() == pending.len() => {
                    for (item, status) in pending.into_iter().zip(report.statuses) {
                        match status {
                            RecordStatus::Written => summary.written += 1,
                            RecordStatus::Failed {
                                message,
                                retryable: true,
                            } => retry.push(Pending {
                                record: item.record,
                                last_error: Some(message),
                            }),
                            RecordStatus::Failed { message, .. } => {
                                summary.failed += 1;
                                summary.errors.push(record_error(&item.record, &message));
                            }
                        }
                    }
                }
                Ok(report) => {
                    let message = format!(
                        "indexer returned {} statuses for {} records",
                        report.statuses.len(),
                        pending.len()
                    );
                    retry = pending
                        .into_iter()
                        .map(|p| Pending {
                            record: p.record,
                            last_error: Some(message.clone()),
                        })
                        .collect();
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    let message = e.to_string();
                    if !retryable {
                        summary.failed += pending.len();
                        summary
                            .errors
                            .extend(pending.iter().map(|p| record_error(&p.record, &message)));
                        return summary;
                    }
                    retry = pending
                        .into_iter()
                        .map(|p| Pending {
                            record: p.record,
                            last_error: Some(message.clone()),
                        })
                        .collect();
                }
            }

            pending = retry;
            if pending.is_empty() {
                break;
            }
            if attempt >= self.max_retries {
                summary.failed += pending.len();
                summary.errors.extend(pending.into_iter().map(|p| {
                    let message = p.last_error.as_deref().unwrap_or("unknown error");
                    record_error(&p.record, message)
                }));
                break;
            }
            attempt += 1;
            debug!(
                indexer = %self.indexer.name(),
                attempt,
                records = pending.len(),
                backoff_ms = backoff.as_millis() as u64,
                "Retrying failed records"
            );
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, self.max_backoff);
        }
        summary
    }

    /// Close the backend; returns the archive it produced, if any
    pub async fn finalize(&self) -> crate::error::Result<Option<PathBuf>> {
        self.indexer.finalize().await
    }
}
