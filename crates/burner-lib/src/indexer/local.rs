//! JSON-lines files on local disk

use super::archive::write_archive;
use super::{Indexer, RecordStatus, WriteReport};
use crate::error::{BurnerError, Result};
use crate::models::Record;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Appends each record to `<dir>/<jobName>-<metricName>.jsonl`
///
/// Alert verdicts land in `<jobName>-alerts.jsonl` and job summaries in
/// `<jobName>-jobSummary.jsonl`. When a tarball name is set, `finalize`
/// bundles every file of the directory into one archive.
pub struct LocalIndexer {
    directory: PathBuf,
    tarball: Option<String>,
    // Serializes appends so lines from concurrent writers never interleave
    write_lock: Mutex<()>,
}

impl LocalIndexer {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            tarball: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_tarball(mut self, name: impl Into<String>) -> Self {
        self.tarball = Some(name.into());
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File a record is appended to
    pub fn file_for(&self, record: &Record) -> PathBuf {
        let name = format!(
            "{}-{}.jsonl",
            sanitize(record.job_name()),
            sanitize(record.metric_name())
        );
        self.directory.join(name)
    }

    fn append(path: &Path, lines: &[String]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut buf = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())?;
        file.flush()
    }

    fn load_directory(directory: &Path) -> Result<Vec<Record>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        files.sort();
        let mut records = Vec::new();
        for path in files {
            let reader = BufReader::new(std::fs::File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record = serde_json::from_str(&line).map_err(|e| {
                    BurnerError::Indexing(format!("unreadable record in {}: {e}", path.display()))
                })?;
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
        .collect()
}

#[async_trait]
impl Indexer for LocalIndexer {
    fn name(&self) -> &str {
        "local"
    }

    async fn write(&self, records: &[Record]) -> Result<WriteReport> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.directory).await.map_err(|e| {
            BurnerError::Indexing(format!("cannot create {}: {e}", self.directory.display()))
        })?;

        let mut statuses = vec![RecordStatus::Written; records.len()];
        let mut by_file: BTreeMap<PathBuf, Vec<(usize, String)>> = BTreeMap::new();
        for (idx, record) in records.iter().enumerate() {
            match serde_json::to_string(record) {
                Ok(line) => by_file.entry(self.file_for(record)).or_default().push((idx, line)),
                Err(e) => statuses[idx] = RecordStatus::failed(format!("cannot encode record: {e}"), false),
            }
        }

        for (path, entries) in by_file {
            let lines: Vec<String> = entries.iter().map(|(_, l)| l.clone()).collect();
            let target = path.clone();
            let appended = tokio::task::spawn_blocking(move || Self::append(&target, &lines))
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                .and_then(|r| r);
            match appended {
                Ok(()) => debug!(path = %path.display(), records = entries.len(), "Appended records"),
                Err(e) => {
                    let message = format!("cannot append to {}: {e}", path.display());
                    for (idx, _) in entries {
                        statuses[idx] = RecordStatus::failed(message.clone(), true);
                    }
                }
            }
        }
        Ok(WriteReport::new(statuses))
    }

    async fn finalize(&self) -> Result<Option<PathBuf>> {
        let Some(tarball) = &self.tarball else {
            return Ok(None);
        };
        let _guard = self.write_lock.lock().await;
        let directory = self.directory.clone();
        let target = directory.join(tarball);
        let path = target.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let records = Self::load_directory(&directory)?;
            write_archive(&path, &records)?;
            Ok(())
        })
        .await
        .map_err(|e| BurnerError::Indexing(format!("archive writer stopped: {e}")))??;
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::read_archive;
    use crate::models::{
        AlertSeverity, AlertVerdict, RunId, Sample, TimeWindow, VerdictOutcome,
    };
    use chrono::Utc;

    fn verdict(run_id: &RunId) -> AlertVerdict {
        AlertVerdict {
            index: 0,
            expression: "up == 0".into(),
            comparison: None,
            threshold: None,
            severity: AlertSeverity::Error,
            value: None,
            outcome: VerdictOutcome::Passed,
            description: String::new(),
            error: None,
            job_name: "deploy".into(),
            run_id: run_id.clone(),
            window: TimeWindow::new(Utc::now(), Utc::now()),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_records_grouped_by_job_and_metric() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = LocalIndexer::new(dir.path().join("metrics"));
        let run_id = RunId::from("local-run");
        let records = vec![
            Record::Measurement(Sample::new("objectReadyLatency", 1.0, Utc::now(), "deploy", &run_id)),
            Record::Measurement(Sample::new("objectReadyLatency", 2.0, Utc::now(), "deploy", &run_id)),
            Record::Alert(verdict(&run_id)),
        ];

        let report = indexer.write(&records).await.unwrap();
        assert_eq!(report.written(), 3);

        let latency = std::fs::read_to_string(dir.path().join("metrics/deploy-objectReadyLatency.jsonl")).unwrap();
        assert_eq!(latency.lines().count(), 2);
        assert!(dir.path().join("metrics/deploy-alerts.jsonl").exists());
    }

    #[tokio::test]
    async fn test_appends_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = LocalIndexer::new(dir.path());
        let run_id = RunId::from("r");
        let record = Record::Metric(Sample::new("cpu", 1.0, Utc::now(), "job", &run_id));
        indexer.write(&[record.clone()]).await.unwrap();
        indexer.write(&[record]).await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("job-cpu.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_finalize_bundles_directory() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = LocalIndexer::new(dir.path()).with_tarball("run.gz");
        let run_id = RunId::from("bundle-run");
        indexer
            .write(&[
                Record::Metric(Sample::new("cpu", 1.0, Utc::now(), "job", &run_id)),
                Record::Alert(verdict(&run_id)),
            ])
            .await
            .unwrap();

        let path = indexer.finalize().await.unwrap().unwrap();
        let (header, records) = read_archive(&path).unwrap();
        assert_eq!(header.run_ids, vec!["bundle-run"]);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_finalize_without_tarball_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = LocalIndexer::new(dir.path());
        assert_eq!(indexer.finalize().await.unwrap(), None);
    }

    #[test]
    fn test_file_names_are_sanitized() {
        let indexer = LocalIndexer::new("/out");
        let run_id = RunId::from("r");
        let record = Record::Metric(Sample::new("a/b c", 1.0, Utc::now(), "job", &run_id));
        assert_eq!(indexer.file_for(&record), PathBuf::from("/out/job-a_b_c.jsonl"));
    }
}
