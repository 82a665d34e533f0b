//! Portable archive bundles
//!
//! A bundle is a gzip stream of JSON lines: a header line followed by one
//! [`Record`] per line. Bundles written by the local indexer can be
//! replayed into any backend with [`import_archive`].

use super::{IndexSummary, IndexWriter};
use crate::error::{BurnerError, Result};
use crate::models::Record;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const ARCHIVE_VERSION: u32 = 1;

/// First line of every bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveHeader {
    pub bundle: u32,
    pub run_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Write `records` to a new bundle at `path`
pub fn write_archive(path: &Path, records: &[Record]) -> Result<ArchiveHeader> {
    let run_ids: BTreeSet<String> = records.iter().map(|r| r.run_id().to_string()).collect();
    let header = ArchiveHeader {
        bundle: ARCHIVE_VERSION,
        run_ids: run_ids.into_iter().collect(),
        created_at: Utc::now(),
    };
    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    write_line(&mut encoder, &header)?;
    for record in records {
        write_line(&mut encoder, record)?;
    }
    encoder.finish()?.flush()?;
    info!(path = %path.display(), records = records.len(), "Archive written");
    Ok(header)
}

fn write_line<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)
        .map_err(|e| BurnerError::Indexing(format!("cannot encode archive line: {e}")))?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Read a bundle back
pub fn read_archive(path: &Path) -> Result<(ArchiveHeader, Vec<Record>)> {
    let file = File::open(path)?;
    let reader = BufReader::new(GzDecoder::new(file));
    let mut lines = reader.lines();

    let first = lines
        .next()
        .ok_or_else(|| BurnerError::config(format!("archive {} is empty", path.display())))??;
    let header: ArchiveHeader = serde_json::from_str(&first).map_err(|e| {
        BurnerError::config(format!("archive {} has no valid header: {e}", path.display()))
    })?;
    if header.bundle != ARCHIVE_VERSION {
        return Err(BurnerError::config(format!(
            "archive {} has unsupported bundle version {}",
            path.display(),
            header.bundle
        )));
    }

    let mut records = Vec::new();
    for (idx, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line).map_err(|e| {
            BurnerError::config(format!(
                "archive {} line {}: {e}",
                path.display(),
                idx + 2
            ))
        })?;
        records.push(record);
    }
    Ok((header, records))
}

/// Replay a bundle into `writer`
pub async fn import_archive(path: &Path, writer: &IndexWriter) -> Result<IndexSummary> {
    let owned: PathBuf = path.to_path_buf();
    let (header, records) = tokio::task::spawn_blocking(move || read_archive(&owned))
        .await
        .map_err(|e| BurnerError::Indexing(format!("archive reader stopped: {e}")))??;
    info!(
        path = %path.display(),
        runs = ?header.run_ids,
        records = records.len(),
        indexer = %writer.indexer_name(),
        "Importing archive"
    );
    Ok(writer.write(records).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::LocalIndexer;
    use crate::models::{RunId, Sample};
    use std::sync::Arc;

    fn records() -> Vec<Record> {
        let a = RunId::from("run-a");
        let b = RunId::from("run-b");
        vec![
            Record::Measurement(Sample::new("objectReadyLatency", 12.0, Utc::now(), "job", &a)),
            Record::Metric(Sample::new("cpu", 0.5, Utc::now(), "job", &b)),
        ]
    }

    #[test]
    fn test_bundle_header_lists_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.gz");
        let header = write_archive(&path, &records()).unwrap();
        assert_eq!(header.run_ids, vec!["run-a", "run-b"]);

        let (read_header, read) = read_archive(&path).unwrap();
        assert_eq!(read_header, header);
        assert_eq!(read, records());
    }

    #[test]
    fn test_rejects_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-bundle.gz");
        std::fs::write(&path, b"hello").unwrap();
        assert!(read_archive(&path).is_err());
    }

    #[tokio::test]
    async fn test_import_replays_into_indexer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.gz");
        write_archive(&path, &records()).unwrap();

        let out = dir.path().join("imported");
        let writer = IndexWriter::new(Arc::new(LocalIndexer::new(&out)));
        let summary = import_archive(&path, &writer).await.unwrap();
        assert_eq!(summary.written, 2);
        assert!(out.join("job-objectReadyLatency.jsonl").exists());
        assert!(out.join("job-cpu.jsonl").exists());
    }
}
