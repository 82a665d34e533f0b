//! Elasticsearch-compatible bulk indexing

use super::{Indexer, RecordStatus, WriteReport};
use crate::error::{BurnerError, Result};
use crate::models::Record;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Deterministic id of a record, so replaying a batch overwrites instead of duplicating
pub fn document_id(encoded: &str) -> String {
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

/// Writes records through the `_bulk` endpoint of the first reachable server
pub struct SearchIndexer {
    client: Client,
    servers: Vec<Url>,
    index: String,
}

impl SearchIndexer {
    pub fn new(servers: &[String], index: &str, skip_tls_verify: bool, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_tls_verify)
            .build()
            .map_err(|e| BurnerError::config(format!("cannot build search client: {e}")))?;
        let servers = servers
            .iter()
            .map(|s| {
                let mut url = Url::parse(s)
                    .map_err(|e| BurnerError::config(format!("invalid search server {s:?}: {e}")))?;
                if !url.path().ends_with('/') {
                    let path = format!("{}/", url.path());
                    url.set_path(&path);
                }
                Ok(url)
            })
            .collect::<Result<Vec<_>>>()?;
        if servers.is_empty() {
            return Err(BurnerError::config("search indexer needs at least one server"));
        }
        Ok(Self {
            client,
            servers,
            index: index.to_string(),
        })
    }

    /// NDJSON body plus, per body entry, the position of its record
    fn bulk_body(&self, records: &[Record], statuses: &mut [RecordStatus]) -> (String, Vec<usize>) {
        let mut body = String::new();
        let mut positions = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            let encoded = match serde_json::to_string(record) {
                Ok(encoded) => encoded,
                Err(e) => {
                    statuses[idx] = RecordStatus::failed(format!("cannot encode record: {e}"), false);
                    continue;
                }
            };
            let action = json!({"index": {"_index": self.index, "_id": document_id(&encoded)}});
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&encoded);
            body.push('\n');
            positions.push(idx);
        }
        (body, positions)
    }

    async fn post(&self, server: &Url, body: String) -> std::result::Result<BulkResponse, (String, bool)> {
        let url = server
            .join("_bulk")
            .map_err(|e| (format!("invalid bulk url: {e}"), false))?;
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| (format!("request to {server} failed: {e}"), true))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err((
                format!("{server} answered {status}: {text}"),
                status.is_server_error() || status.as_u16() == 429,
            ));
        }
        response
            .json::<BulkResponse>()
            .await
            .map_err(|e| (format!("unreadable bulk response from {server}: {e}"), true))
    }
}

fn item_status(item: &HashMap<String, BulkItem>) -> RecordStatus {
    let Some(result) = item.values().next() else {
        return RecordStatus::failed("empty bulk item", true);
    };
    if (200..300).contains(&result.status) {
        return RecordStatus::Written;
    }
    let reason = result
        .error
        .as_ref()
        .and_then(|e| e.get("reason").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("status {}", result.status));
    RecordStatus::failed(reason, result.status == 429 || result.status >= 500)
}

#[async_trait]
impl Indexer for SearchIndexer {
    fn name(&self) -> &str {
        "search"
    }

    async fn write(&self, records: &[Record]) -> Result<WriteReport> {
        let mut statuses = vec![RecordStatus::Written; records.len()];
        let (body, positions) = self.bulk_body(records, &mut statuses);
        if positions.is_empty() {
            return Ok(WriteReport::new(statuses));
        }

        let mut last_error = String::new();
        for server in &self.servers {
            match self.post(server, body.clone()).await {
                Ok(response) => {
                    if response.items.len() != positions.len() {
                        return Err(BurnerError::Indexing(format!(
                            "{server} acknowledged {} of {} documents",
                            response.items.len(),
                            positions.len()
                        )));
                    }
                    for (item, idx) in response.items.iter().zip(&positions) {
                        statuses[*idx] = item_status(item);
                    }
                    debug!(server = %server, index = %self.index, documents = positions.len(), "Bulk request done");
                    return Ok(WriteReport::new(statuses));
                }
                Err((message, true)) => {
                    warn!(server = %server, error = %message, "Search server failed, trying next");
                    last_error = message;
                }
                Err((message, false)) => {
                    for idx in positions {
                        statuses[idx] = RecordStatus::failed(message.clone(), false);
                    }
                    return Ok(WriteReport::new(statuses));
                }
            }
        }
        Err(BurnerError::Indexing(format!("no search server accepted the batch: {last_error}")))
    }
}
