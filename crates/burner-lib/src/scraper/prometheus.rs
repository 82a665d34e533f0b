//! Prometheus HTTP API client

use super::{Series, SeriesPoint, TimeSeriesSource};
use crate::config::MetricsEndpoint;
use crate::error::{BurnerError, Result};
use crate::models::TimeWindow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
enum Auth {
    None,
    Bearer(String),
    Basic { username: String, password: Option<String> },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiData {
    result_type: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
struct ApiSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
    #[serde(default)]
    value: Option<(f64, String)>,
}

/// Queries `/api/v1/query_range` and `/api/v1/query` of one endpoint
pub struct PrometheusSource {
    client: Client,
    base: Url,
    name: String,
    auth: Auth,
}

impl PrometheusSource {
    pub fn new(endpoint: &MetricsEndpoint, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(&endpoint.endpoint).map_err(|e| {
            BurnerError::config(format!("invalid metrics endpoint {:?}: {e}", endpoint.endpoint))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(endpoint.skip_tls_verify)
            .build()
            .map_err(|e| BurnerError::config(format!("cannot build metrics client: {e}")))?;
        let auth = match (&endpoint.token, &endpoint.username) {
            (Some(token), _) => Auth::Bearer(token.clone()),
            (None, Some(username)) => Auth::Basic {
                username: username.clone(),
                password: endpoint.password.clone(),
            },
            (None, None) => Auth::None,
        };
        Ok(Self {
            client,
            base,
            name: endpoint.name().to_string(),
            auth,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic { username, password } => request.basic_auth(username, password.as_ref()),
        }
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Vec<Series>> {
        let url = self
            .base
            .join(path)
            .map_err(|e| BurnerError::scrape(&self.name, format!("invalid query url: {e}"), false))?;
        let response = self
            .authorize(self.client.get(url).query(params))
            .send()
            .await
            .map_err(|e| BurnerError::scrape(&self.name, format!("request failed: {e}"), true))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BurnerError::scrape(&self.name, format!("cannot read response: {e}"), true))?;
        let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;

        let parsed: ApiResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(BurnerError::scrape(
                    &self.name,
                    format!("{status}: {}", body.trim()),
                    retryable,
                ))
            }
            Err(e) => {
                return Err(BurnerError::scrape(
                    &self.name,
                    format!("unreadable response: {e}"),
                    false,
                ))
            }
        };
        if parsed.status != "success" {
            return Err(BurnerError::scrape(
                &self.name,
                format!(
                    "{}: {}",
                    parsed.error_type.unwrap_or_else(|| status.to_string()),
                    parsed.error.unwrap_or_default()
                ),
                retryable,
            ));
        }
        let data = parsed
            .data
            .ok_or_else(|| BurnerError::scrape(&self.name, "response has no data", false))?;
        decode(&self.name, data)
    }
}

fn timestamp(seconds: f64) -> Option<DateTime<Utc>> {
    let secs = seconds.floor() as i64;
    let nanos = ((seconds - seconds.floor()) * 1e9).round() as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos.min(999_999_999))
}

fn point(name: &str, (ts, raw): (f64, String)) -> Result<Option<SeriesPoint>> {
    let value: f64 = raw
        .parse()
        .map_err(|_| BurnerError::scrape(name, format!("non-numeric sample value {raw:?}"), false))?;
    if value.is_nan() {
        return Ok(None);
    }
    let timestamp = timestamp(ts)
        .ok_or_else(|| BurnerError::scrape(name, format!("timestamp {ts} out of range"), false))?;
    Ok(Some(SeriesPoint { timestamp, value }))
}

fn decode(name: &str, data: ApiData) -> Result<Vec<Series>> {
    let malformed = |e: serde_json::Error| BurnerError::scrape(name, format!("malformed result: {e}"), false);
    match data.result_type.as_str() {
        "matrix" | "vector" => {
            let raw: Vec<ApiSeries> = serde_json::from_value(data.result).map_err(malformed)?;
            let mut out = Vec::with_capacity(raw.len());
            for series in raw {
                let mut points = Vec::new();
                for p in series.values.into_iter().chain(series.value) {
                    if let Some(p) = point(name, p)? {
                        points.push(p);
                    }
                }
                out.push(Series {
                    labels: series.metric,
                    points,
                });
            }
            Ok(out)
        }
        "scalar" => {
            let raw: (f64, String) = serde_json::from_value(data.result).map_err(malformed)?;
            Ok(point(name, raw)?
                .map(|p| Series {
                    labels: BTreeMap::new(),
                    points: vec![p],
                })
                .into_iter()
                .collect())
        }
        other => Err(BurnerError::scrape(
            name,
            format!("unsupported result type {other:?}"),
            false,
        )),
    }
}

fn epoch(ts: DateTime<Utc>) -> String {
    format!("{:.3}", ts.timestamp_millis() as f64 / 1000.0)
}

#[async_trait]
impl TimeSeriesSource for PrometheusSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_range(&self, query: &str, window: &TimeWindow, step: Duration) -> Result<Vec<Series>> {
        let step = step.max(Duration::from_secs(1));
        self.get(
            "api/v1/query_range",
            &[
                ("query", query.to_string()),
                ("start", epoch(window.start)),
                ("end", epoch(window.end)),
                ("step", format!("{}s", step.as_secs())),
            ],
        )
        .await
    }

    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Series>> {
        self.get(
            "api/v1/query",
            &[("query", query.to_string()), ("time", epoch(at))],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn source(url: &str) -> PrometheusSource {
        let mut endpoint = MetricsEndpoint::new(url);
        endpoint.alias = Some("prom".into());
        PrometheusSource::new(&endpoint, Duration::from_secs(5)).unwrap()
    }

    fn window() -> TimeWindow {
        TimeWindow::from_epoch(1_700_000_000, 1_700_000_060).unwrap()
    }

    #[tokio::test]
    async fn test_query_range_decodes_matrix() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/query_range")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("query".into(), "rate(x[1m])".into()),
                Matcher::UrlEncoded("start".into(), "1700000000.000".into()),
                Matcher::UrlEncoded("step".into(), "30s".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"status":"success","data":{"resultType":"matrix","result":[
                    {"metric":{"verb":"GET"},"values":[[1700000000,"1.5"],[1700000030,"NaN"],[1700000060,"2"]]}
                ]}}"#,
            )
            .create_async()
            .await;

        let series = source(&server.url())
            .query_range("rate(x[1m])", &window(), Duration::from_secs(30))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels.get("verb").map(String::as_str), Some("GET"));
        let values: Vec<f64> = series[0].points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.5, 2.0]);
        assert_eq!(series[0].points[0].timestamp, window().start);
    }

    #[tokio::test]
    async fn test_instant_query_decodes_vector_and_scalar() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::UrlEncoded("query".into(), "up".into()))
            .with_body(
                r#"{"status":"success","data":{"resultType":"vector","result":[
                    {"metric":{"job":"a"},"value":[1700000060,"1"]},
                    {"metric":{"job":"b"},"value":[1700000060,"0"]}
                ]}}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::UrlEncoded("query".into(), "scalar(1)".into()))
            .with_body(r#"{"status":"success","data":{"resultType":"scalar","result":[1700000060,"1"]}}"#)
            .create_async()
            .await;

        let prom = source(&server.url());
        let vector = prom.query("up", window().end).await.unwrap();
        assert_eq!(vector.len(), 2);
        let scalar = prom.query("scalar(1)", window().end).await.unwrap();
        assert_eq!(scalar[0].points[0].value, 1.0);
    }

    #[tokio::test]
    async fn test_bad_query_is_not_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#)
            .create_async()
            .await;
        let err = source(&server.url()).query("sum(", window().end).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("bad_data"));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;
        let err = source(&server.url()).query("up", window().end).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("prom"));
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer secret")
            .with_body(r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#)
            .create_async()
            .await;
        let mut endpoint = MetricsEndpoint::new(server.url());
        endpoint.token = Some("secret".into());
        let prom = PrometheusSource::new(&endpoint, Duration::from_secs(5)).unwrap();
        assert!(prom.query("up", window().end).await.unwrap().is_empty());
        mock.assert_async().await;
    }
}
