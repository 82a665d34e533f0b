//! Configuration management for the CLI

use crate::{IndexerArgs, PrometheusArgs, WindowArgs};
use anyhow::{bail, Context, Result};
use burner_lib::cluster::{ClusterClient, ConnectOptions, InMemoryCluster, KubeCluster};
use burner_lib::config::{AlertProfile, MetricsEndpoint};
use burner_lib::indexer::IndexerTarget;
use burner_lib::models::TimeWindow;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Cluster selection flags shared by every cluster-facing command
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl ConnectArgs {
    pub fn new(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self { kubeconfig, context }
    }

    /// Connect to the selected cluster, or an empty in-memory one
    pub async fn connect(&self, dry_run: bool) -> Result<Arc<dyn ClusterClient>> {
        if dry_run {
            info!("Dry run, using an in-memory cluster");
            return Ok(Arc::new(InMemoryCluster::new()));
        }
        let options = ConnectOptions {
            kubeconfig: kubeconfig_path(self.kubeconfig.as_deref()),
            context: self.context.clone(),
        };
        let cluster = KubeCluster::connect(&options)
            .await
            .context("Failed to connect to the cluster")?;
        Ok(Arc::new(cluster))
    }
}

/// Kubeconfig to load; `None` lets the client infer in-cluster credentials
pub fn kubeconfig_path(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        return Some(path.to_path_buf());
    }
    let default = dirs_next::home_dir()?.join(".kube").join("config");
    default.exists().then_some(default)
}

/// YAML map merged into every job summary
pub fn load_user_metadata(path: &Path) -> Result<BTreeMap<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read user metadata {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse user metadata {}", path.display()))
}

/// YAML list of endpoints; profile paths resolve against the file's directory
pub fn load_endpoints(path: &Path) -> Result<Vec<MetricsEndpoint>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metrics endpoints {}", path.display()))?;
    let mut endpoints: Vec<MetricsEndpoint> = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse metrics endpoints {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for endpoint in &mut endpoints {
        endpoint.resolve(base)?;
    }
    Ok(endpoints)
}

/// Single endpoint with profiles given on the command line
pub fn endpoint_with_profiles(
    url: &str,
    token: Option<String>,
    step: Duration,
    skip_tls_verify: bool,
    metrics_profiles: &[PathBuf],
    alert_profiles: &[PathBuf],
) -> Result<MetricsEndpoint> {
    let mut endpoint = MetricsEndpoint::new(url);
    endpoint.token = token;
    endpoint.step = step;
    endpoint.skip_tls_verify = skip_tls_verify;
    endpoint.metrics = metrics_profiles.to_vec();
    endpoint.alerts = alert_profiles.to_vec();
    endpoint.resolve(Path::new("."))?;
    Ok(endpoint)
}

impl PrometheusArgs {
    /// Endpoint carrying these credentials and the given profiles
    pub fn endpoint(&self, step: Duration, metrics_profiles: &[PathBuf], alert_profiles: &[PathBuf]) -> Result<MetricsEndpoint> {
        let mut endpoint = endpoint_with_profiles(
            &self.prometheus_url,
            self.token.clone(),
            step,
            self.skip_tls_verify,
            metrics_profiles,
            alert_profiles,
        )?;
        endpoint.username = self.username.clone();
        endpoint.password = self.password.clone();
        Ok(endpoint)
    }
}

pub fn load_alert_profiles(paths: &[PathBuf]) -> Result<AlertProfile> {
    let profiles = paths
        .iter()
        .map(|p| AlertProfile::load(p).map_err(anyhow::Error::from))
        .collect::<Result<Vec<_>>>()?;
    Ok(AlertProfile::merge(profiles))
}

impl WindowArgs {
    pub fn window(&self) -> Result<TimeWindow> {
        let end = self.end.unwrap_or_else(|| Utc::now().timestamp());
        let start = self.start.unwrap_or(end - 3600);
        if start > end {
            bail!("--start {start} is after --end {end}");
        }
        TimeWindow::from_epoch(start, end).context("Time window out of range")
    }
}

impl IndexerArgs {
    /// Target described by the flags; `None` when no destination was given
    pub fn target(&self) -> Result<Option<IndexerTarget>> {
        if !self.es_server.is_empty() {
            let index = self
                .es_index
                .clone()
                .context("--es-index is required with --es-server")?;
            return Ok(Some(IndexerTarget::Search {
                servers: self.es_server.clone(),
                index,
                skip_tls_verify: true,
            }));
        }
        Ok(self.metrics_directory.as_ref().map(|dir| IndexerTarget::Local {
            metrics_directory: dir.clone(),
            tarball_name: self.tarball_name.clone(),
        }))
    }

    /// Like [`IndexerArgs::target`], falling back to the default local directory
    pub fn target_or_local(&self) -> Result<IndexerTarget> {
        Ok(self.target()?.unwrap_or_else(|| IndexerTarget::Local {
            metrics_directory: PathBuf::from("collected-metrics"),
            tarball_name: self.tarball_name.clone(),
        }))
    }
}
