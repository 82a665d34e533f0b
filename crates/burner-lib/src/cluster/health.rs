//! Node readiness check run before a benchmark

use super::ClusterClient;
use crate::error::{BurnerError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Readiness of a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub name: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeHealth {
    pub fn ready(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: true,
            message: None,
        }
    }

    pub fn not_ready(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: false,
            message: Some(message.into()),
        }
    }
}

/// Aggregated node readiness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub nodes: Vec<NodeHealth>,
    pub checked_at: i64,
}

impl ClusterHealth {
    /// Healthy when every node is Ready; a cluster without nodes is unhealthy
    pub fn is_healthy(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.ready)
    }

    pub fn not_ready(&self) -> impl Iterator<Item = &NodeHealth> {
        self.nodes.iter().filter(|n| !n.ready)
    }

    /// Query node conditions
    pub async fn check(cluster: &dyn ClusterClient) -> Result<Self> {
        let nodes = cluster.nodes().await.map_err(BurnerError::from)?;
        let health = Self {
            nodes,
            checked_at: chrono::Utc::now().timestamp(),
        };
        for node in health.not_ready() {
            warn!(
                node = %node.name,
                reason = node.message.as_deref().unwrap_or("unknown"),
                "Node not ready"
            );
        }
        info!(
            nodes = health.nodes.len(),
            healthy = health.is_healthy(),
            "Cluster health checked"
        );
        Ok(health)
    }

    /// Like [`ClusterHealth::check`], but an unhealthy cluster is a connectivity error
    pub async fn ensure_healthy(cluster: &dyn ClusterClient) -> Result<Self> {
        let health = Self::check(cluster).await?;
        if !health.is_healthy() {
            let names: Vec<&str> = health.not_ready().map(|n| n.name.as_str()).collect();
            let detail = if names.is_empty() {
                "no nodes found".to_string()
            } else {
                format!("nodes not ready: {}", names.join(", "))
            };
            return Err(BurnerError::Connectivity(format!("cluster unhealthy, {detail}")));
        }
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;

    #[tokio::test]
    async fn test_all_ready_nodes_are_healthy() {
        let cluster = InMemoryCluster::new();
        cluster.set_nodes(vec![NodeHealth::ready("node-a"), NodeHealth::ready("node-b")]);
        let health = ClusterHealth::ensure_healthy(&cluster).await.unwrap();
        assert_eq!(health.nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_not_ready_node_fails_check() {
        let cluster = InMemoryCluster::new();
        cluster.set_nodes(vec![
            NodeHealth::ready("node-a"),
            NodeHealth::not_ready("node-b", "KubeletNotReady"),
        ]);
        let health = ClusterHealth::check(&cluster).await.unwrap();
        assert!(!health.is_healthy());
        let err = ClusterHealth::ensure_healthy(&cluster).await.unwrap_err();
        assert!(err.to_string().contains("node-b"));
    }

    #[tokio::test]
    async fn test_no_nodes_is_unhealthy() {
        let cluster = InMemoryCluster::new();
        cluster.set_nodes(Vec::new());
        assert!(ClusterHealth::ensure_healthy(&cluster).await.is_err());
    }
}
