//! [`ClusterClient`] backed by a Kubernetes API server

use super::{ClusterClient, ClusterResult, NamespaceSpec, NodeHealth, ObjectRef, ResourceKind};
use crate::error::ClusterError;
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Namespace, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{self, verbs, ApiCapabilities, ApiResource, Discovery, Scope};
use kube::{Client, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// How to locate cluster credentials
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Explicit kubeconfig file; in-cluster or default lookup otherwise
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

/// Client for a real cluster
///
/// Resolved kinds are cached so that each API group is discovered once.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    resolved: Arc<DashMap<String, (ApiResource, ApiCapabilities)>>,
}

fn map_error(err: kube::Error, what: &str) -> ClusterError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(what.to_string()),
        kube::Error::Api(resp) if resp.code == 409 => {
            ClusterError::AlreadyExists(what.to_string())
        }
        kube::Error::Api(resp) => ClusterError::Api {
            code: resp.code,
            message: resp.message,
        },
        other => ClusterError::Unreachable(other.to_string()),
    }
}

impl KubeCluster {
    /// Build a client from kubeconfig or in-cluster credentials
    pub async fn connect(options: &ConnectOptions) -> ClusterResult<Self> {
        let kube_options = KubeConfigOptions {
            context: options.context.clone(),
            ..Default::default()
        };
        let config = match &options.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Unreachable(format!("cannot read kubeconfig {}: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &kube_options)
                    .await
                    .map_err(|e| ClusterError::Unreachable(format!("invalid kubeconfig: {e}")))?
            }
            None if options.context.is_some() => Config::from_kubeconfig(&kube_options)
                .await
                .map_err(|e| ClusterError::Unreachable(format!("invalid kubeconfig: {e}")))?,
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Unreachable(format!("no cluster configuration: {e}")))?,
        };
        debug!(cluster_url = %config.cluster_url, "Connecting to cluster");
        let client = Client::try_from(config)
            .map_err(|e| ClusterError::Unreachable(format!("cannot build client: {e}")))?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            resolved: Arc::new(DashMap::new()),
        }
    }

    async fn resolve(&self, kind: &ResourceKind) -> ClusterResult<(ApiResource, ApiCapabilities)> {
        let key = kind.to_string();
        if let Some(entry) = self.resolved.get(&key) {
            return Ok(entry.value().clone());
        }
        let (group, version) = kind.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &kind.kind);
        let resolved = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| map_error(e, &key))?;
        self.resolved.insert(key, resolved.clone());
        Ok(resolved)
    }

    fn api(
        &self,
        resource: &ApiResource,
        caps: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match (&caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, resource)
            }
            _ => Api::all_with(self.client.clone(), resource),
        }
    }

    fn reference(kind: &ResourceKind, caps: &ApiCapabilities, obj: &DynamicObject) -> ObjectRef {
        let mut kind = kind.clone();
        kind.namespaced = caps.scope == Scope::Namespaced;
        ObjectRef::new(
            kind,
            obj.metadata.namespace.clone(),
            obj.metadata.name.clone().unwrap_or_default(),
        )
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_namespace(&self, spec: &NamespaceSpec) -> ClusterResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                labels: Some(spec.labels.clone()),
                annotations: Some(spec.annotations.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &namespace)
            .await
            .map_err(|e| map_error(e, &format!("namespace {}", spec.name)))?;
        Ok(())
    }

    async fn list_namespaces(&self, label_selector: &str) -> ClusterResult<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| map_error(e, "namespaces"))?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_error(e, &format!("namespace {name}")))?;
        Ok(())
    }

    async fn create(&self, manifest: &serde_json::Value) -> ClusterResult<ObjectRef> {
        let target = ObjectRef::of_manifest(manifest)?;
        let (resource, caps) = self.resolve(&target.kind).await?;
        let object: DynamicObject = serde_json::from_value(manifest.clone())
            .map_err(|e| ClusterError::InvalidObject(format!("{target}: {e}")))?;
        let api = self.api(&resource, &caps, target.namespace.as_deref());
        let created = api
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_error(e, &target.to_string()))?;
        Ok(Self::reference(&target.kind, &caps, &created))
    }

    async fn get(&self, object: &ObjectRef) -> ClusterResult<Option<serde_json::Value>> {
        let (resource, caps) = self.resolve(&object.kind).await?;
        let api = self.api(&resource, &caps, object.namespace.as_deref());
        let found = api
            .get_opt(&object.name)
            .await
            .map_err(|e| map_error(e, &object.to_string()))?;
        found
            .map(|obj| {
                serde_json::to_value(obj)
                    .map_err(|e| ClusterError::InvalidObject(format!("{object}: {e}")))
            })
            .transpose()
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> ClusterResult<Vec<ObjectRef>> {
        let (resource, caps) = self.resolve(kind).await?;
        let api = self.api(&resource, &caps, namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| map_error(e, &kind.to_string()))?;
        Ok(list
            .items
            .iter()
            .map(|obj| Self::reference(kind, &caps, obj))
            .collect())
    }

    async fn delete(&self, object: &ObjectRef) -> ClusterResult<()> {
        let (resource, caps) = self.resolve(&object.kind).await?;
        let api = self.api(&resource, &caps, object.namespace.as_deref());
        api.delete(&object.name, &DeleteParams::background())
            .await
            .map_err(|e| map_error(e, &object.to_string()))?;
        Ok(())
    }

    async fn deletable_kinds(&self) -> ClusterResult<Vec<ResourceKind>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| map_error(e, "api discovery"))?;
        let mut kinds = Vec::new();
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::DELETE) {
                    continue;
                }
                // namespaces are removed separately; events are never labelled
                if resource.kind == "Namespace" || resource.kind == "Event" {
                    continue;
                }
                let mut kind = ResourceKind::new(resource.api_version.clone(), resource.kind.clone());
                kind.namespaced = caps.scope == Scope::Namespaced;
                self.resolved.insert(kind.to_string(), (resource, caps));
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    async fn nodes(&self) -> ClusterResult<Vec<NodeHealth>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_error(e, "nodes"))?;
        Ok(list
            .items
            .into_iter()
            .map(|node| {
                let name = node.metadata.name.unwrap_or_default();
                let ready = node
                    .status
                    .and_then(|s| s.conditions)
                    .and_then(|conds| conds.into_iter().find(|c| c.type_ == "Ready"));
                match ready {
                    Some(c) if c.status == "True" => NodeHealth::ready(name),
                    Some(c) => NodeHealth::not_ready(
                        name,
                        c.reason.or(c.message).unwrap_or_else(|| c.status.clone()),
                    ),
                    None => NodeHealth::not_ready(name, "no Ready condition"),
                }
            })
            .collect())
    }
}
