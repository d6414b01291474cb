//! `ClusterClient` backed by a live API server

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams, PropagationPolicy},
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
};

use super::{ClusterClient, ResolvedKind};
use crate::error::{KubeError, Result};
use crate::kinds::KindTag;
use crate::patch::{ComputedPatch, PatchStrategy};
use crate::resource::ResourceInfo;

/// Label the job controller puts on its pods
const JOB_NAME_LABEL: &str = "job-name";

/// Live cluster client with cached discovery
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Discovery>,
    manager: String,
}

/// Keep API server answers as `Api`, everything else means we never got one
fn classify(err: kube::Error) -> KubeError {
    match err {
        kube::Error::Api(_) => KubeError::Api(err),
        other => KubeError::Connection(other.to_string()),
    }
}

impl KubeCluster {
    /// Connect with an existing client and run discovery
    pub async fn new(client: Client, manager: impl Into<String>) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await.map_err(classify)?;
        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
            manager: manager.into(),
        })
    }

    /// Connect using the default kubeconfig or in-cluster config
    pub async fn try_default(manager: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| KubeError::Connection(e.to_string()))?;
        Self::new(client, manager).await
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, info: &ResourceInfo) -> Api<DynamicObject> {
        match (&info.namespace, info.namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &info.api_resource),
            _ => Api::all_with(self.client.clone(), &info.api_resource),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.manager.clone()),
            ..Default::default()
        }
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.logs(pod, &LogParams::default()).await.map_err(classify)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    fn resolve(&self, gvk: &GroupVersionKind) -> Option<ResolvedKind> {
        let discovery = self.discovery.read().unwrap_or_else(PoisonError::into_inner);
        discovery
            .resolve_gvk(gvk)
            .map(|(api_resource, caps)| ResolvedKind {
                api_resource,
                namespaced: caps.scope == Scope::Namespaced,
            })
    }

    async fn refresh_discovery(&self) -> Result<()> {
        let fresh = Discovery::new(self.client.clone()).run().await.map_err(classify)?;
        *self.discovery.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        tracing::debug!("refreshed API discovery");
        Ok(())
    }

    async fn get(&self, info: &ResourceInfo) -> Result<Option<DynamicObject>> {
        self.api(info).get_opt(&info.name).await.map_err(classify)
    }

    async fn create(&self, info: &ResourceInfo) -> Result<DynamicObject> {
        self.api(info)
            .create(&self.post_params(), &info.object)
            .await
            .map_err(classify)
    }

    async fn patch(&self, info: &ResourceInfo, patch: &ComputedPatch) -> Result<DynamicObject> {
        let api = self.api(info);
        let params = PatchParams {
            field_manager: Some(self.manager.clone()),
            ..Default::default()
        };
        let result = match patch.strategy {
            PatchStrategy::StrategicMerge => {
                api.patch(&info.name, &params, &Patch::Strategic(&patch.body)).await
            }
            PatchStrategy::JsonMerge => api.patch(&info.name, &params, &Patch::Merge(&patch.body)).await,
            PatchStrategy::Replace => {
                let obj: DynamicObject = serde_json::from_value(patch.body.clone())?;
                api.replace(&info.name, &self.post_params(), &obj).await
            }
        };
        result.map_err(classify)
    }

    async fn replace(&self, info: &ResourceInfo) -> Result<DynamicObject> {
        self.api(info)
            .replace(&info.name, &self.post_params(), &info.object)
            .await
            .map_err(classify)
    }

    async fn delete(&self, info: &ResourceInfo, propagation: PropagationPolicy) -> Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(propagation),
            ..Default::default()
        };
        self.api(info)
            .delete(&info.name, &params)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn logs(&self, info: &ResourceInfo) -> Result<String> {
        let Some(namespace) = info.namespace.as_deref() else {
            return Ok(String::new());
        };
        match info.kind_tag {
            KindTag::Pod => self.pod_logs(namespace, &info.name).await,
            KindTag::Job => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let selector = format!("{}={}", JOB_NAME_LABEL, info.name);
                let list = pods
                    .list(&ListParams::default().labels(&selector))
                    .await
                    .map_err(classify)?;

                let mut out = String::new();
                for pod in list.items {
                    let Some(name) = pod.metadata.name else {
                        continue;
                    };
                    let log = self.pod_logs(namespace, &name).await?;
                    out.push_str(&format!("==> {} <==\n{}\n", name, log));
                }
                Ok(out)
            }
            _ => Ok(String::new()),
        }
    }
}
