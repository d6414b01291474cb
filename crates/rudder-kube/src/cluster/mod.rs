//! Cluster access
//!
//! The reconciler, hook executor and builder only see `ClusterClient`:
//! - **KubeCluster**: a live API server through `kube`
//! - **MockCluster**: in-memory objects with failure injection, for tests

mod live;
mod mock;

pub use live::KubeCluster;
pub use mock::{CallCounts, Injection, MockCluster, Op};

use kube::api::{DynamicObject, PropagationPolicy};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use async_trait::async_trait;

use crate::error::Result;
use crate::patch::ComputedPatch;
use crate::resource::ResourceInfo;

/// A kind known to discovery
#[derive(Debug, Clone)]
pub struct ResolvedKind {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

/// Untyped CRUD plus discovery
///
/// Errors from the API server surface as `KubeError::Api`; failures to
/// reach it as `KubeError::Connection`.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Look up a kind in the cached discovery data
    fn resolve(&self, gvk: &GroupVersionKind) -> Option<ResolvedKind>;

    /// Reload discovery, e.g. after CRDs were installed
    async fn refresh_discovery(&self) -> Result<()>;

    /// Fetch the live object; `None` if absent
    async fn get(&self, info: &ResourceInfo) -> Result<Option<DynamicObject>>;

    /// Create `info.object`
    async fn create(&self, info: &ResourceInfo) -> Result<DynamicObject>;

    async fn patch(&self, info: &ResourceInfo, patch: &ComputedPatch) -> Result<DynamicObject>;

    /// Replace with `info.object`, which must carry the live resource version
    async fn replace(&self, info: &ResourceInfo) -> Result<DynamicObject>;

    async fn delete(&self, info: &ResourceInfo, propagation: PropagationPolicy) -> Result<()>;

    /// Container logs of a pod, or of the pods of a job
    async fn logs(&self, info: &ResourceInfo) -> Result<String>;
}
