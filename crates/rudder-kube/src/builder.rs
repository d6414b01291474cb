//! Resource Builder
//!
//! Turns a multi-document manifest into a `ResourceList` without touching
//! the cluster: each document is decoded, resolved against cached
//! discovery, defaulted into the release namespace and tagged with its
//! kind behavior and patch strategy.

use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, TypeMeta};
use kube::discovery::ApiResource;
use rudder_core::manifest::{is_custom_api_version, split_documents};
use serde::de::DeserializeOwned;

use crate::annotations;
use crate::cluster::ClusterClient;
use crate::error::{KubeError, Result};
use crate::kinds::KindTag;
use crate::patch::PatchStrategy;
use crate::resource::{ResourceInfo, ResourceList};

/// Release ownership stamped onto every built object
#[derive(Debug, Clone)]
pub struct Owner {
    pub release: String,
    pub namespace: String,
    pub manager: String,
}

/// Builds resource handles for one namespace
pub struct Builder {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    owner: Option<Owner>,
}

impl Builder {
    pub fn new(cluster: Arc<dyn ClusterClient>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            owner: None,
        }
    }

    /// Stamp release ownership onto every object
    pub fn with_owner(mut self, release: impl Into<String>, manager: impl Into<String>) -> Self {
        self.owner = Some(Owner {
            release: release.into(),
            namespace: self.namespace.clone(),
            manager: manager.into(),
        });
        self
    }

    /// Build every document of `manifest`, in order
    ///
    /// With `validate`, known kinds are decoded against their schema and
    /// kinds missing from discovery are rejected; without it they are
    /// treated as schema-less. All document errors are reported together.
    pub fn build(&self, manifest: &str, validate: bool) -> Result<ResourceList> {
        let documents = split_documents(manifest);
        if documents.is_empty() {
            return Err(KubeError::NoObjectsVisited);
        }

        let mut list = ResourceList::new();
        let mut errors = Vec::new();
        for (index, doc) in documents.iter().enumerate() {
            match self.build_document(index, doc, validate) {
                Ok(info) => list.push(info),
                Err(e) => errors.push(e),
            }
        }

        match KubeError::join(errors) {
            Some(err) => Err(err),
            None => Ok(list),
        }
    }

    fn build_document(&self, index: usize, doc: &str, validate: bool) -> Result<ResourceInfo> {
        let invalid = |message: String| KubeError::InvalidManifest(format!("document {}: {}", index, message));

        let mut object: DynamicObject =
            serde_yaml::from_str(doc).map_err(|e| invalid(e.to_string()))?;
        let types = object
            .types
            .clone()
            .filter(|t| !t.api_version.is_empty() && !t.kind.is_empty())
            .ok_or_else(|| invalid("missing apiVersion or kind".to_string()))?;
        let name = object
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid(format!("{} has no metadata.name", types.kind)))?;

        if validate {
            check_schema(&types, doc)
                .map_err(|message| invalid(format!("{} {}: {}", types.kind, name, message)))?;
        }

        let gvk = gvk_from_type_meta(&types);
        let kind_tag = KindTag::resolve(&gvk.group, &gvk.kind);

        let (api_resource, namespaced, strategy) = match self.cluster.resolve(&gvk) {
            Some(resolved) => {
                let strategy = if is_custom_api_version(&types.api_version)
                    || kind_tag == KindTag::CustomResourceDefinition
                {
                    PatchStrategy::JsonMerge
                } else {
                    PatchStrategy::StrategicMerge
                };
                (resolved.api_resource, resolved.namespaced, strategy)
            }
            None if validate => {
                return Err(KubeError::UnknownKind {
                    api_version: types.api_version,
                    kind: types.kind,
                });
            }
            None => (ApiResource::from_gvk(&gvk), true, PatchStrategy::JsonMerge),
        };

        let namespace = if namespaced {
            Some(
                object
                    .metadata
                    .namespace
                    .get_or_insert_with(|| self.namespace.clone())
                    .clone(),
            )
        } else {
            object.metadata.namespace = None;
            None
        };

        if let Some(owner) = &self.owner {
            annotations::set_owner(&mut object, &owner.release, &owner.namespace, &owner.manager);
        }

        Ok(ResourceInfo {
            gvk,
            api_resource,
            namespaced,
            namespace,
            name,
            object,
            kind_tag,
            strategy,
        })
    }
}

/// Convert TypeMeta to GroupVersionKind
///
/// - "apps/v1" -> group="apps", version="v1"
/// - "v1" -> group="", version="v1" (core API)
fn gvk_from_type_meta(tm: &TypeMeta) -> GroupVersionKind {
    match tm.api_version.rsplit_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &tm.kind),
        None => GroupVersionKind::gvk("", &tm.api_version, &tm.kind),
    }
}

fn decode<K: DeserializeOwned>(doc: &str) -> std::result::Result<(), String> {
    serde_yaml::from_str::<K>(doc)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Decode built-in kinds into their typed schema
fn check_schema(types: &TypeMeta, doc: &str) -> std::result::Result<(), String> {
    use k8s_openapi::api::{
        apps::v1 as apps, batch::v1 as batch, core::v1 as core, networking::v1 as networking,
        rbac::v1 as rbac,
    };
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextensions;

    match (types.api_version.as_str(), types.kind.as_str()) {
        ("v1", "Namespace") => decode::<core::Namespace>(doc),
        ("v1", "ConfigMap") => decode::<core::ConfigMap>(doc),
        ("v1", "Secret") => decode::<core::Secret>(doc),
        ("v1", "Service") => decode::<core::Service>(doc),
        ("v1", "ServiceAccount") => decode::<core::ServiceAccount>(doc),
        ("v1", "Pod") => decode::<core::Pod>(doc),
        ("v1", "PersistentVolumeClaim") => decode::<core::PersistentVolumeClaim>(doc),
        ("apps/v1", "Deployment") => decode::<apps::Deployment>(doc),
        ("apps/v1", "StatefulSet") => decode::<apps::StatefulSet>(doc),
        ("apps/v1", "DaemonSet") => decode::<apps::DaemonSet>(doc),
        ("apps/v1", "ReplicaSet") => decode::<apps::ReplicaSet>(doc),
        ("batch/v1", "Job") => decode::<batch::Job>(doc),
        ("batch/v1", "CronJob") => decode::<batch::CronJob>(doc),
        ("networking.k8s.io/v1", "Ingress") => decode::<networking::Ingress>(doc),
        ("networking.k8s.io/v1", "NetworkPolicy") => decode::<networking::NetworkPolicy>(doc),
        ("rbac.authorization.k8s.io/v1", "Role") => decode::<rbac::Role>(doc),
        ("rbac.authorization.k8s.io/v1", "RoleBinding") => decode::<rbac::RoleBinding>(doc),
        ("rbac.authorization.k8s.io/v1", "ClusterRole") => decode::<rbac::ClusterRole>(doc),
        ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding") => {
            decode::<rbac::ClusterRoleBinding>(doc)
        }
        ("apiextensions.k8s.io/v1", "CustomResourceDefinition") => {
            decode::<apiextensions::CustomResourceDefinition>(doc)
        }
        _ => Ok(()),
    }
}
