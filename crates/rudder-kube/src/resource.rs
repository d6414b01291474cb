//! Resource handles and ordered resource lists

use std::collections::BTreeMap;
use std::fmt;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use serde_json::Value;

use crate::annotations;
use crate::error::Result;
use crate::kinds::KindTag;
use crate::patch::PatchStrategy;

/// Identity of a resource: group, kind, namespace and name
///
/// The version is not part of the key, so `apps/v1beta2` and `apps/v1`
/// handles of the same Deployment compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A resource parsed from a manifest, bound to its API endpoint
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub gvk: GroupVersionKind,
    pub api_resource: ApiResource,
    pub namespaced: bool,
    pub namespace: Option<String>,
    pub name: String,
    /// Desired object, or the live one after a refresh
    pub object: DynamicObject,
    pub kind_tag: KindTag,
    pub strategy: PatchStrategy,
}

impl ResourceInfo {
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            group: self.gvk.group.clone(),
            kind: self.gvk.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Object as JSON
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.object)?)
    }

    /// Adopt the server's view (resource version, UID, status)
    pub fn refresh(&mut self, live: DynamicObject) {
        self.object = live;
    }

    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.object.metadata.annotations.as_ref()
    }

    /// Resource policy says `keep`
    pub fn has_keep_policy(&self) -> bool {
        self.annotations().is_some_and(annotations::has_keep_policy)
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.object.metadata.resource_version.as_deref()
    }

    pub fn uid(&self) -> Option<&str> {
        self.object.metadata.uid.as_deref()
    }
}

impl fmt::Display for ResourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key().fmt(f)
    }
}

/// Ordered list of resource handles, unique by `ResourceKey`
#[derive(Debug, Clone, Default)]
pub struct ResourceList(Vec<ResourceInfo>);

impl ResourceList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a handle, replacing an existing one with the same key in place
    pub fn push(&mut self, info: ResourceInfo) {
        let key = info.key();
        match self.0.iter_mut().find(|r| r.key() == key) {
            Some(existing) => *existing = info,
            None => self.0.push(info),
        }
    }

    pub fn extend(&mut self, other: ResourceList) {
        for info in other {
            self.push(info);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResourceInfo> {
        self.0.iter()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceInfo> {
        self.0.iter().find(|r| &r.key() == key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.get(key).is_some()
    }

    /// Handles of `self` whose key is not in `other`
    pub fn difference(&self, other: &ResourceList) -> ResourceList {
        self.filter(|r| !other.contains(&r.key()))
    }

    /// Handles of `self` whose key is also in `other`
    pub fn intersect(&self, other: &ResourceList) -> ResourceList {
        self.filter(|r| other.contains(&r.key()))
    }

    pub fn filter(&self, predicate: impl Fn(&ResourceInfo) -> bool) -> ResourceList {
        Self(self.0.iter().filter(|r| predicate(r)).cloned().collect())
    }

    pub fn reversed(&self) -> ResourceList {
        Self(self.0.iter().rev().cloned().collect())
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.0.iter().map(ResourceInfo::key).collect()
    }

    /// Consecutive runs of handles sharing group and kind
    pub fn by_kind_batches(&self) -> Vec<&[ResourceInfo]> {
        self.0
            .chunk_by(|a, b| a.gvk.group == b.gvk.group && a.gvk.kind == b.gvk.kind)
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

impl FromIterator<ResourceInfo> for ResourceList {
    fn from_iter<I: IntoIterator<Item = ResourceInfo>>(iter: I) -> Self {
        let mut list = ResourceList::new();
        for info in iter {
            list.push(info);
        }
        list
    }
}

impl IntoIterator for ResourceList {
    type Item = ResourceInfo;
    type IntoIter = std::vec::IntoIter<ResourceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResourceList {
    type Item = &'a ResourceInfo;
    type IntoIter = std::slice::Iter<'a, ResourceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
