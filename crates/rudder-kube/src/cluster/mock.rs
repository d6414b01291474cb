//! In-memory cluster for testing
//!
//! Objects are stored as JSON. Workloads get a ready status on write so
//! `wait` succeeds without controllers; tests override that per object,
//! inject API errors, or make the whole cluster unreachable.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kube::api::{DynamicObject, PropagationPolicy};
use kube::core::{ErrorResponse, GroupVersionKind};
use kube::discovery::ApiResource;
use serde_json::{Value, json};

use super::{ClusterClient, ResolvedKind};
use crate::error::{KubeError, Result};
use crate::patch::{self, ComputedPatch};
use crate::resource::{ResourceInfo, ResourceKey};

/// Cluster operation, for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Patch,
    Replace,
    Delete,
    Logs,
}

/// An API error returned when an operation matches
#[derive(Debug, Clone)]
pub struct Injection {
    op: Op,
    kind: Option<String>,
    name: Option<String>,
    code: u16,
    reason: String,
    remaining: Option<usize>,
}

impl Injection {
    /// Fail every `op` with HTTP `code` until cleared
    pub fn new(op: Op, code: u16) -> Self {
        let reason = match code {
            404 => "NotFound",
            409 => "Conflict",
            422 => "Invalid",
            429 => "TooManyRequests",
            500 => "InternalError",
            503 => "ServiceUnavailable",
            _ => "Failure",
        };
        Self {
            op,
            kind: None,
            name: None,
            code,
            reason: reason.to_string(),
            remaining: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Only fail the next `n` matching calls
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, op: Op, info: &ResourceInfo) -> bool {
        self.op == op
            && self.remaining != Some(0)
            && self.kind.as_deref().is_none_or(|k| k == info.gvk.kind)
            && self.name.as_deref().is_none_or(|n| n == info.name)
    }

    fn error(&self, info: &ResourceInfo) -> KubeError {
        api_error(self.code, &self.reason, format!("injected failure for {}", info))
    }
}

fn api_error(code: u16, reason: &str, message: String) -> KubeError {
    KubeError::Api(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

/// Calls made against the mock
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: usize,
    pub creates: usize,
    pub patches: usize,
    pub replaces: usize,
    pub deletes: usize,
    pub logs: usize,
}

impl CallCounts {
    /// Calls that mutate the cluster
    pub fn writes(&self) -> usize {
        self.creates + self.patches + self.replaces + self.deletes
    }
}

struct State {
    kinds: Vec<(GroupVersionKind, ResolvedKind)>,
    objects: BTreeMap<ResourceKey, Value>,
    status_overrides: BTreeMap<(String, String), Value>,
    logs: BTreeMap<(String, String), String>,
    injections: Vec<Injection>,
    calls: CallCounts,
    next_id: u64,
    unreachable: bool,
}

/// In-memory `ClusterClient`
pub struct MockCluster {
    state: Mutex<State>,
}

const BUILTIN_KINDS: &[(&str, &str, bool)] = &[
    ("v1", "Namespace", false),
    ("v1", "ConfigMap", true),
    ("v1", "Secret", true),
    ("v1", "Service", true),
    ("v1", "ServiceAccount", true),
    ("v1", "Pod", true),
    ("v1", "PersistentVolumeClaim", true),
    ("apps/v1", "Deployment", true),
    ("apps/v1", "StatefulSet", true),
    ("apps/v1", "DaemonSet", true),
    ("apps/v1", "ReplicaSet", true),
    ("batch/v1", "Job", true),
    ("batch/v1", "CronJob", true),
    ("rbac.authorization.k8s.io/v1", "Role", true),
    ("rbac.authorization.k8s.io/v1", "RoleBinding", true),
    ("rbac.authorization.k8s.io/v1", "ClusterRole", false),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding", false),
    ("networking.k8s.io/v1", "Ingress", true),
    ("networking.k8s.io/v1", "NetworkPolicy", true),
    ("policy/v1", "PodDisruptionBudget", true),
    ("autoscaling/v2", "HorizontalPodAutoscaler", true),
    ("apiextensions.k8s.io/v1", "CustomResourceDefinition", false),
];

fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Mock with the built-in kinds registered
    pub fn new() -> Self {
        let mock = Self {
            state: Mutex::new(State {
                kinds: Vec::new(),
                objects: BTreeMap::new(),
                status_overrides: BTreeMap::new(),
                logs: BTreeMap::new(),
                injections: Vec::new(),
                calls: CallCounts::default(),
                next_id: 0,
                unreachable: false,
            }),
        };
        for (api_version, kind, namespaced) in BUILTIN_KINDS {
            mock.register_kind(api_version, kind, *namespaced);
        }
        mock
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a kind known to discovery
    pub fn register_kind(&self, api_version: &str, kind: &str, namespaced: bool) {
        let gvk = gvk_of(api_version, kind);
        let resolved = ResolvedKind {
            api_resource: ApiResource::from_gvk(&gvk),
            namespaced,
        };
        let mut state = self.lock();
        state.kinds.retain(|(g, _)| g != &gvk);
        state.kinds.push((gvk, resolved));
    }

    pub fn inject(&self, injection: Injection) {
        self.lock().injections.push(injection);
    }

    pub fn clear_injections(&self) {
        self.lock().injections.clear();
    }

    /// Every call fails with a connection error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Status written instead of the synthesized one for `kind`/`name`
    pub fn set_status(&self, kind: &str, name: &str, status: Value) {
        self.lock()
            .status_overrides
            .insert((kind.to_string(), name.to_string()), status);
    }

    pub fn set_logs(&self, kind: &str, name: &str, logs: impl Into<String>) {
        self.lock()
            .logs
            .insert((kind.to_string(), name.to_string()), logs.into());
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.lock().calls = CallCounts::default();
    }

    /// Store an object directly, as if created out of band
    pub fn insert(&self, object: Value) {
        let api_version = object["apiVersion"].as_str().unwrap_or_default();
        let kind = object["kind"].as_str().unwrap_or_default().to_string();
        let gvk = gvk_of(api_version, &kind);
        let key = ResourceKey {
            group: gvk.group,
            kind,
            namespace: object["metadata"]["namespace"].as_str().map(str::to_string),
            name: object["metadata"]["name"].as_str().unwrap_or_default().to_string(),
        };
        self.lock().objects.insert(key, object);
    }

    /// Live object by kind, namespace and name
    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.lock()
            .objects
            .iter()
            .find(|(k, _)| k.kind == kind && k.namespace.as_deref() == namespace && k.name == name)
            .map(|(_, v)| v.clone())
    }

    /// `Kind/name` of every live object
    pub fn object_names(&self) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .map(|k| format!("{}/{}", k.kind, k.name))
            .collect()
    }

    /// Count the call, then apply reachability and injected failures
    fn enter(&self, op: Op, info: &ResourceInfo) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        match op {
            Op::Get => state.calls.gets += 1,
            Op::Create => state.calls.creates += 1,
            Op::Patch => state.calls.patches += 1,
            Op::Replace => state.calls.replaces += 1,
            Op::Delete => state.calls.deletes += 1,
            Op::Logs => state.calls.logs += 1,
        }
        if state.unreachable {
            return Err(KubeError::Connection(
                "dial tcp 127.0.0.1:6443: connect: connection refused".to_string(),
            ));
        }
        if let Some(injection) = state.injections.iter_mut().find(|i| i.matches(op, info)) {
            if let Some(n) = injection.remaining.as_mut() {
                *n -= 1;
            }
            return Err(injection.error(info));
        }
        Ok(state)
    }
}

impl State {
    fn stamp(&mut self, obj: &mut Value, previous: Option<&Value>) {
        self.next_id += 1;
        let uid = previous
            .and_then(|p| p.pointer("/metadata/uid").cloned())
            .unwrap_or_else(|| json!(format!("uid-{}", self.next_id)));
        let generation = match previous {
            None => 1,
            Some(p) => {
                let before = p.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(1);
                if p.get("spec") == obj.get("spec") {
                    before
                } else {
                    before + 1
                }
            }
        };

        let metadata = &mut obj["metadata"];
        metadata["uid"] = uid;
        metadata["resourceVersion"] = json!(self.next_id.to_string());
        metadata["generation"] = json!(generation);

        if obj["kind"] == "Service" && obj["spec"]["type"] != "ExternalName" {
            let assigned = previous
                .and_then(|p| p.pointer("/spec/clusterIP").cloned())
                .unwrap_or_else(|| json!(format!("10.96.0.{}", self.next_id % 250 + 1)));
            if obj["spec"]["clusterIP"].is_null() {
                obj["spec"]["clusterIP"] = assigned;
            }
        }

        let kind = obj["kind"].as_str().unwrap_or_default().to_string();
        let name = obj["metadata"]["name"].as_str().unwrap_or_default().to_string();
        match self.status_overrides.get(&(kind, name)) {
            Some(status) => obj["status"] = status.clone(),
            None => synthesize_status(obj),
        }
    }

    /// Teach discovery the kinds a CRD defines
    fn register_crd(&mut self, crd: &Value) {
        let Some(group) = crd.pointer("/spec/group").and_then(Value::as_str) else {
            return;
        };
        let Some(kind) = crd.pointer("/spec/names/kind").and_then(Value::as_str) else {
            return;
        };
        let namespaced = crd.pointer("/spec/scope").and_then(Value::as_str) != Some("Cluster");
        let versions = crd
            .pointer("/spec/versions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for version in versions.iter().filter_map(|v| v.get("name").and_then(Value::as_str)) {
            let gvk = GroupVersionKind::gvk(group, version, kind);
            let mut api_resource = ApiResource::from_gvk(&gvk);
            if let Some(plural) = crd.pointer("/spec/names/plural").and_then(Value::as_str) {
                api_resource.plural = plural.to_string();
            }
            self.kinds.retain(|(g, _)| g != &gvk);
            self.kinds.push((gvk, ResolvedKind { api_resource, namespaced }));
        }
    }
}

/// Ready status a controller would eventually write
fn synthesize_status(obj: &mut Value) {
    let generation = obj.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(1);
    let replicas = obj.pointer("/spec/replicas").and_then(Value::as_i64).unwrap_or(1);
    let status = match obj["kind"].as_str().unwrap_or_default() {
        "Deployment" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "updatedReplicas": replicas,
            "readyReplicas": replicas,
            "availableReplicas": replicas
        }),
        "StatefulSet" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "readyReplicas": replicas,
            "currentRevision": format!("rev-{}", generation),
            "updateRevision": format!("rev-{}", generation)
        }),
        "DaemonSet" => json!({
            "observedGeneration": generation,
            "desiredNumberScheduled": 1,
            "updatedNumberScheduled": 1,
            "numberReady": 1,
            "numberAvailable": 1
        }),
        "ReplicaSet" => json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "readyReplicas": replicas,
            "availableReplicas": replicas
        }),
        "Pod" => json!({"phase": "Succeeded"}),
        "Job" => json!({
            "succeeded": 1,
            "conditions": [{"type": "Complete", "status": "True"}]
        }),
        "PersistentVolumeClaim" => json!({"phase": "Bound"}),
        "Service" if obj["spec"]["type"] == "LoadBalancer" => json!({
            "loadBalancer": {"ingress": [{"ip": "192.0.2.10"}]}
        }),
        "CustomResourceDefinition" => json!({
            "conditions": [
                {"type": "NamesAccepted", "status": "True"},
                {"type": "Established", "status": "True"}
            ]
        }),
        _ => return,
    };
    obj["status"] = status;
}

fn not_found(info: &ResourceInfo) -> KubeError {
    api_error(
        404,
        "NotFound",
        format!("{} \"{}\" not found", info.api_resource.plural, info.name),
    )
}

fn to_object(value: &Value) -> Result<DynamicObject> {
    Ok(serde_json::from_value(value.clone())?)
}

#[async_trait]
impl ClusterClient for MockCluster {
    fn resolve(&self, gvk: &GroupVersionKind) -> Option<ResolvedKind> {
        self.lock()
            .kinds
            .iter()
            .find(|(g, _)| g == gvk)
            .map(|(_, r)| r.clone())
    }

    async fn refresh_discovery(&self) -> Result<()> {
        if self.lock().unreachable {
            return Err(KubeError::Connection("connection refused".to_string()));
        }
        Ok(())
    }

    async fn get(&self, info: &ResourceInfo) -> Result<Option<DynamicObject>> {
        let state = self.enter(Op::Get, info)?;
        state.objects.get(&info.key()).map(to_object).transpose()
    }

    async fn create(&self, info: &ResourceInfo) -> Result<DynamicObject> {
        let mut state = self.enter(Op::Create, info)?;
        let key = info.key();
        if state.objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", info.api_resource.plural, info.name),
            ));
        }
        let mut obj = info.to_value()?;
        state.stamp(&mut obj, None);
        if obj["kind"] == "CustomResourceDefinition" {
            state.register_crd(&obj);
        }
        let created = to_object(&obj)?;
        state.objects.insert(key, obj);
        Ok(created)
    }

    async fn patch(&self, info: &ResourceInfo, patch: &ComputedPatch) -> Result<DynamicObject> {
        let mut state = self.enter(Op::Patch, info)?;
        let key = info.key();
        let Some(previous) = state.objects.get(&key).cloned() else {
            return Err(not_found(info));
        };
        let mut obj = previous.clone();
        patch::apply(&mut obj, patch);
        state.stamp(&mut obj, Some(&previous));
        let patched = to_object(&obj)?;
        state.objects.insert(key, obj);
        Ok(patched)
    }

    async fn replace(&self, info: &ResourceInfo) -> Result<DynamicObject> {
        let mut state = self.enter(Op::Replace, info)?;
        let key = info.key();
        let Some(previous) = state.objects.get(&key).cloned() else {
            return Err(not_found(info));
        };
        let live_version = previous.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        if let Some(sent) = info.resource_version()
            && Some(sent) != live_version
        {
            return Err(api_error(
                409,
                "Conflict",
                format!("the object has been modified; resource version {} is stale", sent),
            ));
        }
        let mut obj = info.to_value()?;
        state.stamp(&mut obj, Some(&previous));
        let replaced = to_object(&obj)?;
        state.objects.insert(key, obj);
        Ok(replaced)
    }

    async fn delete(&self, info: &ResourceInfo, _propagation: PropagationPolicy) -> Result<()> {
        let mut state = self.enter(Op::Delete, info)?;
        match state.objects.remove(&info.key()) {
            Some(_) => Ok(()),
            None => Err(not_found(info)),
        }
    }

    async fn logs(&self, info: &ResourceInfo) -> Result<String> {
        let state = self.enter(Op::Logs, info)?;
        Ok(state
            .logs
            .get(&(info.gvk.kind.clone(), info.name.clone()))
            .cloned()
            .unwrap_or_default())
    }
}
