//! Per-kind behavior
//!
//! Every resource handle carries a `KindTag` resolved once when the
//! manifest is built. Readiness, hook completion, log capture and deletion
//! exemptions are looked up in a static table keyed by that tag.

use serde_json::Value;

/// Kinds with dedicated behavior; everything else is `Generic`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindTag {
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    Pod,
    Job,
    PersistentVolumeClaim,
    Service,
    CustomResourceDefinition,
    Generic,
}

/// Outcome of a readiness or completion check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not there yet; the reason is reported on timeout
    Pending(String),
    /// Will never become ready
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Behavior table entry
pub struct KindBehavior {
    /// Steady-state readiness
    pub readiness: fn(&Value) -> Readiness,
    /// Completion of a hook resource
    pub hook_completion: fn(&Value) -> Readiness,
    /// Container logs can be captured
    pub has_logs: bool,
    /// Never deleted by hook policy
    pub never_auto_delete: bool,
}

const DEPLOYMENT: KindBehavior = KindBehavior {
    readiness: deployment_ready,
    hook_completion: always_ready,
    has_logs: false,
    never_auto_delete: false,
};
const STATEFUL_SET: KindBehavior = KindBehavior {
    readiness: stateful_set_ready,
    hook_completion: always_ready,
    has_logs: false,
    never_auto_delete: false,
};
const DAEMON_SET: KindBehavior = KindBehavior {
    readiness: daemon_set_ready,
    hook_completion: always_ready,
    has_logs: false,
    never_auto_delete: false,
};
const REPLICA_SET: KindBehavior = KindBehavior {
    readiness: replica_set_ready,
    hook_completion: always_ready,
    has_logs: false,
    never_auto_delete: false,
};
const POD: KindBehavior = KindBehavior {
    readiness: pod_ready,
    hook_completion: pod_completed,
    has_logs: true,
    never_auto_delete: false,
};
const JOB: KindBehavior = KindBehavior {
    readiness: job_completed,
    hook_completion: job_completed,
    has_logs: true,
    never_auto_delete: false,
};
const PVC: KindBehavior = KindBehavior {
    readiness: pvc_bound,
    hook_completion: always_ready,
    has_logs: false,
    never_auto_delete: false,
};
const SERVICE: KindBehavior = KindBehavior {
    readiness: service_ready,
    hook_completion: always_ready,
    has_logs: false,
    never_auto_delete: false,
};
const CRD: KindBehavior = KindBehavior {
    readiness: crd_established,
    hook_completion: crd_established,
    has_logs: false,
    never_auto_delete: true,
};
const GENERIC: KindBehavior = KindBehavior {
    readiness: always_ready,
    hook_completion: always_ready,
    has_logs: false,
    never_auto_delete: false,
};

impl KindTag {
    /// Resolve the tag for an API group and kind
    pub fn resolve(group: &str, kind: &str) -> Self {
        match (group, kind) {
            ("apps" | "extensions", "Deployment") => KindTag::Deployment,
            ("apps", "StatefulSet") => KindTag::StatefulSet,
            ("apps" | "extensions", "DaemonSet") => KindTag::DaemonSet,
            ("apps" | "extensions", "ReplicaSet") => KindTag::ReplicaSet,
            ("", "Pod") => KindTag::Pod,
            ("batch", "Job") => KindTag::Job,
            ("", "PersistentVolumeClaim") => KindTag::PersistentVolumeClaim,
            ("", "Service") => KindTag::Service,
            ("apiextensions.k8s.io", "CustomResourceDefinition") => {
                KindTag::CustomResourceDefinition
            }
            _ => KindTag::Generic,
        }
    }

    pub fn behavior(&self) -> &'static KindBehavior {
        match self {
            KindTag::Deployment => &DEPLOYMENT,
            KindTag::StatefulSet => &STATEFUL_SET,
            KindTag::DaemonSet => &DAEMON_SET,
            KindTag::ReplicaSet => &REPLICA_SET,
            KindTag::Pod => &POD,
            KindTag::Job => &JOB,
            KindTag::PersistentVolumeClaim => &PVC,
            KindTag::Service => &SERVICE,
            KindTag::CustomResourceDefinition => &CRD,
            KindTag::Generic => &GENERIC,
        }
    }

    pub fn readiness(&self, obj: &Value) -> Readiness {
        (self.behavior().readiness)(obj)
    }

    pub fn hook_completion(&self, obj: &Value) -> Readiness {
        (self.behavior().hook_completion)(obj)
    }

    pub fn has_logs(&self) -> bool {
        self.behavior().has_logs
    }

    pub fn never_auto_delete(&self) -> bool {
        self.behavior().never_auto_delete
    }
}

fn int_at(obj: &Value, pointer: &str) -> Option<i64> {
    obj.pointer(pointer).and_then(Value::as_i64)
}

fn str_at<'a>(obj: &'a Value, pointer: &str) -> Option<&'a str> {
    obj.pointer(pointer).and_then(Value::as_str)
}

/// Status of the condition of type `kind`, if present
fn condition(obj: &Value, kind: &str) -> Option<bool> {
    obj.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
        .map(|c| c.get("status").and_then(Value::as_str) == Some("True"))
}

/// Controller has not observed the latest spec yet
fn generation_pending(obj: &Value) -> Option<Readiness> {
    let generation = int_at(obj, "/metadata/generation")?;
    let observed = int_at(obj, "/status/observedGeneration").unwrap_or(0);
    (observed < generation).then(|| {
        Readiness::Pending(format!(
            "observed generation {} < {}",
            observed, generation
        ))
    })
}

fn replicas_ready(obj: &Value, ready_field: &str) -> Readiness {
    if let Some(pending) = generation_pending(obj) {
        return pending;
    }
    let want = int_at(obj, "/spec/replicas").unwrap_or(1);
    let have = int_at(obj, &format!("/status/{}", ready_field)).unwrap_or(0);
    if have >= want {
        Readiness::Ready
    } else {
        Readiness::Pending(format!("{} of {} replicas ready", have, want))
    }
}

fn always_ready(_: &Value) -> Readiness {
    Readiness::Ready
}

fn deployment_ready(obj: &Value) -> Readiness {
    if obj.pointer("/spec/paused").and_then(Value::as_bool) == Some(true) {
        return Readiness::Ready;
    }
    if let Some(pending) = generation_pending(obj) {
        return pending;
    }
    let want = int_at(obj, "/spec/replicas").unwrap_or(1);
    let updated = int_at(obj, "/status/updatedReplicas").unwrap_or(0);
    if updated < want {
        return Readiness::Pending(format!("{} of {} replicas updated", updated, want));
    }
    replicas_ready(obj, "availableReplicas")
}

fn stateful_set_ready(obj: &Value) -> Readiness {
    if str_at(obj, "/spec/updateStrategy/type") == Some("OnDelete") {
        return Readiness::Ready;
    }
    let ready = replicas_ready(obj, "readyReplicas");
    if !ready.is_ready() {
        return ready;
    }
    match (
        str_at(obj, "/status/currentRevision"),
        str_at(obj, "/status/updateRevision"),
    ) {
        (Some(current), Some(update)) if current != update => {
            Readiness::Pending(format!("revision {} not yet rolled out", update))
        }
        _ => Readiness::Ready,
    }
}

fn daemon_set_ready(obj: &Value) -> Readiness {
    if str_at(obj, "/spec/updateStrategy/type") == Some("OnDelete") {
        return Readiness::Ready;
    }
    if let Some(pending) = generation_pending(obj) {
        return pending;
    }
    let desired = int_at(obj, "/status/desiredNumberScheduled").unwrap_or(0);
    let updated = int_at(obj, "/status/updatedNumberScheduled").unwrap_or(0);
    let ready = int_at(obj, "/status/numberReady").unwrap_or(0);
    if updated < desired {
        Readiness::Pending(format!("{} of {} pods updated", updated, desired))
    } else if ready < desired {
        Readiness::Pending(format!("{} of {} pods ready", ready, desired))
    } else {
        Readiness::Ready
    }
}

fn replica_set_ready(obj: &Value) -> Readiness {
    replicas_ready(obj, "readyReplicas")
}

fn pod_ready(obj: &Value) -> Readiness {
    match str_at(obj, "/status/phase") {
        Some("Succeeded") => return Readiness::Ready,
        Some("Failed") => return Readiness::Failed("pod failed".to_string()),
        _ => {}
    }
    match condition(obj, "Ready") {
        Some(true) => Readiness::Ready,
        _ => Readiness::Pending("pod not ready".to_string()),
    }
}

fn pod_completed(obj: &Value) -> Readiness {
    match str_at(obj, "/status/phase") {
        Some("Succeeded") => Readiness::Ready,
        Some("Failed") => Readiness::Failed("pod failed".to_string()),
        phase => Readiness::Pending(format!("pod phase {}", phase.unwrap_or("Pending"))),
    }
}

fn job_completed(obj: &Value) -> Readiness {
    if condition(obj, "Failed") == Some(true) {
        return Readiness::Failed("job failed".to_string());
    }
    if condition(obj, "Complete") == Some(true) {
        return Readiness::Ready;
    }
    let succeeded = int_at(obj, "/status/succeeded").unwrap_or(0);
    let completions = int_at(obj, "/spec/completions").unwrap_or(1);
    if succeeded >= completions {
        Readiness::Ready
    } else {
        Readiness::Pending(format!("{} of {} completions", succeeded, completions))
    }
}

fn pvc_bound(obj: &Value) -> Readiness {
    match str_at(obj, "/status/phase") {
        Some("Bound") => Readiness::Ready,
        phase => Readiness::Pending(format!("claim phase {}", phase.unwrap_or("Pending"))),
    }
}

fn service_ready(obj: &Value) -> Readiness {
    let kind = str_at(obj, "/spec/type").unwrap_or("ClusterIP");
    if kind == "ExternalName" {
        return Readiness::Ready;
    }
    match str_at(obj, "/spec/clusterIP") {
        Some(ip) if !ip.is_empty() => {}
        _ => return Readiness::Pending("cluster IP not assigned".to_string()),
    }
    if kind == "LoadBalancer" {
        let has_ingress = obj
            .pointer("/status/loadBalancer/ingress")
            .and_then(Value::as_array)
            .map(|i| !i.is_empty())
            .unwrap_or(false);
        if !has_ingress {
            return Readiness::Pending("load balancer has no ingress".to_string());
        }
    }
    Readiness::Ready
}

fn crd_established(obj: &Value) -> Readiness {
    match condition(obj, "Established") {
        Some(true) => Readiness::Ready,
        _ => Readiness::Pending("not established".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve() {
        assert_eq!(KindTag::resolve("apps", "Deployment"), KindTag::Deployment);
        assert_eq!(KindTag::resolve("batch", "Job"), KindTag::Job);
        assert_eq!(KindTag::resolve("", "ConfigMap"), KindTag::Generic);
        assert_eq!(KindTag::resolve("example.com", "Job"), KindTag::Generic);
        assert!(KindTag::resolve("apiextensions.k8s.io", "CustomResourceDefinition").never_auto_delete());
    }

    #[test]
    fn test_log_eligibility() {
        assert!(KindTag::Job.has_logs());
        assert!(KindTag::Pod.has_logs());
        assert!(!KindTag::Deployment.has_logs());
    }

    #[test]
    fn test_deployment_readiness() {
        let pending = json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "updatedReplicas": 3, "availableReplicas": 1}
        });
        assert!(matches!(KindTag::Deployment.readiness(&pending), Readiness::Pending(_)));

        let stale = json!({
            "metadata": {"generation": 3},
            "spec": {"replicas": 1},
            "status": {"observedGeneration": 2, "updatedReplicas": 1, "availableReplicas": 1}
        });
        assert!(!KindTag::Deployment.readiness(&stale).is_ready());

        let ready = json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "updatedReplicas": 3, "availableReplicas": 3}
        });
        assert!(KindTag::Deployment.readiness(&ready).is_ready());
    }

    #[test]
    fn test_job_completion() {
        let done = json!({"status": {"conditions": [{"type": "Complete", "status": "True"}]}});
        assert!(KindTag::Job.hook_completion(&done).is_ready());

        let failed = json!({"status": {"conditions": [{"type": "Failed", "status": "True"}]}});
        assert!(matches!(KindTag::Job.hook_completion(&failed), Readiness::Failed(_)));

        let running = json!({"status": {"active": 1}});
        assert!(matches!(KindTag::Job.readiness(&running), Readiness::Pending(_)));
    }

    #[test]
    fn test_pod_completion_vs_readiness() {
        let running = json!({
            "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
        });
        assert!(KindTag::Pod.readiness(&running).is_ready());
        assert!(!KindTag::Pod.hook_completion(&running).is_ready());

        let failed = json!({"status": {"phase": "Failed"}});
        assert!(matches!(KindTag::Pod.hook_completion(&failed), Readiness::Failed(_)));
    }

    #[test]
    fn test_pvc_and_service() {
        assert!(KindTag::PersistentVolumeClaim
            .readiness(&json!({"status": {"phase": "Bound"}}))
            .is_ready());
        assert!(!KindTag::PersistentVolumeClaim
            .readiness(&json!({"status": {"phase": "Pending"}}))
            .is_ready());

        let lb = json!({"spec": {"type": "LoadBalancer", "clusterIP": "10.0.0.1"}, "status": {}});
        assert!(!KindTag::Service.readiness(&lb).is_ready());
        let cluster_ip = json!({"spec": {"clusterIP": "10.0.0.1"}});
        assert!(KindTag::Service.readiness(&cluster_ip).is_ready());
        let external = json!({"spec": {"type": "ExternalName"}});
        assert!(KindTag::Service.readiness(&external).is_ready());
    }

    #[test]
    fn test_generic_always_ready() {
        assert!(KindTag::Generic.readiness(&json!({})).is_ready());
        assert!(KindTag::Generic.hook_completion(&json!({})).is_ready());
    }
}
