//! Rendered manifest processing
//!
//! Turns the renderer output (template path -> text) into:
//! - hooks, extracted from annotated documents
//! - ordinary manifests, sorted in install order
//! - the notes document
//!
//! and joins manifests back into the single text stored on a release.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::hook::{Hook, HookDeletePolicy, HookEvent, HookOutputLogPolicy};

/// Hook annotation keys, rudder first, Helm for compatibility
pub mod keys {
    pub const HOOK: [&str; 2] = ["rudder.io/hook", "helm.sh/hook"];
    pub const HOOK_WEIGHT: [&str; 2] = ["rudder.io/hook-weight", "helm.sh/hook-weight"];
    pub const HOOK_DELETE_POLICY: [&str; 2] =
        ["rudder.io/hook-delete-policy", "helm.sh/hook-delete-policy"];
    pub const HOOK_OUTPUT_LOG_POLICY: [&str; 2] = [
        "rudder.io/hook-output-log-policy",
        "helm.sh/hook-output-log-policy",
    ];
}

/// File name suffix of the notes template
pub const NOTES_SUFFIX: &str = "NOTES.txt";

/// One ordinary manifest document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Template path the document came from
    pub path: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Document text without separators
    pub content: String,
}

/// Result of sorting rendered templates
#[derive(Debug, Clone, Default)]
pub struct SortedManifests {
    pub hooks: Vec<Hook>,
    /// In install order
    pub manifests: Vec<Manifest>,
    pub notes: Option<String>,
}

/// Install order category
///
/// Resources are created from lowest to highest value and deleted in
/// reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstallOrder {
    Namespace = 0,
    /// ResourceQuota, LimitRange, PodSecurityPolicy, NetworkPolicy
    NamespaceConfig = 1,
    Crd = 2,
    /// ClusterRole, ClusterRoleBinding
    ClusterRbac = 10,
    /// Role, RoleBinding, ServiceAccount
    NamespacedRbac = 11,
    /// ConfigMap, Secret
    Config = 20,
    /// PersistentVolume, PersistentVolumeClaim, StorageClass
    Storage = 21,
    /// Service, Endpoints, Ingress
    Network = 30,
    /// Deployment, StatefulSet, DaemonSet, ReplicaSet, Pod
    Workload = 40,
    /// Job, CronJob
    Batch = 50,
    /// HorizontalPodAutoscaler, PodDisruptionBudget
    Autoscaling = 60,
    /// Instances of custom resource definitions
    CustomResource = 70,
    Other = 100,
}

impl InstallOrder {
    /// Categorize a resource by its kind and apiVersion
    pub fn of(kind: &str, api_version: &str) -> Self {
        match kind {
            "Namespace" => Self::Namespace,
            "ResourceQuota" | "LimitRange" | "PodSecurityPolicy" | "NetworkPolicy" => {
                Self::NamespaceConfig
            }
            "CustomResourceDefinition" => Self::Crd,
            "ClusterRole" | "ClusterRoleBinding" | "ClusterRoleList" | "ClusterRoleBindingList" => {
                Self::ClusterRbac
            }
            "Role" | "RoleBinding" | "ServiceAccount" | "RoleList" | "RoleBindingList" => {
                Self::NamespacedRbac
            }
            "ConfigMap" | "Secret" => Self::Config,
            "PersistentVolume" | "PersistentVolumeClaim" | "StorageClass" => Self::Storage,
            "Service" | "Endpoints" | "Ingress" | "IngressClass" => Self::Network,
            "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "ReplicationController"
            | "Pod" => Self::Workload,
            "Job" | "CronJob" => Self::Batch,
            "HorizontalPodAutoscaler" | "PodDisruptionBudget" => Self::Autoscaling,
            _ if is_custom_api_version(api_version) => Self::CustomResource,
            _ => Self::Other,
        }
    }
}

/// Check if an apiVersion belongs to a non built-in API group
pub fn is_custom_api_version(api_version: &str) -> bool {
    const BUILTIN_GROUPS: &[&str] = &[
        "apps",
        "batch",
        "autoscaling",
        "policy",
        "networking.k8s.io",
        "rbac.authorization.k8s.io",
        "storage.k8s.io",
        "admissionregistration.k8s.io",
        "apiextensions.k8s.io",
        "apiregistration.k8s.io",
        "certificates.k8s.io",
        "coordination.k8s.io",
        "discovery.k8s.io",
        "events.k8s.io",
        "flowcontrol.apiserver.k8s.io",
        "node.k8s.io",
        "scheduling.k8s.io",
    ];

    match api_version.split_once('/') {
        Some((group, _)) => !BUILTIN_GROUPS.contains(&group),
        // Core group: "v1"
        None => false,
    }
}

/// Split a multi-document YAML stream
///
/// Empty and comment-only documents are dropped.
pub fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed.starts_with("--- ") {
            push_document(&mut docs, &mut current);
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    push_document(&mut docs, &mut current);
    docs
}

fn push_document(docs: &mut Vec<String>, current: &mut String) {
    let doc = std::mem::take(current);
    let has_content = doc.lines().any(|l| {
        let l = l.trim();
        !l.is_empty() && !l.starts_with('#')
    });
    if has_content {
        docs.push(doc.trim_end().to_string());
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentHead {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: HeadMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct HeadMetadata {
    #[serde(default)]
    name: String,
    // Unquoted numbers are common in hand-written charts
    #[serde(default)]
    annotations: BTreeMap<String, serde_yaml::Value>,
}

impl DocumentHead {
    fn annotation(&self, keys: &[&str]) -> Option<String> {
        let value = keys
            .iter()
            .find_map(|k| self.metadata.annotations.get(*k))?;
        match value {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Split rendered templates into hooks, ordered manifests and notes
///
/// Templates are visited in path order. Unknown hook events and policies
/// are skipped with a warning; an unparsable weight counts as 0.
pub fn sort_manifests(rendered: &BTreeMap<String, String>) -> Result<SortedManifests> {
    let mut sorted = SortedManifests::default();

    for (path, text) in rendered {
        if path.ends_with(NOTES_SUFFIX) {
            let notes = text.trim();
            if !notes.is_empty() {
                sorted.notes = Some(notes.to_string());
            }
            continue;
        }

        for content in split_documents(text) {
            let head: DocumentHead =
                serde_yaml::from_str(&content).map_err(|e| CoreError::InvalidManifest {
                    path: path.clone(),
                    message: e.to_string(),
                })?;

            if head.kind.is_empty() {
                return Err(CoreError::InvalidManifest {
                    path: path.clone(),
                    message: "kind is not set".to_string(),
                });
            }
            if head.api_version.is_empty() {
                return Err(CoreError::InvalidManifest {
                    path: path.clone(),
                    message: "apiVersion is not set".to_string(),
                });
            }

            match head.annotation(&keys::HOOK) {
                Some(events) => sorted.hooks.push(parse_hook(path, &head, &events, content)?),
                None => sorted.manifests.push(Manifest {
                    path: path.clone(),
                    api_version: head.api_version,
                    kind: head.kind,
                    name: head.metadata.name,
                    content,
                }),
            }
        }
    }

    sort_by_install_order(&mut sorted.manifests);
    Ok(sorted)
}

fn parse_hook(path: &str, head: &DocumentHead, events: &str, content: String) -> Result<Hook> {
    if head.metadata.name.is_empty() {
        return Err(CoreError::InvalidHook {
            path: path.to_string(),
            message: "hook resources must have metadata.name".to_string(),
        });
    }

    let mut hook = Hook::new(
        head.metadata.name.clone(),
        head.kind.clone(),
        path,
        content,
        Vec::new(),
    );

    for event in events.split(',').filter(|e| !e.trim().is_empty()) {
        match event.parse::<HookEvent>() {
            Ok(event) if !hook.events.contains(&event) => hook.events.push(event),
            Ok(_) => {}
            Err(e) => tracing::warn!(path, hook = %hook.name, "{}", e),
        }
    }

    if let Some(weight) = head.annotation(&keys::HOOK_WEIGHT) {
        hook.weight = weight.trim().parse().unwrap_or(0);
    }

    if let Some(policies) = head.annotation(&keys::HOOK_DELETE_POLICY) {
        for policy in policies.split(',').filter(|p| !p.trim().is_empty()) {
            match policy.parse::<HookDeletePolicy>() {
                Ok(p) => hook = hook.with_delete_policy(p),
                Err(e) => tracing::warn!(path, hook = %hook.name, "{}", e),
            }
        }
    }

    if let Some(policies) = head.annotation(&keys::HOOK_OUTPUT_LOG_POLICY) {
        for policy in policies.split(',').filter(|p| !p.trim().is_empty()) {
            match policy.parse::<HookOutputLogPolicy>() {
                Ok(p) => hook = hook.with_output_log_policy(p),
                Err(e) => tracing::warn!(path, hook = %hook.name, "{}", e),
            }
        }
    }

    Ok(hook)
}

/// Stable sort in install order; unknown kinds sort by kind name
pub fn sort_by_install_order(manifests: &mut [Manifest]) {
    manifests.sort_by(|a, b| {
        let oa = InstallOrder::of(&a.kind, &a.api_version);
        let ob = InstallOrder::of(&b.kind, &b.api_version);
        oa.cmp(&ob).then_with(|| {
            if matches!(oa, InstallOrder::Other | InstallOrder::CustomResource) {
                a.kind.cmp(&b.kind)
            } else {
                std::cmp::Ordering::Equal
            }
        })
    });
}

/// Join manifests into the release manifest text
pub fn join_manifests(manifests: &[Manifest]) -> String {
    let mut out = String::new();
    for m in manifests {
        out.push_str("---\n# Source: ");
        out.push_str(&m.path);
        out.push('\n');
        out.push_str(&m.content);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_split_documents_skips_empty_and_comments() {
        let text = "---\n# just a comment\n---\napiVersion: v1\nkind: ConfigMap\n---\n\n---\nkind: Secret\n";
        let docs = split_documents(text);
        assert_eq!(docs.len(), 2);
        assert!(docs[0].contains("ConfigMap"));
        assert!(docs[1].contains("Secret"));
    }

    #[test]
    fn test_split_documents_no_leading_separator() {
        let docs = split_documents("kind: A\n---\nkind: B");
        assert_eq!(docs, vec!["kind: A".to_string(), "kind: B".to_string()]);
    }

    #[test]
    fn test_install_order() {
        assert!(InstallOrder::Namespace < InstallOrder::Crd);
        assert!(InstallOrder::Crd < InstallOrder::ClusterRbac);
        assert!(InstallOrder::Config < InstallOrder::Workload);
        assert!(InstallOrder::Workload < InstallOrder::CustomResource);
        assert_eq!(
            InstallOrder::of("Certificate", "cert-manager.io/v1"),
            InstallOrder::CustomResource
        );
        assert_eq!(InstallOrder::of("Widget", "v1"), InstallOrder::Other);
    }

    #[test]
    fn test_is_custom_api_version() {
        assert!(!is_custom_api_version("v1"));
        assert!(!is_custom_api_version("apps/v1"));
        assert!(!is_custom_api_version("apiextensions.k8s.io/v1"));
        assert!(is_custom_api_version("example.com/v1alpha1"));
    }

    #[test]
    fn test_sort_manifests_orders_by_kind() {
        let input = rendered(&[
            (
                "hello/templates/deploy.yaml",
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n",
            ),
            (
                "hello/templates/cm.yaml",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n",
            ),
            (
                "hello/templates/ns.yaml",
                "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team\n",
            ),
        ]);

        let sorted = sort_manifests(&input).unwrap();
        let kinds: Vec<&str> = sorted.manifests.iter().map(|m| m.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Namespace", "ConfigMap", "Deployment"]);
        assert!(sorted.hooks.is_empty());
    }

    #[test]
    fn test_sort_manifests_extracts_hooks() {
        let input = rendered(&[(
            "hello/templates/job.yaml",
            r#"apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  annotations:
    helm.sh/hook: pre-install, pre-upgrade, bogus
    helm.sh/hook-weight: "-5"
    helm.sh/hook-delete-policy: hook-succeeded,hook-failed
    rudder.io/hook-output-log-policy: hook-failed
"#,
        )]);

        let sorted = sort_manifests(&input).unwrap();
        assert!(sorted.manifests.is_empty());
        let hook = &sorted.hooks[0];
        assert_eq!(hook.name, "migrate");
        assert_eq!(hook.kind, "Job");
        assert_eq!(hook.events, vec![HookEvent::PreInstall, HookEvent::PreUpgrade]);
        assert_eq!(hook.weight, -5);
        assert!(hook.has_delete_policy(HookDeletePolicy::HookSucceeded));
        assert!(hook.has_delete_policy(HookDeletePolicy::HookFailed));
        assert!(!hook.has_delete_policy(HookDeletePolicy::BeforeHookCreation));
        assert!(hook.has_output_log_policy(HookOutputLogPolicy::HookFailed));
    }

    #[test]
    fn test_sort_manifests_bad_weight_defaults_to_zero() {
        let input = rendered(&[(
            "t/hook.yaml",
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n  annotations:\n    rudder.io/hook: test\n    rudder.io/hook-weight: heavy\n",
        )]);
        let sorted = sort_manifests(&input).unwrap();
        assert_eq!(sorted.hooks[0].weight, 0);
    }

    #[test]
    fn test_sort_manifests_notes_excluded() {
        let input = rendered(&[
            ("hello/templates/NOTES.txt", "Thanks for installing\n"),
            (
                "hello/templates/cm.yaml",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n",
            ),
        ]);
        let sorted = sort_manifests(&input).unwrap();
        assert_eq!(sorted.notes.as_deref(), Some("Thanks for installing"));
        assert_eq!(sorted.manifests.len(), 1);
    }

    #[test]
    fn test_sort_manifests_missing_kind() {
        let input = rendered(&[("t/bad.yaml", "apiVersion: v1\nmetadata:\n  name: x\n")]);
        assert!(matches!(
            sort_manifests(&input),
            Err(CoreError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_join_manifests() {
        let manifests = vec![Manifest {
            path: "hello/templates/cm.yaml".into(),
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "cfg".into(),
            content: "apiVersion: v1\nkind: ConfigMap".into(),
        }];
        let joined = join_manifests(&manifests);
        assert_eq!(
            joined,
            "---\n# Source: hello/templates/cm.yaml\napiVersion: v1\nkind: ConfigMap\n"
        );
        assert_eq!(split_documents(&joined).len(), 1);
    }
}
