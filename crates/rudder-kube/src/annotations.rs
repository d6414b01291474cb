//! Annotations and labels written to, or read from, cluster objects
//!
//! Both `rudder.io/*` and `helm.sh/*` resource policies are honored so
//! charts written for Helm keep their semantics.

use std::collections::BTreeMap;

use kube::api::DynamicObject;

/// Rudder-native annotations
pub mod rudder {
    /// Resource policy (`keep` survives uninstall and upgrade removal)
    pub const RESOURCE_POLICY: &str = "rudder.io/resource-policy";
    /// Owning release name
    pub const RELEASE_NAME: &str = "rudder.io/release-name";
    /// Owning release namespace
    pub const RELEASE_NAMESPACE: &str = "rudder.io/release-namespace";
}

/// Helm-compatible annotations
pub mod helm {
    pub const RESOURCE_POLICY: &str = "helm.sh/resource-policy";
}

/// Standard `app.kubernetes.io/managed-by` label
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the resource policy that keeps a resource
pub const KEEP_POLICY: &str = "keep";

/// Get annotation value, preferring rudder over Helm
pub fn get_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    rudder_key: &str,
    helm_key: &str,
) -> Option<&'a str> {
    annotations
        .get(rudder_key)
        .or_else(|| annotations.get(helm_key))
        .map(|s| s.as_str())
}

/// Check the resource policy annotation for `keep`
pub fn has_keep_policy(annotations: &BTreeMap<String, String>) -> bool {
    get_annotation(annotations, rudder::RESOURCE_POLICY, helm::RESOURCE_POLICY)
        .map(|v| v.trim().eq_ignore_ascii_case(KEEP_POLICY))
        .unwrap_or(false)
}

/// Stamp release ownership onto an object
pub fn set_owner(obj: &mut DynamicObject, release: &str, namespace: &str, manager: &str) {
    let annotations = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(rudder::RELEASE_NAME.to_string(), release.to_string());
    annotations.insert(rudder::RELEASE_NAMESPACE.to_string(), namespace.to_string());

    let labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(MANAGED_BY_LABEL.to_string(), manager.to_string());
}

/// Check that a live object belongs to `release`
///
/// Returns the reason when it does not.
pub fn check_owner(
    live: &DynamicObject,
    release: &str,
    namespace: &str,
    manager: &str,
) -> Result<(), String> {
    let empty = BTreeMap::new();
    let annotations = live.metadata.annotations.as_ref().unwrap_or(&empty);
    let labels = live.metadata.labels.as_ref().unwrap_or(&empty);

    let expect = |map: &BTreeMap<String, String>, key: &str, want: &str| -> Result<(), String> {
        match map.get(key) {
            Some(v) if v == want => Ok(()),
            Some(v) => Err(format!("{} must equal \"{}\": current value is \"{}\"", key, want, v)),
            None => Err(format!("missing key \"{}\": must be set to \"{}\"", key, want)),
        }
    };

    expect(labels, MANAGED_BY_LABEL, manager)?;
    expect(annotations, rudder::RELEASE_NAME, release)?;
    expect(annotations, rudder::RELEASE_NAMESPACE, namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ApiResource;
    use kube::core::GroupVersionKind;

    fn object() -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        DynamicObject::new("cfg", &ar)
    }

    #[test]
    fn test_keep_policy() {
        let mut a = BTreeMap::new();
        assert!(!has_keep_policy(&a));

        a.insert(helm::RESOURCE_POLICY.to_string(), "keep".to_string());
        assert!(has_keep_policy(&a));

        // rudder key wins over helm
        a.insert(rudder::RESOURCE_POLICY.to_string(), "delete".to_string());
        assert!(!has_keep_policy(&a));
    }

    #[test]
    fn test_owner_roundtrip() {
        let mut obj = object();
        assert!(check_owner(&obj, "r1", "default", "rudder").is_err());

        set_owner(&mut obj, "r1", "default", "rudder");
        assert!(check_owner(&obj, "r1", "default", "rudder").is_ok());

        let err = check_owner(&obj, "r2", "default", "rudder").unwrap_err();
        assert!(err.contains("rudder.io/release-name"));
    }
}
