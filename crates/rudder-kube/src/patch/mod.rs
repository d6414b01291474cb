//! Three-way patch computation
//!
//! Every update compares three documents:
//! - `original`: the last applied desired state (from the current release)
//! - `modified`: the new desired state
//! - `live`: the object as freshly fetched from the cluster
//!
//! Fields removed between `original` and `modified` are deleted, and
//! fields of `modified` that differ from `live` are set. Deletions of
//! fields already absent from `live` are dropped, so re-applying the same
//! pair against an up-to-date object produces `{}`.

pub mod merge;
pub mod strategic;

use serde_json::Value;

use crate::error::Result;

/// How a resource is patched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchStrategy {
    /// Strategic merge patch, for built-in kinds
    StrategicMerge,
    /// RFC 7386 JSON merge patch, for custom and schema-less kinds
    JsonMerge,
    /// Full object replacement
    Replace,
}

impl std::fmt::Display for PatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PatchStrategy::StrategicMerge => "strategic-merge",
            PatchStrategy::JsonMerge => "json-merge",
            PatchStrategy::Replace => "replace",
        };
        write!(f, "{}", s)
    }
}

/// A patch ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedPatch {
    pub strategy: PatchStrategy,
    pub body: Value,
}

impl ComputedPatch {
    /// `{}` patches are not sent
    pub fn is_empty(&self) -> bool {
        match &self.body {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }
}

/// Compute the patch from `original` to `modified` against `live`
///
/// `resource` names the object in precondition errors.
pub fn three_way(
    strategy: PatchStrategy,
    original: &Value,
    modified: &Value,
    live: &Value,
    resource: &str,
) -> Result<ComputedPatch> {
    let body = match strategy {
        PatchStrategy::StrategicMerge => strategic::three_way(original, modified, live),
        PatchStrategy::JsonMerge => merge::three_way(original, modified, live, resource)?,
        PatchStrategy::Replace => modified.clone(),
    };
    Ok(ComputedPatch { strategy, body })
}

/// Apply a computed patch to a document
pub fn apply(doc: &mut Value, patch: &ComputedPatch) {
    match patch.strategy {
        PatchStrategy::StrategicMerge => strategic::apply(doc, &patch.body),
        PatchStrategy::JsonMerge => json_patch::merge(doc, &patch.body),
        PatchStrategy::Replace => *doc = patch.body.clone(),
    }
}

/// Remove empty objects left behind by pruning
pub(crate) fn drop_empty_objects(map: &mut serde_json::Map<String, Value>) {
    map.retain(|_, v| !matches!(v, Value::Object(m) if m.is_empty()));
}
