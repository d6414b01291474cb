//! Three-way JSON merge patch (RFC 7386)

use serde_json::{Map, Value};

use super::drop_empty_objects;
use crate::error::{KubeError, Result};

/// Fields a merge patch must never touch
const PRECONDITIONS: [(&str, &str); 3] = [
    ("/apiVersion", "apiVersion"),
    ("/kind", "kind"),
    ("/metadata/name", "metadata.name"),
];

/// Two-way merge patch turning `from` into `to`
pub fn create(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from_map), Value::Object(to_map)) => {
            let mut patch = Map::new();
            for (key, to_value) in to_map {
                match from_map.get(key) {
                    None => {
                        patch.insert(key.clone(), to_value.clone());
                    }
                    Some(from_value) if from_value == to_value => {}
                    Some(from_value) => {
                        let sub = if from_value.is_object() && to_value.is_object() {
                            create(from_value, to_value)
                        } else {
                            to_value.clone()
                        };
                        patch.insert(key.clone(), sub);
                    }
                }
            }
            for key in from_map.keys() {
                if !to_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        (_, to) => to.clone(),
    }
}

/// Keep only the deletions (`null` leaves) of a patch
fn deletions_only(patch: Value) -> Value {
    let Value::Object(map) = patch else {
        return Value::Object(Map::new());
    };
    let mut out = Map::new();
    for (key, value) in map {
        match value {
            Value::Null => {
                out.insert(key, Value::Null);
            }
            Value::Object(_) => {
                let sub = deletions_only(value);
                if sub.as_object().is_some_and(|m| !m.is_empty()) {
                    out.insert(key, sub);
                }
            }
            _ => {}
        }
    }
    Value::Object(out)
}

/// Drop the deletions (`null` leaves) of a patch
fn without_deletions(patch: Value) -> Value {
    let Value::Object(map) = patch else {
        return patch;
    };
    let mut out = Map::new();
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::Object(ref m) if !m.is_empty() => {
                let sub = without_deletions(value);
                if sub.as_object().is_some_and(|m| !m.is_empty()) {
                    out.insert(key, sub);
                }
            }
            other => {
                out.insert(key, other);
            }
        }
    }
    Value::Object(out)
}

/// Drop deletions of fields that `live` no longer has
fn prune_absent(deletions: &mut Map<String, Value>, live: &Value) {
    let live_map = live.as_object();
    deletions.retain(|key, value| {
        let live_value = live_map.and_then(|m| m.get(key));
        match value {
            Value::Null => live_value.is_some(),
            Value::Object(sub) => match live_value {
                Some(lv @ Value::Object(_)) => {
                    prune_absent(sub, lv);
                    !sub.is_empty()
                }
                _ => false,
            },
            _ => true,
        }
    });
}

/// Combine two merge patches, `overlay` winning
fn combine(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = value.is_object() && base_map.get(&key).is_some_and(Value::is_object);
                match base_map.get_mut(&key) {
                    Some(existing) if nested => combine(existing, value),
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Three-way JSON merge patch
///
/// Fails with `PreconditionFailed` if the patch would change `apiVersion`,
/// `kind` or `metadata.name`.
pub fn three_way(original: &Value, modified: &Value, live: &Value, resource: &str) -> Result<Value> {
    let mut deletions = deletions_only(create(original, modified));
    if let Value::Object(map) = &mut deletions {
        prune_absent(map, live);
    }
    let additions = without_deletions(create(live, modified));

    let mut patch = deletions;
    combine(&mut patch, additions);
    if let Value::Object(map) = &mut patch {
        drop_empty_objects(map);
    }

    for (pointer, field) in PRECONDITIONS {
        if patch.pointer(pointer).is_some() {
            return Err(KubeError::PreconditionFailed {
                resource: resource.to_string(),
                field: field.to_string(),
            });
        }
    }
    Ok(patch)
}
