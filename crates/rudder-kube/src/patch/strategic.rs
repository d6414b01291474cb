//! Three-way strategic merge patch
//!
//! Maps merge key by key and `null` deletes a key. Lists with a known
//! merge key merge item by item, and `{"<key>": .., "$patch": "delete"}`
//! removes an item. Other lists are replaced wholesale.

use serde_json::{Map, Value};

use super::drop_empty_objects;

const PATCH_DIRECTIVE: &str = "$patch";
const DELETE_DIRECTIVE: &str = "delete";

/// Merge key of a list field, if every item carries it
fn merge_key(field: &str, a: &[Value], b: &[Value]) -> Option<&'static str> {
    let candidates: &[&'static str] = match field {
        "containers" | "initContainers" | "ephemeralContainers" | "env" | "volumes"
        | "imagePullSecrets" => &["name"],
        "volumeMounts" => &["mountPath"],
        "volumeDevices" => &["devicePath"],
        "ports" => &["containerPort", "port"],
        "conditions" => &["type"],
        "ownerReferences" => &["uid"],
        "hostAliases" => &["ip"],
        "topologySpreadConstraints" => &["topologyKey"],
        _ => return None,
    };
    candidates
        .iter()
        .copied()
        .find(|key| a.iter().chain(b).all(|item| item.get(*key).is_some()))
}

fn is_delete_directive(entry: &Value) -> bool {
    entry.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some(DELETE_DIRECTIVE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Only what `from` has and `to` dropped
    Deletions,
    /// Only what `to` sets differently from `from`
    Additions,
}

fn diff_maps(from: &Map<String, Value>, to: &Map<String, Value>, mode: Mode) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, to_value) in to {
        match from.get(key) {
            None => {
                if mode == Mode::Additions {
                    patch.insert(key.clone(), to_value.clone());
                }
            }
            Some(from_value) if from_value == to_value => {}
            Some(from_value) => match (from_value, to_value) {
                (Value::Object(f), Value::Object(t)) => {
                    let sub = diff_maps(f, t, mode);
                    if !sub.is_empty() {
                        patch.insert(key.clone(), Value::Object(sub));
                    }
                }
                (Value::Array(f), Value::Array(t)) => {
                    if let Some(sub) = diff_lists(key, f, t, mode) {
                        patch.insert(key.clone(), sub);
                    }
                }
                _ => {
                    if mode == Mode::Additions {
                        patch.insert(key.clone(), to_value.clone());
                    }
                }
            },
        }
    }

    if mode == Mode::Deletions {
        for key in from.keys() {
            if !to.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
    }
    patch
}

fn diff_lists(field: &str, from: &[Value], to: &[Value], mode: Mode) -> Option<Value> {
    let Some(mk) = merge_key(field, from, to) else {
        return (mode == Mode::Additions).then(|| Value::Array(to.to_vec()));
    };

    let mut entries = Vec::new();
    for item in to {
        let id = &item[mk];
        match from.iter().find(|f| &f[mk] == id) {
            None => {
                if mode == Mode::Additions {
                    entries.push(item.clone());
                }
            }
            Some(f) if f == item => {}
            Some(f) => {
                if let (Value::Object(fm), Value::Object(tm)) = (f, item) {
                    let mut sub = diff_maps(fm, tm, mode);
                    if !sub.is_empty() {
                        sub.insert(mk.to_string(), id.clone());
                        entries.push(Value::Object(sub));
                    }
                }
            }
        }
    }

    if mode == Mode::Deletions {
        for f in from {
            let id = &f[mk];
            if !to.iter().any(|t| &t[mk] == id) {
                let mut entry = Map::new();
                entry.insert(mk.to_string(), id.clone());
                entry.insert(PATCH_DIRECTIVE.to_string(), Value::from(DELETE_DIRECTIVE));
                entries.push(Value::Object(entry));
            }
        }
    }

    (!entries.is_empty()).then_some(Value::Array(entries))
}

/// Drop deletions that target fields or items `live` no longer has
fn prune(patch: &mut Map<String, Value>, live: Option<&Map<String, Value>>) {
    patch.retain(|key, value| {
        let live_value = live.and_then(|m| m.get(key));
        match value {
            Value::Null => live_value.is_some(),
            Value::Object(sub) => match live_value {
                Some(Value::Object(lm)) => {
                    prune(sub, Some(lm));
                    !sub.is_empty()
                }
                _ => false,
            },
            Value::Array(items) => match live_value {
                Some(Value::Array(live_items)) => {
                    prune_list(key, items, live_items);
                    !items.is_empty()
                }
                _ => false,
            },
            _ => true,
        }
    });
}

fn prune_list(field: &str, entries: &mut Vec<Value>, live: &[Value]) {
    let Some(mk) = merge_key(field, entries, live) else {
        return;
    };
    entries.retain_mut(|entry| {
        let id = entry.get(mk).cloned();
        let Some(live_item) = live.iter().find(|l| l.get(mk) == id.as_ref()) else {
            return false;
        };
        if is_delete_directive(entry) {
            return true;
        }
        match (entry, live_item) {
            (Value::Object(em), Value::Object(lm)) => {
                prune(em, Some(lm));
                em.len() > 1
            }
            _ => true,
        }
    });
}

/// Combine two strategic patches, `overlay` winning
fn combine(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        let merged = match (base.remove(&key), value) {
            (Some(Value::Object(mut b)), Value::Object(o)) => {
                combine(&mut b, o);
                Value::Object(b)
            }
            (Some(Value::Array(b)), Value::Array(o)) => combine_lists(&key, b, o),
            (_, v) => v,
        };
        base.insert(key, merged);
    }
}

fn combine_lists(field: &str, mut base: Vec<Value>, overlay: Vec<Value>) -> Value {
    let Some(mk) = merge_key(field, &base, &overlay) else {
        return Value::Array(overlay);
    };
    for entry in overlay {
        let pos = base.iter().position(|b| b.get(mk) == entry.get(mk));
        match (pos, entry) {
            (Some(i), Value::Object(o)) => {
                if let Value::Object(b) = &mut base[i] {
                    combine(b, o);
                }
            }
            (_, entry) => base.push(entry),
        }
    }
    Value::Array(base)
}

/// Three-way strategic merge patch
pub fn three_way(original: &Value, modified: &Value, live: &Value) -> Value {
    let Some(modified_map) = modified.as_object() else {
        return modified.clone();
    };
    let empty = Map::new();
    let original_map = original.as_object().unwrap_or(&empty);
    let live_map = live.as_object();

    let mut patch = diff_maps(original_map, modified_map, Mode::Deletions);
    prune(&mut patch, live_map);

    let additions = diff_maps(live_map.unwrap_or(&empty), modified_map, Mode::Additions);
    combine(&mut patch, additions);
    drop_empty_objects(&mut patch);

    Value::Object(patch)
}

/// Apply a strategic merge patch
pub fn apply(doc: &mut Value, patch: &Value) {
    match (doc.as_object_mut(), patch.as_object()) {
        (Some(target), Some(p)) => apply_map(target, p),
        _ => *doc = patch.clone(),
    }
}

fn apply_map(doc: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, pv) in patch {
        match pv {
            Value::Null => {
                doc.remove(key);
            }
            Value::Object(pm) => {
                let mut target = match doc.remove(key) {
                    Some(Value::Object(m)) => m,
                    _ => Map::new(),
                };
                apply_map(&mut target, pm);
                doc.insert(key.clone(), Value::Object(target));
            }
            Value::Array(items) => {
                let merged = match doc.remove(key) {
                    Some(Value::Array(existing)) => apply_list(key, existing, items),
                    _ => Value::Array(
                        items
                            .iter()
                            .filter(|i| !is_delete_directive(i))
                            .cloned()
                            .collect(),
                    ),
                };
                doc.insert(key.clone(), merged);
            }
            other => {
                doc.insert(key.clone(), other.clone());
            }
        }
    }
}

fn apply_list(field: &str, mut existing: Vec<Value>, patch: &[Value]) -> Value {
    let Some(mk) = merge_key(field, &existing, patch) else {
        return Value::Array(patch.to_vec());
    };
    for entry in patch {
        let pos = existing.iter().position(|e| e.get(mk) == entry.get(mk));
        if is_delete_directive(entry) {
            if let Some(i) = pos {
                existing.remove(i);
            }
            continue;
        }
        match (pos, entry) {
            (Some(i), Value::Object(em)) => {
                if let Value::Object(target) = &mut existing[i] {
                    apply_map(target, em);
                }
            }
            _ => existing.push(entry.clone()),
        }
    }
    Value::Array(existing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(containers: Value, labels: Value) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "labels": labels},
            "spec": {"template": {"spec": {"containers": containers}}}
        })
    }

    #[test]
    fn test_image_change_keyed_by_name() {
        let original = deployment(json!([{"name": "app", "image": "nginx:1"}]), json!({"a": "1"}));
        let modified = deployment(json!([{"name": "app", "image": "nginx:2"}]), json!({"a": "1"}));
        let live = original.clone();

        let patch = three_way(&original, &modified, &live);
        assert_eq!(
            patch,
            json!({"spec": {"template": {"spec": {"containers": [{"name": "app", "image": "nginx:2"}]}}}})
        );
    }

    #[test]
    fn test_removed_container_uses_delete_directive() {
        let original = deployment(
            json!([{"name": "app", "image": "a"}, {"name": "sidecar", "image": "s"}]),
            json!({}),
        );
        let modified = deployment(json!([{"name": "app", "image": "a"}]), json!({}));
        let live = original.clone();

        let patch = three_way(&original, &modified, &live);
        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"],
            json!([{"name": "sidecar", "$patch": "delete"}])
        );

        let mut applied = live.clone();
        apply(&mut applied, &patch);
        assert_eq!(applied, modified);
    }

    #[test]
    fn test_removed_label_and_out_of_band_label() {
        let original = deployment(json!([]), json!({"a": "1", "b": "2"}));
        let modified = deployment(json!([]), json!({"a": "1"}));
        let live = deployment(json!([]), json!({"a": "1", "b": "2", "injected": "x"}));

        let patch = three_way(&original, &modified, &live);
        assert_eq!(patch, json!({"metadata": {"labels": {"b": null}}}));

        let mut applied = live.clone();
        apply(&mut applied, &patch);
        assert_eq!(applied["metadata"]["labels"], json!({"a": "1", "injected": "x"}));
    }

    #[test]
    fn test_server_added_fields_are_kept() {
        let original = deployment(json!([{"name": "app", "image": "a"}]), json!({}));
        let modified = original.clone();
        let mut live = original.clone();
        live["spec"]["template"]["spec"]["containers"][0]["terminationMessagePath"] =
            json!("/dev/termination-log");
        live["status"] = json!({"replicas": 1});

        assert_eq!(three_way(&original, &modified, &live), json!({}));
    }

    #[test]
    fn test_idempotent_after_apply() {
        let original = deployment(
            json!([{"name": "app", "image": "a", "env": [{"name": "X", "value": "1"}]}]),
            json!({"a": "1", "gone": "x"}),
        );
        let modified = deployment(
            json!([{"name": "app", "image": "b", "env": [{"name": "Y", "value": "2"}]}]),
            json!({"a": "1"}),
        );
        let mut live = original.clone();

        let first = three_way(&original, &modified, &live);
        apply(&mut live, &first);
        assert_eq!(live, modified);

        let second = three_way(&original, &modified, &live);
        assert_eq!(second, json!({}));
    }

    #[test]
    fn test_unkeyed_list_replaced() {
        let original = json!({"spec": {"args": ["a", "b"]}});
        let modified = json!({"spec": {"args": ["c"]}});
        let patch = three_way(&original, &modified, &original);
        assert_eq!(patch, json!({"spec": {"args": ["c"]}}));
    }

    #[test]
    fn test_service_ports_keyed_by_port() {
        let original = json!({"spec": {"ports": [{"port": 80, "name": "http"}, {"port": 443, "name": "https"}]}});
        let modified = json!({"spec": {"ports": [{"port": 80, "name": "http"}]}});
        let patch = three_way(&original, &modified, &original);
        assert_eq!(patch, json!({"spec": {"ports": [{"port": 443, "$patch": "delete"}]}}));
    }
}
