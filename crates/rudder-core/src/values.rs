//! Release configuration values
//!
//! Full values coalescing is the renderer's business. The engine only needs
//! enough to persist what the user supplied and to implement the upgrade
//! reuse/reset rules.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{CoreError, Result};

/// User-supplied values, stored as JSON
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Default for Values {
    fn default() -> Self {
        Self::new()
    }
}

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Parse values from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Ok(Self(normalize(value)))
    }

    /// Parse values from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Ok(Self(normalize(value)))
    }

    /// Deep merge `overlay` into these values
    ///
    /// Objects merge recursively; scalars and arrays from the overlay win.
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Values for an upgrade, given the previous revision's config
    ///
    /// - `reset`: only the new overrides are kept
    /// - `reuse`: previous config with the new overrides merged on top
    /// - neither: the new overrides, or the previous config when none were given
    pub fn for_upgrade(previous: &Values, overrides: &Values, reuse: bool, reset: bool) -> Values {
        if reset {
            return overrides.clone();
        }
        if reuse {
            let mut merged = previous.clone();
            merged.merge(overrides);
            return merged;
        }
        if overrides.is_empty() {
            previous.clone()
        } else {
            overrides.clone()
        }
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) -> Result<()> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(CoreError::Values {
                message: format!("invalid values path '{}'", path),
            });
        }
        let mut cursor = &mut self.0;
        for segment in path.split('.') {
            if !cursor.is_object() {
                *cursor = JsonValue::Object(serde_json::Map::new());
            }
            cursor = match cursor {
                JsonValue::Object(map) => map.entry(segment.to_string()).or_insert(JsonValue::Null),
                _ => {
                    return Err(CoreError::Values {
                        message: format!("cannot descend into '{}'", segment),
                    });
                }
            };
        }
        *cursor = value;
        Ok(())
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        path.split('.')
            .try_fold(&self.0, |value, segment| value.as_object()?.get(segment))
    }

    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }
}

// An empty YAML document parses as null.
fn normalize(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
        other => other,
    }
}

fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge() {
        let mut base = Values::from_yaml(
            r#"
image:
  repository: nginx
  tag: "1.0"
replicas: 1
"#,
        )
        .unwrap();

        let overlay = Values::from_yaml(
            r#"
image:
  tag: "2.0"
replicas: 3
"#,
        )
        .unwrap();

        base.merge(&overlay);

        assert_eq!(base.get("image.repository").unwrap(), "nginx");
        assert_eq!(base.get("image.tag").unwrap(), "2.0");
        assert_eq!(base.get("replicas").unwrap(), 3);
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut values = Values::new();
        values.set("image.tag", json!("v1")).unwrap();
        values.set("replicas", json!(3)).unwrap();

        assert_eq!(values.get("image.tag").unwrap(), "v1");
        assert_eq!(values.get("replicas").unwrap(), 3);
        assert!(values.set("a..b", json!(1)).is_err());
    }

    #[test]
    fn test_empty_yaml_is_empty_values() {
        let values = Values::from_yaml("").unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_for_upgrade_reuse_and_reset() {
        let previous = Values(json!({"a": 1, "b": {"c": 2}}));
        let overrides = Values(json!({"b": {"d": 3}}));

        let reused = Values::for_upgrade(&previous, &overrides, true, false);
        assert_eq!(reused.0, json!({"a": 1, "b": {"c": 2, "d": 3}}));

        let reset = Values::for_upgrade(&previous, &overrides, true, true);
        assert_eq!(reset.0, json!({"b": {"d": 3}}));

        let plain = Values::for_upgrade(&previous, &overrides, false, false);
        assert_eq!(plain.0, json!({"b": {"d": 3}}));

        let kept = Values::for_upgrade(&previous, &Values::new(), false, false);
        assert_eq!(kept, previous);
    }
}
