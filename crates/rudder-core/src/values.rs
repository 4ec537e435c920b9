//! Values handling with deep merge support

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;

/// Values container with deep merge capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Parse values from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::new());
        }
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Ok(Self(value))
    }

    /// Parse values from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Ok(Self(value))
    }

    /// Deep merge another Values into this one
    ///
    /// Rules:
    /// - Scalars: overlay replaces base
    /// - Objects: recursive merge
    /// - Arrays: overlay replaces base (not appended)
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) {
        let parts: Vec<&str> = path.split('.').collect();
        set_nested(&mut self.0, &parts, value);
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let parts: Vec<&str> = path.split('.').collect();
        get_nested(&self.0, &parts)
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Scope values for a sub-chart
    ///
    /// A sub-chart sees the values under `<name>.*` of its parent as its own
    /// root values, plus the parent's `global` block as-is.
    pub fn scope_for_subchart(&self, subchart_name: &str) -> Values {
        let mut scoped = serde_json::Map::new();

        if let JsonValue::Object(parent_obj) = &self.0 {
            if let Some(global) = parent_obj.get("global") {
                scoped.insert("global".to_string(), global.clone());
            }

            if let Some(JsonValue::Object(subchart_obj)) = parent_obj.get(subchart_name) {
                for (k, v) in subchart_obj {
                    scoped.insert(k.clone(), v.clone());
                }
            }
        }

        Values(JsonValue::Object(scoped))
    }

    /// Resolve the effective values of a sub-chart: its own defaults with the
    /// scoped parent values merged on top.
    pub fn for_subchart(subchart_defaults: &Values, parent: &Values, subchart_name: &str) -> Values {
        let mut result = subchart_defaults.clone();
        result.merge(&parent.scope_for_subchart(subchart_name));
        result
    }
}

/// Deep merge two JSON values
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

fn set_nested(value: &mut JsonValue, path: &[&str], new_value: JsonValue) {
    let Some((key, remaining)) = path.split_first() else {
        *value = new_value;
        return;
    };

    if !value.is_object() {
        *value = JsonValue::Object(serde_json::Map::new());
    }

    if let JsonValue::Object(map) = value {
        if remaining.is_empty() {
            map.insert(key.to_string(), new_value);
        } else {
            let entry = map
                .entry(key.to_string())
                .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
            set_nested(entry, remaining, new_value);
        }
    }
}

fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let Some((key, remaining)) = path.split_first() else {
        return Some(value);
    };

    match value {
        JsonValue::Object(map) => map.get(*key).and_then(|v| get_nested(v, remaining)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_objects() {
        let mut base = Values::from_yaml("image:\n  repository: nginx\n  tag: \"1.0\"\nreplicas: 1").unwrap();
        let overlay = Values::from_yaml("image:\n  tag: \"2.0\"\nreplicas: 3").unwrap();

        base.merge(&overlay);

        assert_eq!(base.get("image.repository"), Some(&json!("nginx")));
        assert_eq!(base.get("image.tag"), Some(&json!("2.0")));
        assert_eq!(base.get("replicas"), Some(&json!(3)));
    }

    #[test]
    fn test_arrays_are_replaced() {
        let mut base = Values(json!({"ports": [80, 443]}));
        base.merge(&Values(json!({"ports": [8080]})));
        assert_eq!(base.get("ports"), Some(&json!([8080])));
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut values = Values::new();
        values.set("service.port", json!(8080));
        assert_eq!(values.get("service.port"), Some(&json!(8080)));
    }

    #[test]
    fn test_empty_yaml_is_empty_values() {
        let values = Values::from_yaml("   \n").unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_subchart_scoping_keeps_globals() {
        let parent = Values(json!({
            "global": {"registry": "docker.io"},
            "redis": {"replicas": 3},
            "postgresql": {"enabled": false}
        }));
        let defaults = Values(json!({"replicas": 1, "port": 6379}));

        let scoped = Values::for_subchart(&defaults, &parent, "redis");

        assert_eq!(scoped.get("global.registry"), Some(&json!("docker.io")));
        assert_eq!(scoped.get("replicas"), Some(&json!(3)));
        assert_eq!(scoped.get("port"), Some(&json!(6379)));
        assert!(scoped.get("postgresql").is_none());
    }
}
