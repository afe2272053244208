//! Generic attribute tree decoded from client output

use crate::normalize::scalar_string;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Decoded resource state: a JSON value, normally a mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeTree(Value);

impl Default for AttributeTree {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

impl From<Value> for AttributeTree {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl AttributeTree {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Top-level field of a mapping
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.get(key).is_some()
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn map(&self, key: &str) -> Option<&Map<String, Value>> {
        self.0.get(key).and_then(Value::as_object)
    }

    /// Elements when the tree is a list
    pub fn items(&self) -> &[Value] {
        self.0.as_array().map(Vec::as_slice).unwrap_or(&[])
    }

    /// A nested mapping flattened to strings; null entries are dropped
    pub fn string_map(&self, key: &str) -> BTreeMap<String, String> {
        self.map(key)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| scalar_string(v).map(|s| (k.clone(), s)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A nested list flattened to strings
    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(scalar_string).collect())
            .unwrap_or_default()
    }

    /// Set a top-level field, turning the tree into a mapping if needed
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        if !self.0.is_object() {
            self.0 = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.0 {
            map.insert(key.into(), value);
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_map_stringifies_scalars() {
        let tree = AttributeTree::new(json!({
            "config": {"limits.cpu": 2, "security.nesting": true, "user.gone": null}
        }));
        let config = tree.string_map("config");
        assert_eq!(config.get("limits.cpu").unwrap(), "2");
        assert_eq!(config.get("security.nesting").unwrap(), "true");
        assert!(!config.contains_key("user.gone"));
    }

    #[test]
    fn test_insert_on_non_mapping() {
        let mut tree = AttributeTree::new(json!([1, 2]));
        tree.insert("name", json!("web"));
        assert_eq!(tree.str_field("name"), Some("web"));
    }

    #[test]
    fn test_items_of_mapping_is_empty() {
        assert!(AttributeTree::default().items().is_empty());
    }
}
