//! Field-level diff between current and desired state
//!
//! A desired tree only mentions the fields the caller manages. Every field
//! is compared according to its [`FieldKind`]:
//!
//! - absent in desired: unmanaged, never touched
//! - `null` inside a config map: unset the key if it exists
//! - `null` device: remove that device (the only way a device is removed)
//! - lists: compared as sets, replaced in bulk on mismatch
//! - structured lists: elements normalized, then compared as sets

use crate::changeset::Change;
use crate::error::{ReconcileError, Result};
use crate::normalize::{NormalizationTable, scalar_string};
use crate::tree::AttributeTree;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Fills defaults and stringifies one structured-list element
pub type ElementNormalizer = fn(&Value) -> Value;

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Top-level scalar such as `description`
    Property,
    /// String-keyed configuration map
    Config,
    /// Device name → {type, attributes}
    Devices,
    /// Unordered list of names (profiles, aliases, groups)
    List,
    /// List of records rewritten as a whole (forward ports, ACL rules)
    Structured(ElementNormalizer),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldRule {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// The managed fields of a resource kind, in diff order
#[derive(Debug, Clone, Copy)]
pub struct FieldPolicy {
    pub fields: &'static [FieldRule],
    pub normalization: NormalizationTable,
}

impl FieldPolicy {
    pub const fn new(fields: &'static [FieldRule], normalization: NormalizationTable) -> Self {
        Self {
            fields,
            normalization,
        }
    }

    pub fn rule(&self, name: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|r| r.name == name)
    }
}

/// Compute the ordered changes converging `current` to `desired`
///
/// Neither tree is modified.
pub fn diff(
    current: &AttributeTree,
    desired: &AttributeTree,
    policy: &FieldPolicy,
) -> Result<Vec<Change>> {
    let mut changes = Vec::new();

    for rule in policy.fields {
        let Some(want) = desired.get(rule.name) else {
            continue;
        };
        match rule.kind {
            FieldKind::Property => {
                diff_property(rule.name, current.get(rule.name), want, &mut changes)
            }
            _ if want.is_null() => {}
            FieldKind::Config => diff_config(
                rule.name,
                current.map(rule.name),
                want,
                &policy.normalization,
                &mut changes,
            )?,
            FieldKind::Devices => {
                diff_devices(rule.name, current.map(rule.name), want, &mut changes)?
            }
            FieldKind::List => diff_list(rule.name, current.get(rule.name), want, &mut changes)?,
            FieldKind::Structured(normalize) => diff_structured(
                rule.name,
                current.get(rule.name),
                want,
                normalize,
                &mut changes,
            )?,
        }
    }

    Ok(changes)
}

fn diff_property(key: &str, current: Option<&Value>, want: &Value, changes: &mut Vec<Change>) {
    let have = current.and_then(scalar_string).unwrap_or_default();
    match scalar_string(want) {
        None if !have.is_empty() => changes.push(Change::UnsetProperty {
            key: key.to_string(),
        }),
        None => {}
        Some(value) if value != have => changes.push(Change::SetProperty {
            key: key.to_string(),
            value,
        }),
        Some(_) => {}
    }
}

fn diff_config(
    field: &str,
    current: Option<&Map<String, Value>>,
    want: &Value,
    table: &NormalizationTable,
    changes: &mut Vec<Change>,
) -> Result<()> {
    let want = expect_mapping(field, want)?;
    let mut unsets = Vec::new();
    let mut sets = Vec::new();

    for (key, value) in sorted(want) {
        let have = current
            .and_then(|c| c.get(key))
            .and_then(|v| table.canonical(key, v));
        match table.canonical(key, value) {
            None => {
                if have.is_some() {
                    unsets.push(Change::unset(key));
                }
            }
            Some(value) => {
                if have.as_deref() != Some(value.as_str()) {
                    sets.push(Change::set(key, value));
                }
            }
        }
    }

    changes.extend(unsets);
    changes.extend(sets);
    Ok(())
}

fn diff_devices(
    field: &str,
    current: Option<&Map<String, Value>>,
    want: &Value,
    changes: &mut Vec<Change>,
) -> Result<()> {
    let want = expect_mapping(field, want)?;
    let mut removals = Vec::new();
    let mut additions = Vec::new();
    let mut updates = Vec::new();

    for (name, spec) in sorted(want) {
        let existing = current.and_then(|c| c.get(name)).and_then(Value::as_object);
        match (spec, existing) {
            (Value::Null, Some(_)) => removals.push(Change::RemoveDevice { name: name.clone() }),
            (Value::Null, None) => {}
            (Value::Object(attrs), Some(have)) => {
                if let (Some(want_type), Some(have_type)) = (
                    attrs.get("type").and_then(scalar_string),
                    have.get("type").and_then(scalar_string),
                ) {
                    if want_type != have_type {
                        tracing::warn!(
                            "Device {} type is immutable ({} -> {}), ignoring",
                            name,
                            have_type,
                            want_type
                        );
                    }
                }
                for (key, value) in sorted(attrs) {
                    if key == "type" {
                        continue;
                    }
                    let have_value = have.get(key).and_then(scalar_string);
                    match scalar_string(value) {
                        None => {
                            if have_value.is_some() {
                                updates.push(Change::UnsetDeviceAttr {
                                    device: name.clone(),
                                    key: key.clone(),
                                });
                            }
                        }
                        Some(value) => {
                            if have_value.as_deref() != Some(value.as_str()) {
                                updates.push(Change::SetDeviceAttr {
                                    device: name.clone(),
                                    key: key.clone(),
                                    value,
                                });
                            }
                        }
                    }
                }
            }
            (Value::Object(attrs), None) => {
                let device_type = attrs.get("type").and_then(scalar_string).ok_or_else(|| {
                    ReconcileError::configuration(format!("device '{}' requires a type", name))
                })?;
                let attrs = attrs
                    .iter()
                    .filter(|(k, _)| k.as_str() != "type")
                    .filter_map(|(k, v)| scalar_string(v).map(|s| (k.clone(), s)))
                    .collect();
                additions.push(Change::AddDevice {
                    name: name.clone(),
                    device_type,
                    attrs,
                });
            }
            (_, _) => {
                return Err(ReconcileError::configuration(format!(
                    "device '{}' must be a mapping",
                    name
                )));
            }
        }
    }

    changes.extend(removals);
    changes.extend(additions);
    changes.extend(updates);
    Ok(())
}

fn diff_list(
    field: &str,
    current: Option<&Value>,
    want: &Value,
    changes: &mut Vec<Change>,
) -> Result<()> {
    let items = want.as_array().ok_or_else(|| {
        ReconcileError::configuration(format!("`{}` must be a list", field))
    })?;

    let mut values = Vec::new();
    for value in items.iter().filter_map(scalar_string) {
        if !values.contains(&value) {
            values.push(value);
        }
    }

    let want_set: BTreeSet<&str> = values.iter().map(String::as_str).collect();
    let have: Vec<String> = current
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(scalar_string).collect())
        .unwrap_or_default();
    let have_set: BTreeSet<&str> = have.iter().map(String::as_str).collect();

    if want_set != have_set {
        changes.push(Change::ReplaceList {
            field: field.to_string(),
            values,
        });
    }
    Ok(())
}

fn diff_structured(
    field: &str,
    current: Option<&Value>,
    want: &Value,
    normalize: ElementNormalizer,
    changes: &mut Vec<Change>,
) -> Result<()> {
    let items = want.as_array().ok_or_else(|| {
        ReconcileError::configuration(format!("`{}` must be a list", field))
    })?;
    let want_set = normalized_set(items, normalize);
    let have_set = normalized_set(
        current.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]),
        normalize,
    );

    if want_set != have_set {
        changes.push(Change::ReplaceStructure {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn normalized_set(items: &[Value], normalize: ElementNormalizer) -> BTreeSet<String> {
    items.iter().map(|item| normalize(item).to_string()).collect()
}

fn expect_mapping<'a>(field: &str, value: &'a Value) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ReconcileError::configuration(format!("`{}` must be a mapping", field)))
}

fn sorted(map: &Map<String, Value>) -> BTreeMap<&String, &Value> {
    map.iter().collect()
}

/// Current state with the desired fields laid over it
///
/// Produces the full document for `edit`-style updates: only the policy's
/// fields are emitted, unmanaged ones keep their current value.
pub fn merged_document(
    current: &AttributeTree,
    desired: &AttributeTree,
    policy: &FieldPolicy,
) -> Value {
    let mut doc = Map::new();

    for rule in policy.fields {
        let have = current.get(rule.name).filter(|v| !v.is_null());
        let want = desired
            .get(rule.name)
            .filter(|v| !v.is_null() || matches!(rule.kind, FieldKind::Property));

        let value = match (rule.kind, want) {
            (kind, None) => have.cloned().unwrap_or_else(|| empty_value(kind)),
            (FieldKind::Property, Some(v)) => Value::String(scalar_string(v).unwrap_or_default()),
            (FieldKind::Config, Some(v)) => merge_config(have, v, &policy.normalization),
            (FieldKind::Devices, Some(v)) => merge_devices(have, v),
            (FieldKind::List, Some(v)) => v.clone(),
            (FieldKind::Structured(normalize), Some(v)) => Value::Array(
                v.as_array()
                    .map(|items| items.iter().map(normalize).collect())
                    .unwrap_or_default(),
            ),
        };
        doc.insert(rule.name.to_string(), value);
    }

    Value::Object(doc)
}

fn empty_value(kind: FieldKind) -> Value {
    match kind {
        FieldKind::Property => Value::String(String::new()),
        FieldKind::Config | FieldKind::Devices => Value::Object(Map::new()),
        FieldKind::List | FieldKind::Structured(_) => Value::Array(Vec::new()),
    }
}

fn merge_config(have: Option<&Value>, want: &Value, table: &NormalizationTable) -> Value {
    let mut merged = have.and_then(Value::as_object).cloned().unwrap_or_default();
    if let Some(want) = want.as_object() {
        for (key, value) in want {
            match table.canonical(key, value) {
                Some(value) => {
                    merged.insert(key.clone(), Value::String(value));
                }
                None => {
                    merged.remove(key);
                }
            }
        }
    }
    Value::Object(merged)
}

fn merge_devices(have: Option<&Value>, want: &Value) -> Value {
    let mut merged = have.and_then(Value::as_object).cloned().unwrap_or_default();
    let Some(want) = want.as_object() else {
        return Value::Object(merged);
    };

    for (name, spec) in want {
        let Some(attrs) = spec.as_object() else {
            merged.remove(name);
            continue;
        };
        let device = merged
            .entry(name.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(device) = device {
            for (key, value) in attrs {
                match scalar_string(value) {
                    Some(value) => {
                        device.insert(key.clone(), Value::String(value));
                    }
                    None => {
                        device.remove(key);
                    }
                }
            }
        }
    }
    Value::Object(merged)
}

/// Desired map that unsets or removes every listed key
pub fn removal_map<S: AsRef<str>>(keys: &[S]) -> Value {
    Value::Object(
        keys.iter()
            .map(|k| (k.as_ref().to_string(), Value::Null))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::INCUS_CONFIG;
    use serde_json::json;

    fn normalize_rule(rule: &Value) -> Value {
        let mut rule = rule.as_object().cloned().unwrap_or_default();
        rule.entry("description").or_insert(json!(""));
        Value::Object(rule)
    }

    const POLICY: FieldPolicy = FieldPolicy::new(
        &[
            FieldRule::new("description", FieldKind::Property),
            FieldRule::new("config", FieldKind::Config),
            FieldRule::new("devices", FieldKind::Devices),
            FieldRule::new("profiles", FieldKind::List),
            FieldRule::new("rules", FieldKind::Structured(normalize_rule)),
        ],
        INCUS_CONFIG,
    );

    fn tree(value: Value) -> AttributeTree {
        AttributeTree::new(value)
    }

    #[test]
    fn test_partial_update_touches_only_managed_keys() {
        let current = tree(json!({"config": {"limits.cpu": "2", "limits.memory": "4GiB"}}));
        let desired = tree(json!({"config": {"limits.cpu": "4"}}));

        let changes = diff(&current, &desired, &POLICY).unwrap();
        assert_eq!(changes, vec![Change::set("limits.cpu", "4")]);
    }

    #[test]
    fn test_explicit_unset_from_key_list() {
        let current = tree(json!({"config": {"limits.cpu": "2"}}));
        let desired = tree(json!({"config": removal_map(["limits.cpu"].as_slice())}));

        let changes = diff(&current, &desired, &POLICY).unwrap();
        assert_eq!(changes, vec![Change::unset("limits.cpu")]);
    }

    #[test]
    fn test_unset_of_missing_key_is_noop() {
        let current = tree(json!({"config": {}}));
        let desired = tree(json!({"config": {"limits.cpu": null}}));
        assert!(diff(&current, &desired, &POLICY).unwrap().is_empty());
    }

    #[test]
    fn test_boolean_normalization_prevents_false_change() {
        let current = tree(json!({"config": {"security.nesting": "true"}}));
        let desired = tree(json!({"config": {"security.nesting": "True"}}));
        assert!(diff(&current, &desired, &POLICY).unwrap().is_empty());

        let desired = tree(json!({"config": {"security.nesting": true}}));
        assert!(diff(&current, &desired, &POLICY).unwrap().is_empty());
    }

    #[test]
    fn test_device_update_never_removes_omitted_devices() {
        let current = tree(json!({"devices": {
            "eth0": {"type": "nic", "network": "incusbr0", "mtu": "1500"},
            "root": {"type": "disk", "path": "/", "pool": "default"},
        }}));
        let desired = tree(json!({"devices": {"eth0": {"mtu": "1400"}}}));

        let changes = diff(&current, &desired, &POLICY).unwrap();
        assert_eq!(
            changes,
            vec![Change::SetDeviceAttr {
                device: "eth0".into(),
                key: "mtu".into(),
                value: "1400".into(),
            }]
        );
    }

    #[test]
    fn test_device_add_requires_type() {
        let current = tree(json!({"devices": {}}));
        let desired = tree(json!({"devices": {"data": {"path": "/data"}}}));
        let err = diff(&current, &desired, &POLICY).unwrap_err();
        assert!(matches!(err, ReconcileError::Configuration(_)));
    }

    #[test]
    fn test_device_add_and_explicit_remove() {
        let current = tree(json!({"devices": {"old": {"type": "disk", "path": "/old"}}}));
        let desired = tree(json!({"devices": {
            "old": null,
            "data": {"type": "disk", "path": "/data", "source": "/srv/data"},
        }}));

        let changes = diff(&current, &desired, &POLICY).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0], Change::RemoveDevice { name: "old".into() });
        match &changes[1] {
            Change::AddDevice {
                name,
                device_type,
                attrs,
            } => {
                assert_eq!(name, "data");
                assert_eq!(device_type, "disk");
                assert_eq!(attrs.get("source").unwrap(), "/srv/data");
                assert!(!attrs.contains_key("type"));
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn test_list_order_is_ignored() {
        let current = tree(json!({"profiles": ["default", "web"]}));
        let desired = tree(json!({"profiles": ["web", "default"]}));
        assert!(diff(&current, &desired, &POLICY).unwrap().is_empty());
    }

    #[test]
    fn test_list_mismatch_is_single_replace() {
        let current = tree(json!({"profiles": ["default"]}));
        let desired = tree(json!({"profiles": ["default", "web", "gpu"]}));
        let changes = diff(&current, &desired, &POLICY).unwrap();
        assert_eq!(
            changes,
            vec![Change::ReplaceList {
                field: "profiles".into(),
                values: vec!["default".into(), "web".into(), "gpu".into()],
            }]
        );
    }

    #[test]
    fn test_structured_list_uses_normalized_set() {
        let current = tree(json!({"rules": [
            {"port": "80", "description": ""},
            {"port": "443", "description": "tls"},
        ]}));
        let desired = tree(json!({"rules": [
            {"port": "443", "description": "tls"},
            {"port": "80"},
        ]}));
        assert!(diff(&current, &desired, &POLICY).unwrap().is_empty());

        let desired = tree(json!({"rules": [{"port": "80"}]}));
        assert_eq!(
            diff(&current, &desired, &POLICY).unwrap(),
            vec![Change::ReplaceStructure {
                field: "rules".into()
            }]
        );
    }

    #[test]
    fn test_property_set_and_unset() {
        let current = tree(json!({"description": "old"}));
        let desired = tree(json!({"description": "new"}));
        assert_eq!(
            diff(&current, &desired, &POLICY).unwrap(),
            vec![Change::SetProperty {
                key: "description".into(),
                value: "new".into()
            }]
        );

        let desired = tree(json!({"description": null}));
        assert_eq!(
            diff(&current, &desired, &POLICY).unwrap(),
            vec![Change::UnsetProperty {
                key: "description".into()
            }]
        );
    }

    #[test]
    fn test_inputs_are_not_mutated() {
        let current = tree(json!({"config": {"a": "1"}}));
        let desired = tree(json!({"config": {"a": null, "b": "2"}}));
        let (before_current, before_desired) = (current.clone(), desired.clone());
        diff(&current, &desired, &POLICY).unwrap();
        assert_eq!(current, before_current);
        assert_eq!(desired, before_desired);
    }

    #[test]
    fn test_merged_document_overlays_desired() {
        let current = tree(json!({
            "name": "web",
            "description": "old",
            "config": {"limits.cpu": "2", "limits.memory": "1GiB"},
            "devices": {"root": {"type": "disk", "path": "/", "pool": "default"}},
            "used_by": [],
        }));
        let desired = tree(json!({
            "config": {"limits.cpu": 4, "limits.memory": null},
            "devices": {"root": {"size": "10GiB"}},
        }));

        let doc = merged_document(&current, &desired, &POLICY);
        assert_eq!(doc["description"], json!("old"));
        assert_eq!(doc["config"], json!({"limits.cpu": "4"}));
        assert_eq!(doc["devices"]["root"]["size"], json!("10GiB"));
        assert_eq!(doc["devices"]["root"]["pool"], json!("default"));
        assert_eq!(doc["profiles"], json!([]));
        assert!(doc.get("used_by").is_none());
    }
}
