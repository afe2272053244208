//! Canonical string forms for configuration values
//!
//! The client reports every configuration value as a string, while callers
//! write YAML booleans and numbers freely. Values are normalized through a
//! per-key table before they are compared.

use serde_json::Value;

/// Declared type of a configuration key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Bool,
    Integer,
}

/// Key patterns mapped to their declared kind
///
/// A pattern ending in `*` matches every key with that prefix.
#[derive(Debug, Clone, Copy)]
pub struct NormalizationTable {
    entries: &'static [(&'static str, ValueKind)],
}

impl NormalizationTable {
    pub const fn new(entries: &'static [(&'static str, ValueKind)]) -> Self {
        Self { entries }
    }

    pub fn kind_of(&self, key: &str) -> ValueKind {
        self.entries
            .iter()
            .find(|(pattern, _)| match pattern.strip_suffix('*') {
                Some(prefix) => key.starts_with(prefix),
                None => *pattern == key,
            })
            .map(|(_, kind)| *kind)
            .unwrap_or(ValueKind::Text)
    }

    /// Canonical string for `value` under `key`; `None` for null
    pub fn canonical(&self, key: &str, value: &Value) -> Option<String> {
        let raw = scalar_string(value)?;
        Some(match self.kind_of(key) {
            ValueKind::Text => raw,
            ValueKind::Bool => canonical_bool(&raw).unwrap_or(raw),
            ValueKind::Integer => raw
                .trim()
                .parse::<i64>()
                .map(|n| n.to_string())
                .unwrap_or(raw),
        })
    }
}

/// Keys the client treats as booleans or integers
pub const INCUS_CONFIG: NormalizationTable = NormalizationTable::new(&[
    ("boot.autostart", ValueKind::Bool),
    ("boot.autostart.delay", ValueKind::Integer),
    ("boot.autostart.priority", ValueKind::Integer),
    ("boot.stop.priority", ValueKind::Integer),
    ("limits.processes", ValueKind::Integer),
    ("migration.stateful", ValueKind::Bool),
    ("security.nesting", ValueKind::Bool),
    ("security.privileged", ValueKind::Bool),
    ("security.secureboot", ValueKind::Bool),
    ("security.protection.*", ValueKind::Bool),
    ("security.syscalls.intercept.*", ValueKind::Bool),
    ("snapshots.schedule.stopped", ValueKind::Bool),
    ("ipv4.nat", ValueKind::Bool),
    ("ipv6.nat", ValueKind::Bool),
    ("ipv4.dhcp", ValueKind::Bool),
    ("ipv6.dhcp", ValueKind::Bool),
    ("ipv4.firewall", ValueKind::Bool),
    ("ipv6.firewall", ValueKind::Bool),
    ("ipv4.routing", ValueKind::Bool),
    ("ipv6.routing", ValueKind::Bool),
    ("bridge.mtu", ValueKind::Integer),
    ("features.*", ValueKind::Bool),
    ("restricted", ValueKind::Bool),
    ("images.auto_update_cached", ValueKind::Bool),
    ("images.auto_update_interval", ValueKind::Integer),
]);

/// String form of a scalar; compound values become compact JSON
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn canonical_bool(raw: &str) -> Option<String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some("true".to_string()),
        "false" | "no" | "off" | "0" => Some("false".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bool_variants_collapse() {
        for raw in [json!(true), json!("True"), json!("yes"), json!("1"), json!(1)] {
            assert_eq!(
                INCUS_CONFIG.canonical("security.nesting", &raw).as_deref(),
                Some("true"),
                "{raw}"
            );
        }
        assert_eq!(
            INCUS_CONFIG.canonical("ipv4.nat", &json!("Off")).as_deref(),
            Some("false")
        );
    }

    #[test]
    fn test_prefix_pattern() {
        assert_eq!(INCUS_CONFIG.kind_of("features.images"), ValueKind::Bool);
        assert_eq!(INCUS_CONFIG.kind_of("limits.memory"), ValueKind::Text);
    }

    #[test]
    fn test_integer_normalization() {
        assert_eq!(
            INCUS_CONFIG.canonical("boot.autostart.priority", &json!("010")).as_deref(),
            Some("10")
        );
        assert_eq!(
            INCUS_CONFIG.canonical("bridge.mtu", &json!("auto")).as_deref(),
            Some("auto")
        );
    }

    #[test]
    fn test_text_is_untouched() {
        assert_eq!(
            INCUS_CONFIG.canonical("user.flag", &json!("True")).as_deref(),
            Some("True")
        );
        assert_eq!(INCUS_CONFIG.canonical("limits.cpu", &Value::Null), None);
    }
}
