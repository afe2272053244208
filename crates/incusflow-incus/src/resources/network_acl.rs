//! Network ACLs
//!
//! Rules are compared as sets after filling in the defaults the server
//! would report, so reordering rules or spelling out defaults is not a
//! change.

use super::{CascadeContext, KindTable, Presence, TableAdapter, UpdateStyle, dependents};
use crate::args;
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, Change, DecodePolicy, FieldKind, FieldPolicy, FieldRule, Format, Operation,
    ResourceKind, Result, scalar_string,
};
use serde::Deserialize;
use serde_json::{Map, Value};

const RULE_FIELDS: [&str; 10] = [
    "action",
    "state",
    "description",
    "source",
    "destination",
    "protocol",
    "source_port",
    "destination_port",
    "icmp_type",
    "icmp_code",
];

static FIELDS: [FieldRule; 4] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
    FieldRule::new("ingress", FieldKind::Structured(normalize_rule)),
    FieldRule::new("egress", FieldKind::Structured(normalize_rule)),
];

pub static TABLE: KindTable = KindTable {
    kind: ResourceKind::NetworkAcl,
    noun: "Network ACL",
    payload: "acl",
    command: &["network", "acl"],
    policy: FieldPolicy::new(&FIELDS, INCUS_CONFIG),
    update: UpdateStyle::Edit,
    decode: DecodePolicy::Strict,
    conflicts: &["in use", "currently used", "referenced"],
    force_delete_flag: None,
    cascade: Some(remove_from_networks),
};

/// Every rule field as a string, `state` defaulting to `enabled`
pub fn normalize_rule(rule: &Value) -> Value {
    let mut normalized = Map::new();
    for field in RULE_FIELDS {
        let value = rule
            .get(field)
            .and_then(scalar_string)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| match field {
                "state" => "enabled".to_string(),
                _ => String::new(),
            });
        normalized.insert(field.to_string(), Value::String(value));
    }
    Value::Object(normalized)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkAclParams {
    pub name: String,
    #[serde(default)]
    pub state: Presence,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    pub ingress: Option<Vec<Value>>,
    pub egress: Option<Vec<Value>>,
    #[serde(flatten)]
    pub common: Common,
}

impl NetworkAclParams {
    pub fn adapter(self, ctx: &Context) -> Result<TableAdapter> {
        let mut desired = AttributeTree::default();
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }
        if let Some(config) = &self.config {
            desired.insert("config", Value::Object(config.clone()));
        }
        if let Some(ingress) = &self.ingress {
            desired.insert("ingress", Value::Array(ingress.clone()));
        }
        if let Some(egress) = &self.egress {
            desired.insert("egress", Value::Array(egress.clone()));
        }

        Ok(TableAdapter::new(
            &TABLE,
            ctx.client(&self.common),
            vec![self.name],
            self.state,
            desired,
        )
        .force(self.common.force))
    }
}

/// Drop the ACL from `security.acls` of every network referencing it
fn remove_from_networks(ctx: &CascadeContext<'_>) -> Result<Vec<Operation>> {
    let acl = &ctx.key[0];
    let mut operations = Vec::new();

    for dep in dependents(ctx.current) {
        if dep.collection != "networks" {
            continue;
        }
        let client = ctx.client.in_project(dep.project.clone());
        let network = client.qualify(&dep.name);
        let Some(current) = client.read(
            ctx.exec,
            args!["network", "show", &network],
            Format::Yaml,
            DecodePolicy::Strict,
        )?
        else {
            continue;
        };

        let acls = current.string_map("config");
        let remaining: Vec<&str> = acls
            .get("security.acls")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty() && *name != acl.as_str())
                    .collect()
            })
            .unwrap_or_default();

        tracing::warn!("Removing ACL {} from network {}", acl, dep.name);
        let args = if remaining.is_empty() {
            args!["network", "unset", &network, "security.acls"]
        } else {
            args![
                "network",
                "set",
                &network,
                format!("security.acls={}", remaining.join(","))
            ]
        };
        operations.push(Operation::run(
            Change::Detach {
                dependent: dep.name.clone(),
            },
            client.invocation(args),
        ));
    }
    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::Reconciler;
    use incusflow_core::mock::{ScriptedExecutor, ok};
    use serde_json::json;

    const WEB_ACL: &str = "\
name: web
description: web traffic
config: {}
egress: []
ingress:
- action: allow
  state: enabled
  destination_port: \"443\"
  protocol: tcp
  description: \"\"
  source: \"\"
  destination: \"\"
  source_port: \"\"
  icmp_type: \"\"
  icmp_code: \"\"
- action: allow
  state: enabled
  destination_port: \"80\"
  protocol: tcp
  description: \"\"
  source: \"\"
  destination: \"\"
  source_port: \"\"
  icmp_type: \"\"
  icmp_code: \"\"
used_by:
- /1.0/networks/incusbr0
";

    fn adapter(value: Value) -> TableAdapter {
        serde_json::from_value::<NetworkAclParams>(value)
            .unwrap()
            .adapter(&Context::default())
            .unwrap()
    }

    #[test]
    fn test_reordered_rules_with_defaults_are_up_to_date() {
        let exec = ScriptedExecutor::new();
        exec.on(&["network", "acl", "show", "web"], ok(WEB_ACL));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "name": "web",
                "ingress": [
                    {"action": "allow", "protocol": "tcp", "destination_port": 80},
                    {"action": "allow", "protocol": "tcp", "destination_port": "443"}
                ]
            })))
            .unwrap();

        assert!(!outcome.changed);
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_changed_rules_rewrite_through_edit() {
        let exec = ScriptedExecutor::new();
        exec.on(&["network", "acl", "show", "web"], ok(WEB_ACL));
        exec.on(&["network", "acl", "edit", "web"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "name": "web",
                "ingress": [{"action": "allow", "protocol": "tcp", "destination_port": "22"}]
            })))
            .unwrap();

        assert_eq!(outcome.changes, vec!["replace ingress"]);
        let call = exec
            .calls()
            .into_iter()
            .find(|c| c.argv.contains(&"edit".to_string()))
            .unwrap();
        let doc: Value = serde_yaml::from_slice(&call.stdin.unwrap()).unwrap();
        assert_eq!(doc["ingress"].as_array().unwrap().len(), 1);
        assert_eq!(doc["ingress"][0]["destination_port"], "22");
        assert_eq!(doc["ingress"][0]["state"], "enabled");
        assert_eq!(doc["description"], "web traffic");
    }

    #[test]
    fn test_forced_delete_rewrites_network_acls() {
        let exec = ScriptedExecutor::new();
        exec.once(&["network", "acl", "show", "web"], ok(WEB_ACL));
        exec.on(
            &["network", "show", "incusbr0"],
            ok("name: incusbr0\nconfig:\n  security.acls: web,ssh\n"),
        );
        exec.on(&["network", "set"], ok(""));
        exec.on(&["network", "acl", "delete", "web"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "web", "state": "absent", "force": true})))
            .unwrap();

        assert!(outcome.changed);
        assert!(exec.called(&["network", "set", "incusbr0", "security.acls=ssh"]));
    }

    #[test]
    fn test_normalize_rule_fills_defaults() {
        let rule = normalize_rule(&json!({"action": "drop", "icmp_type": 8}));
        assert_eq!(rule["state"], "enabled");
        assert_eq!(rule["icmp_type"], "8");
        assert_eq!(rule["source"], "");
    }
}
