//! DNS zones served by the network subsystem

use super::{KindTable, Presence, TableAdapter, UpdateStyle};
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, DecodePolicy, FieldKind, FieldPolicy, FieldRule, ResourceKind, Result,
};
use serde::Deserialize;
use serde_json::{Map, Value};

static FIELDS: [FieldRule; 2] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
];

pub static TABLE: KindTable = KindTable {
    kind: ResourceKind::NetworkZone,
    noun: "Network zone",
    payload: "zone",
    command: &["network", "zone"],
    policy: FieldPolicy::new(&FIELDS, INCUS_CONFIG),
    update: UpdateStyle::Edit,
    decode: DecodePolicy::Strict,
    conflicts: &["in use", "currently used"],
    force_delete_flag: None,
    cascade: None,
};

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkZoneParams {
    pub name: String,
    #[serde(default)]
    pub state: Presence,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub common: Common,
}

impl NetworkZoneParams {
    pub fn adapter(self, ctx: &Context) -> Result<TableAdapter> {
        let mut desired = AttributeTree::default();
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }
        if let Some(config) = &self.config {
            desired.insert("config", Value::Object(config.clone()));
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

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::Reconciler;
    use incusflow_core::mock::{ScriptedExecutor, ok};
    use serde_json::json;

    #[test]
    fn test_zone_update_through_edit() {
        let exec = ScriptedExecutor::new();
        exec.on(
            &["network", "zone", "show", "lab.example.net"],
            ok("name: lab.example.net\ndescription: \"\"\nconfig:\n  dns.nameservers: ns1.example.net\n"),
        );
        exec.on(&["network", "zone", "edit"], ok(""));

        let adapter = serde_json::from_value::<NetworkZoneParams>(json!({
            "name": "lab.example.net",
            "config": {"peers.ns.address": "192.0.2.53"}
        }))
        .unwrap()
        .adapter(&Context::default())
        .unwrap();
        let outcome = Reconciler::new(&exec).reconcile(&adapter).unwrap();

        assert_eq!(outcome.changes, vec!["set peers.ns.address=192.0.2.53"]);
        assert!(outcome.payload.contains_key("zone"));
        let call = exec.mutating_calls().remove(0);
        let doc: Value = serde_yaml::from_slice(&call.stdin.unwrap()).unwrap();
        assert_eq!(doc["config"]["dns.nameservers"], "ns1.example.net");
    }
}
