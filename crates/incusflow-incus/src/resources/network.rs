//! Managed networks

use super::{CascadeContext, KindTable, Presence, TableAdapter, UpdateStyle, dependents};
use crate::args;
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, Change, DecodePolicy, FieldKind, FieldPolicy, FieldRule, Operation,
    ResourceKind, Result,
};
use serde::Deserialize;
use serde_json::{Map, Value};

static FIELDS: [FieldRule; 2] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
];

pub static TABLE: KindTable = KindTable {
    kind: ResourceKind::Network,
    noun: "Network",
    payload: "network",
    command: &["network"],
    policy: FieldPolicy::new(&FIELDS, INCUS_CONFIG),
    update: UpdateStyle::Set,
    decode: DecodePolicy::Strict,
    conflicts: &["in use", "currently used"],
    force_delete_flag: None,
    cascade: Some(detach_users),
};

fn default_network_type() -> String {
    "bridge".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkParams {
    pub name: String,
    #[serde(default = "default_network_type")]
    pub network_type: String,
    #[serde(default)]
    pub state: Presence,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    /// Cluster member to address
    pub target: Option<String>,
    #[serde(flatten)]
    pub common: Common,
}

impl NetworkParams {
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
        .create_args(args![format!("--type={}", self.network_type)])
        .member(self.target)
        .force(self.common.force))
    }
}

/// Detach the network from every instance and profile using it
fn detach_users(ctx: &CascadeContext<'_>) -> Result<Vec<Operation>> {
    let network = ctx.client.qualify(&ctx.key[0]);
    let mut operations = Vec::new();
    for dep in dependents(ctx.current) {
        let verb = match dep.collection.as_str() {
            "instances" => "detach",
            "profiles" => "detach-profile",
            _ => continue,
        };
        tracing::warn!("Detaching network {} from {}", network, dep.name);
        let client = ctx.client.in_project(dep.project.clone());
        operations.push(Operation::run(
            Change::Detach {
                dependent: dep.name.clone(),
            },
            client.invocation(args!["network", verb, &network, &dep.name]),
        ));
    }
    Ok(operations)
}
