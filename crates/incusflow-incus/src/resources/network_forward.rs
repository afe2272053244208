//! Network address forwards

use super::{KindTable, Presence, TableAdapter, UpdateStyle};
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, DecodePolicy, FieldKind, FieldPolicy, FieldRule, ResourceKind, Result,
    scalar_string,
};
use serde::Deserialize;
use serde_json::{Map, Value};

static FIELDS: [FieldRule; 3] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
    FieldRule::new("ports", FieldKind::Structured(normalize_port)),
];

pub static TABLE: KindTable = KindTable {
    kind: ResourceKind::NetworkForward,
    noun: "Network forward",
    payload: "forward",
    command: &["network", "forward"],
    policy: FieldPolicy::new(&FIELDS, INCUS_CONFIG),
    update: UpdateStyle::Edit,
    decode: DecodePolicy::Strict,
    conflicts: &["in use"],
    force_delete_flag: None,
    cascade: None,
};

/// Stringified port rule; `target_port` defaults to `listen_port`
pub fn normalize_port(port: &Value) -> Value {
    let field = |name: &str| {
        port.get(name)
            .and_then(scalar_string)
            .filter(|v| !v.is_empty())
    };
    let listen_port = field("listen_port").unwrap_or_default();
    let mut normalized = Map::new();
    normalized.insert(
        "description".into(),
        Value::String(field("description").unwrap_or_default()),
    );
    normalized.insert(
        "protocol".into(),
        Value::String(field("protocol").unwrap_or_default()),
    );
    normalized.insert(
        "target_address".into(),
        Value::String(field("target_address").unwrap_or_default()),
    );
    normalized.insert(
        "target_port".into(),
        Value::String(field("target_port").unwrap_or_else(|| listen_port.clone())),
    );
    normalized.insert("listen_port".into(), Value::String(listen_port));
    Value::Object(normalized)
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkForwardParams {
    pub network: String,
    pub listen_address: String,
    #[serde(default)]
    pub state: Presence,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    pub ports: Option<Vec<Value>>,
    #[serde(flatten)]
    pub common: Common,
}

impl NetworkForwardParams {
    pub fn adapter(self, ctx: &Context) -> Result<TableAdapter> {
        let mut desired = AttributeTree::default();
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }
        if let Some(config) = &self.config {
            desired.insert("config", Value::Object(config.clone()));
        }
        if let Some(ports) = &self.ports {
            desired.insert("ports", Value::Array(ports.clone()));
        }

        Ok(TableAdapter::new(
            &TABLE,
            ctx.client(&self.common),
            vec![self.network, self.listen_address],
            self.state,
            desired,
        )
        .force(self.common.force))
    }
}
