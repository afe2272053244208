//! Profiles

use super::{CascadeContext, KindTable, Presence, TableAdapter, UpdateStyle, dependents, load_source, overlay};
use crate::args;
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, Change, DecodePolicy, FieldKind, FieldPolicy, FieldRule, Operation,
    ResourceKind, Result,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

static FIELDS: [FieldRule; 3] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
    FieldRule::new("devices", FieldKind::Devices),
];

pub static TABLE: KindTable = KindTable {
    kind: ResourceKind::Profile,
    noun: "Profile",
    payload: "profile",
    command: &["profile"],
    policy: FieldPolicy::new(&FIELDS, INCUS_CONFIG),
    update: UpdateStyle::Edit,
    decode: DecodePolicy::Strict,
    conflicts: &["in use", "currently used", "still in use"],
    force_delete_flag: None,
    cascade: Some(remove_from_instances),
};

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileParams {
    pub name: String,
    #[serde(default)]
    pub state: Presence,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    pub devices: Option<Map<String, Value>>,
    /// YAML document holding the complete profile
    pub source: Option<PathBuf>,
    pub rename_from: Option<String>,
    #[serde(flatten)]
    pub common: Common,
}

impl ProfileParams {
    pub fn adapter(self, ctx: &Context) -> Result<TableAdapter> {
        let desired = self.desired()?;
        Ok(TableAdapter::new(
            &TABLE,
            ctx.client(&self.common),
            vec![self.name],
            self.state,
            desired,
        )
        .rename_from(self.rename_from)
        .authoritative(self.source.is_some())
        .force(self.common.force))
    }

    fn desired(&self) -> Result<AttributeTree> {
        let mut desired = match &self.source {
            Some(path) => {
                let mut doc = load_source(path)?;
                for field in ["config", "devices"] {
                    if doc.map(field).is_none() {
                        doc.insert(field, Value::Object(Map::new()));
                    }
                }
                doc
            }
            None => AttributeTree::default(),
        };
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }
        if let Some(config) = &self.config {
            overlay(&mut desired, "config", config);
        }
        if let Some(devices) = &self.devices {
            overlay(&mut desired, "devices", devices);
        }
        Ok(desired)
    }
}

/// `profile remove` the profile from every instance using it
fn remove_from_instances(ctx: &CascadeContext<'_>) -> Result<Vec<Operation>> {
    let profile = &ctx.key[0];
    Ok(dependents(ctx.current)
        .into_iter()
        .filter(|dep| dep.collection == "instances")
        .map(|dep| {
            tracing::warn!("Removing profile {} from instance {}", profile, dep.name);
            let client = ctx.client.in_project(dep.project.clone());
            Operation::run(
                Change::Detach {
                    dependent: dep.name.clone(),
                },
                client.invocation(args!["profile", "remove", client.qualify(&dep.name), profile]),
            )
        })
        .collect())
}
