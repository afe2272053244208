//! Projects
//!
//! Projects are global to a remote, so requests are never scoped with
//! `--project` even when a default project is configured.

use super::{KindTable, Presence, TableAdapter, UpdateStyle, load_source, overlay};
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, DecodePolicy, FieldKind, FieldPolicy, FieldRule, ResourceKind, Result,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

static FIELDS: [FieldRule; 2] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
];

pub static TABLE: KindTable = KindTable {
    kind: ResourceKind::Project,
    noun: "Project",
    payload: "project",
    command: &["project"],
    policy: FieldPolicy::new(&FIELDS, INCUS_CONFIG),
    update: UpdateStyle::Edit,
    decode: DecodePolicy::Strict,
    conflicts: &["in use", "not empty"],
    force_delete_flag: Some("--force"),
    cascade: None,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectParams {
    pub name: String,
    #[serde(default)]
    pub state: Presence,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    pub source: Option<PathBuf>,
    pub rename_from: Option<String>,
    #[serde(flatten)]
    pub common: Common,
}

impl ProjectParams {
    pub fn adapter(self, ctx: &Context) -> Result<TableAdapter> {
        let mut desired = match &self.source {
            Some(path) => load_source(path)?,
            None => AttributeTree::default(),
        };
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }
        if let Some(config) = &self.config {
            overlay(&mut desired, "config", config);
        }

        Ok(TableAdapter::new(
            &TABLE,
            ctx.client(&self.common).unscoped(),
            vec![self.name],
            self.state,
            desired,
        )
        .rename_from(self.rename_from)
        .authoritative(self.source.is_some())
        .force(self.common.force))
    }
}
