//! Resource adapters, one module per kind

pub mod admin_init;
pub mod cluster;
pub mod copy;
pub mod exec;
pub mod export;
pub mod file;
pub mod image;
pub mod instance;
pub mod instance_config;
pub mod network;
pub mod network_acl;
pub mod network_forward;
pub mod network_zone;
pub mod profile;
pub mod project;
pub mod publish;
pub mod remote;
pub mod snapshot;
pub mod storage_pool;
pub mod storage_volume;
mod table;

pub use table::{Cascade, CascadeContext, Dependent, KindTable, TableAdapter, UpdateStyle, dependents};

use incusflow_core::{AttributeTree, ReconcileError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

/// `state: present | absent`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Present,
    Absent,
}

/// Lay `map` over the mapping at `field`, keeping explicit nulls
pub(crate) fn overlay(desired: &mut AttributeTree, field: &str, map: &Map<String, Value>) {
    let mut merged = desired.map(field).cloned().unwrap_or_default();
    for (key, value) in map {
        merged.insert(key.clone(), value.clone());
    }
    desired.insert(field, Value::Object(merged));
}

/// Read a YAML resource document used as the base of a request
pub(crate) fn load_source(path: &Path) -> Result<AttributeTree> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ReconcileError::configuration(format!("cannot read {}: {}", path.display(), e))
    })?;
    let value: Value = serde_yaml::from_str(&content).map_err(|e| {
        ReconcileError::configuration(format!("invalid YAML in {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(ReconcileError::configuration(format!(
            "{} must contain a mapping",
            path.display()
        )));
    }
    Ok(AttributeTree::new(value))
}

/// Config or device values supplied either as a mapping or as a key list
///
/// The list form names keys to remove and is only meaningful with
/// `state: absent`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MapOrKeys {
    Map(Map<String, Value>),
    Keys(Vec<String>),
}

impl MapOrKeys {
    /// Desired mapping: values to set, or nulls to remove
    pub fn desired(&self, remove: bool) -> Value {
        match (self, remove) {
            (MapOrKeys::Keys(keys), _) => incusflow_core::removal_map(keys.as_slice()),
            (MapOrKeys::Map(map), true) => {
                let keys: Vec<&String> = map.keys().collect();
                incusflow_core::removal_map(keys.as_slice())
            }
            (MapOrKeys::Map(map), false) => Value::Object(map.clone()),
        }
    }

    pub fn is_keys(&self) -> bool {
        matches!(self, MapOrKeys::Keys(_))
    }
}
