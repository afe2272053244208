//! Storage pools

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
    kind: ResourceKind::StoragePool,
    noun: "Storage pool",
    payload: "pool",
    command: &["storage"],
    policy: FieldPolicy::new(&FIELDS, INCUS_CONFIG),
    update: UpdateStyle::Set,
    decode: DecodePolicy::Strict,
    conflicts: &["in use", "currently used", "not empty"],
    force_delete_flag: None,
    cascade: Some(delete_custom_volumes),
};

#[derive(Debug, Clone, Deserialize)]
pub struct StoragePoolParams {
    pub name: String,
    /// Required when the pool has to be created
    pub driver: Option<String>,
    #[serde(default)]
    pub state: Presence,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    pub target: Option<String>,
    #[serde(flatten)]
    pub common: Common,
}

impl StoragePoolParams {
    pub fn adapter(self, ctx: &Context) -> Result<TableAdapter> {
        let mut desired = AttributeTree::default();
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }
        if let Some(config) = &self.config {
            desired.insert("config", Value::Object(config.clone()));
        }
        let missing_driver = self.driver.is_none();

        Ok(TableAdapter::new(
            &TABLE,
            ctx.client(&self.common),
            vec![self.name],
            self.state,
            desired,
        )
        .create_args(self.driver.into_iter().collect())
        .require_for_create(missing_driver, "driver is required to create a storage pool")
        .member(self.target)
        .force(self.common.force))
    }
}

/// Delete the custom volumes still stored in the pool
fn delete_custom_volumes(ctx: &CascadeContext<'_>) -> Result<Vec<Operation>> {
    let pool = ctx.client.qualify(&ctx.key[0]);
    Ok(dependents(ctx.current)
        .into_iter()
        .filter(|dep| dep.collection == "storage-pools" && dep.rest.len() >= 3)
        .filter(|dep| dep.rest[0] == "volumes" && dep.rest[1] == "custom")
        .map(|dep| {
            let volume = dep.rest[2..].join("/");
            tracing::warn!("Deleting volume {} from pool {}", volume, pool);
            let client = ctx.client.in_project(dep.project.clone());
            Operation::run(
                Change::Detach {
                    dependent: volume.clone(),
                },
                client.invocation(args!["storage", "volume", "delete", &pool, volume]),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::mock::{ScriptedExecutor, fail, ok};
    use incusflow_core::{ReconcileError, Reconciler};
    use serde_json::json;

    const POOL: &str = "\
name: fast
driver: zfs
description: \"\"
config:
  size: 30GiB
  source: /var/lib/incus/disks/fast.img
  zfs.pool_name: fast
used_by:
- /1.0/instances/c1
- /1.0/storage-pools/fast/volumes/custom/data?project=team-a
- /1.0/storage-pools/fast/volumes/custom/logs
status: Created
";

    fn adapter(value: Value) -> TableAdapter {
        serde_json::from_value::<StoragePoolParams>(value)
            .unwrap()
            .adapter(&Context::default())
            .unwrap()
    }

    #[test]
    fn test_create_requires_driver() {
        let exec = ScriptedExecutor::new();
        let err = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "fast"})))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Configuration(_)));
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_existing_pool_needs_no_driver() {
        let exec = ScriptedExecutor::new();
        exec.on(&["storage", "show", "fast"], ok(POOL));
        exec.on(&["storage", "set", "fast"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "fast", "config": {"size": "40GiB"}})))
            .unwrap();
        assert!(outcome.changed);
        assert!(exec.called(&["storage", "set", "fast", "size=40GiB"]));
        assert!(outcome.payload.contains_key("pool"));
    }

    #[test]
    fn test_create_with_driver() {
        let exec = ScriptedExecutor::new();
        exec.on(&["storage", "create", "fast", "zfs"], ok(""));

        Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "fast", "driver": "zfs", "config": {"size": "30GiB"}})))
            .unwrap();
        assert!(exec.called(&["storage", "create", "fast", "zfs", "size=30GiB"]));
    }

    #[test]
    fn test_forced_delete_removes_custom_volumes() {
        let exec = ScriptedExecutor::new();
        exec.once(&["storage", "show", "fast"], ok(POOL));
        exec.on(&["storage", "volume", "delete"], ok(""));
        exec.on(&["storage", "delete", "fast"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "fast", "state": "absent", "force": true})))
            .unwrap();

        assert_eq!(outcome.changes, vec!["detach data", "detach logs", "delete"]);
        assert!(exec.called(&["--project", "team-a", "storage", "volume", "delete", "fast", "data"]));
    }

    #[test]
    fn test_delete_in_use_without_force() {
        let exec = ScriptedExecutor::new();
        exec.on(&["storage", "show", "fast"], ok(POOL));
        exec.on(
            &["storage", "delete", "fast"],
            fail(1, "Error: The storage pool is currently in use"),
        );

        let err = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "fast", "state": "absent"})))
            .unwrap_err();

        assert!(matches!(err, ReconcileError::DependencyConflict { .. }));
        assert!(!exec.called(&["storage", "volume", "delete"]));
    }
}
