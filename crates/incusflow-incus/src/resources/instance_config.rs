//! Config keys and devices of an existing instance

use super::instance::{POLICY, config_operation};
use super::{MapOrKeys, Presence};
use crate::args;
use crate::client::Incus;
use crate::request::{Common, Context};
use incusflow_core::{
    AttributeTree, ChangeSet, CommandExecutor, DecodePolicy, Format, Plan, ReconcileError,
    ResourceAdapter, ResourceIdentity, ResourceKind, Result, diff,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfigParams {
    pub name: String,
    #[serde(default)]
    pub state: Presence,
    pub config: Option<MapOrKeys>,
    pub devices: Option<MapOrKeys>,
    #[serde(flatten)]
    pub common: Common,
}

impl InstanceConfigParams {
    pub fn adapter(self, ctx: &Context) -> Result<InstanceConfigAdapter> {
        let remove = self.state == Presence::Absent;
        let mut desired = AttributeTree::default();
        for (field, value) in [("config", &self.config), ("devices", &self.devices)] {
            let Some(value) = value else { continue };
            if value.is_keys() && !remove {
                return Err(ReconcileError::configuration(format!(
                    "`{}` as a list of names is only valid with state: absent",
                    field
                )));
            }
            desired.insert(field, value.desired(remove));
        }

        let client = ctx.client(&self.common);
        Ok(InstanceConfigAdapter {
            identity: ResourceIdentity::new(
                client.scope().clone(),
                ResourceKind::InstanceConfig,
                [self.name.clone()],
            ),
            target: client.qualify(&self.name),
            client,
            desired,
        })
    }
}

pub struct InstanceConfigAdapter {
    client: Incus,
    identity: ResourceIdentity,
    target: String,
    desired: AttributeTree,
}

impl ResourceAdapter for InstanceConfigAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        match self.client.read(
            exec,
            args!["config", "show", &self.target],
            Format::Yaml,
            DecodePolicy::Strict,
        )? {
            Some(current) => Ok(Some(current)),
            None => Err(ReconcileError::precondition(format!(
                "instance {} does not exist",
                self.identity.qualified()
            ))),
        }
    }

    fn plan(&self, _exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let title = format!("Config of instance {}", self.identity.qualified());
        let empty = AttributeTree::default();
        let changes: ChangeSet = diff(current.unwrap_or(&empty), &self.desired, &POLICY)?
            .into_iter()
            .map(|change| config_operation(&self.client, &self.target, change))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .collect();

        if changes.is_empty() {
            return Ok(Plan::unchanged(format!("{} is up to date", title)));
        }
        Ok(Plan::new(changes, format!("{} updated", title)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::Reconciler;
    use incusflow_core::mock::{ScriptedExecutor, ok};
    use serde_json::{Value, json};

    const SHOW: &str = "\
architecture: x86_64
config:
  limits.cpu: \"2\"
  limits.memory: 2GiB
  volatile.uuid: 1234
devices:
  data:
    path: /mnt
    source: /srv/data
    type: disk
  gpu:
    type: gpu
ephemeral: false
profiles:
- default
";

    fn adapter(value: Value) -> Result<InstanceConfigAdapter> {
        serde_json::from_value::<InstanceConfigParams>(value)
            .unwrap()
            .adapter(&Context::default())
    }

    #[test]
    fn test_missing_instance_is_precondition() {
        let exec = ScriptedExecutor::new();
        let err = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c1", "config": {"limits.cpu": 1}})).unwrap())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Precondition(_)));
    }

    #[test]
    fn test_remove_keys_and_devices() {
        let exec = ScriptedExecutor::new();
        exec.on(&["config", "show", "c1"], ok(SHOW));
        exec.on(&["config", "unset"], ok(""));
        exec.on(&["config", "device", "remove"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(
                &adapter(json!({
                    "name": "c1",
                    "state": "absent",
                    "config": ["limits.memory", "limits.disk"],
                    "devices": ["gpu"]
                }))
                .unwrap(),
            )
            .unwrap();

        assert_eq!(outcome.changes, vec!["unset limits.memory", "remove device gpu"]);
        assert!(exec.called(&["config", "unset", "c1", "limits.memory"]));
        assert!(exec.called(&["config", "device", "remove", "c1", "gpu"]));
    }

    #[test]
    fn test_key_list_requires_absent() {
        let err = adapter(json!({"name": "c1", "config": ["limits.cpu"]})).err().unwrap();
        assert!(matches!(err, ReconcileError::Configuration(_)));
    }

    #[test]
    fn test_partial_update_leaves_other_keys() {
        let exec = ScriptedExecutor::new();
        exec.on(&["config", "show", "c1"], ok(SHOW));
        exec.on(&["config", "set"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c1", "config": {"limits.cpu": "4"}})).unwrap())
            .unwrap();

        assert_eq!(outcome.changes, vec!["set limits.cpu=4"]);
        assert_eq!(exec.mutating_calls().len(), 1);
    }
}
