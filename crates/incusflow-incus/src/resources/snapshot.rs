//! Instance snapshots and snapshot schedules

use super::instance::{POLICY, config_operation};
use crate::args;
use crate::client::Incus;
use crate::request::{Common, Context};
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, DecodePolicy, Format, Operation, Plan,
    ReconcileError, ResourceAdapter, ResourceIdentity, ResourceKind, Result, diff,
};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    #[default]
    Present,
    Absent,
    Restored,
    Renamed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotParams {
    pub instance: String,
    pub snapshot_name: Option<String>,
    #[serde(default)]
    pub state: SnapshotState,
    pub new_name: Option<String>,
    /// Replace an existing snapshot of the same name
    #[serde(default)]
    pub reuse: bool,
    #[serde(default)]
    pub stateful: bool,
    pub cron: Option<String>,
    pub cron_stopped: Option<bool>,
    pub pattern: Option<String>,
    pub expiry: Option<String>,
    #[serde(flatten)]
    pub common: Common,
}

impl SnapshotParams {
    pub fn adapter(self, ctx: &Context) -> Result<SnapshotAdapter> {
        let mut schedule = Map::new();
        if let Some(cron) = &self.cron {
            schedule.insert("snapshots.schedule".into(), Value::String(cron.clone()));
        }
        if let Some(stopped) = self.cron_stopped {
            schedule.insert("snapshots.schedule.stopped".into(), Value::Bool(stopped));
        }
        if let Some(pattern) = &self.pattern {
            schedule.insert("snapshots.pattern".into(), Value::String(pattern.clone()));
        }
        if let Some(expiry) = &self.expiry {
            schedule.insert("snapshots.expiry".into(), Value::String(expiry.clone()));
        }

        if self.snapshot_name.is_none() && schedule.is_empty() {
            return Err(ReconcileError::configuration(
                "snapshot_name or a schedule setting is required",
            ));
        }
        if self.state == SnapshotState::Renamed && self.new_name.is_none() {
            return Err(ReconcileError::configuration("new_name is required to rename a snapshot"));
        }

        let client = ctx.client(&self.common);
        let mut key = vec![self.instance.clone()];
        key.extend(self.snapshot_name.clone());
        Ok(SnapshotAdapter {
            identity: ResourceIdentity::new(client.scope().clone(), ResourceKind::Snapshot, key),
            instance: client.qualify(&self.instance),
            client,
            snapshot: self.snapshot_name,
            state: self.state,
            new_name: self.new_name,
            reuse: self.reuse,
            stateful: self.stateful,
            schedule: (!schedule.is_empty())
                .then(|| AttributeTree::default().with("config", Value::Object(schedule))),
        })
    }
}

pub struct SnapshotAdapter {
    client: Incus,
    identity: ResourceIdentity,
    instance: String,
    snapshot: Option<String>,
    state: SnapshotState,
    new_name: Option<String>,
    reuse: bool,
    stateful: bool,
    schedule: Option<AttributeTree>,
}

impl SnapshotAdapter {
    fn show(&self, exec: &dyn CommandExecutor, name: &str) -> Result<Option<AttributeTree>> {
        self.client.read(
            exec,
            args!["snapshot", "show", &self.instance, name],
            Format::Yaml,
            DecodePolicy::Strict,
        )
    }

    fn run(&self, change: Change, args: Vec<String>) -> Operation {
        Operation::run(change, self.client.invocation(args))
    }

    fn schedule_operations(&self, exec: &dyn CommandExecutor) -> Result<Vec<Operation>> {
        let Some(schedule) = &self.schedule else {
            return Ok(Vec::new());
        };
        let config = self
            .client
            .read(
                exec,
                args!["config", "show", &self.instance],
                Format::Yaml,
                DecodePolicy::Strict,
            )?
            .ok_or_else(|| {
                ReconcileError::precondition(format!("instance {} does not exist", self.instance))
            })?;
        diff(&config, schedule, &POLICY)?
            .into_iter()
            .map(|change| config_operation(&self.client, &self.instance, change))
            .collect()
    }

    fn snapshot_operations(
        &self,
        exec: &dyn CommandExecutor,
        name: &str,
        current: Option<&AttributeTree>,
    ) -> Result<Vec<Operation>> {
        let exists = current.is_some();
        let mut operations = Vec::new();
        match self.state {
            SnapshotState::Present if exists && !self.reuse => {}
            SnapshotState::Present => {
                let mut args = args!["snapshot", "create", &self.instance, name];
                if self.stateful {
                    args.push("--stateful".to_string());
                }
                if self.reuse {
                    args.push("--reuse".to_string());
                }
                operations.push(self.run(Change::Create, args));
            }
            SnapshotState::Absent if exists => {
                operations.push(self.run(
                    Change::Delete,
                    args!["snapshot", "delete", &self.instance, name],
                ));
            }
            SnapshotState::Absent => {}
            SnapshotState::Restored => {
                if !exists {
                    return Err(ReconcileError::precondition(format!(
                        "cannot restore {}: snapshot not found",
                        self.identity.qualified()
                    )));
                }
                let mut args = args!["snapshot", "restore", &self.instance, name];
                if self.stateful {
                    args.push("--stateful".to_string());
                }
                operations.push(self.run(Change::action("restore", name), args));
            }
            SnapshotState::Renamed => {
                let new_name = self.new_name.as_deref().unwrap_or_default();
                let renamed = self.show(exec, new_name)?.is_some();
                match (exists, renamed) {
                    (true, false) => operations.push(self.run(
                        Change::Rename {
                            from: name.to_string(),
                            to: new_name.to_string(),
                        },
                        args!["snapshot", "rename", &self.instance, name, new_name],
                    )),
                    (false, true) => {}
                    (true, true) => {
                        return Err(ReconcileError::precondition(format!(
                            "cannot rename snapshot {} to {}: target already exists",
                            name, new_name
                        )));
                    }
                    (false, false) => {
                        return Err(ReconcileError::precondition(format!(
                            "cannot rename snapshot {}: source not found",
                            name
                        )));
                    }
                }
            }
        }
        Ok(operations)
    }
}

impl ResourceAdapter for SnapshotAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        match &self.snapshot {
            Some(name) => self.show(exec, name),
            None => Ok(None),
        }
    }

    fn plan(&self, exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let title = format!("Snapshot {}", self.identity.qualified());
        let mut changes = ChangeSet::new();
        if let Some(name) = &self.snapshot {
            changes.extend(self.snapshot_operations(exec, name, current)?);
        }
        changes.extend(self.schedule_operations(exec)?);

        if changes.is_empty() {
            return Ok(Plan::unchanged(format!("{} is up to date", title)));
        }
        let outcome = match self.state {
            SnapshotState::Present => "created",
            SnapshotState::Absent => "deleted",
            SnapshotState::Restored => "restored",
            SnapshotState::Renamed => "renamed",
        };
        let message = match (&self.snapshot, changes.changes().first()) {
            (Some(_), Some(Change::Set { .. } | Change::Unset { .. })) | (None, _) => {
                format!("Snapshot schedule of {} updated", self.instance)
            }
            _ => format!("{} {}", title, outcome),
        };
        Ok(Plan::new(changes, message))
    }
}
