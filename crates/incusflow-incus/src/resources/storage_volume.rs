//! Custom storage volumes
//!
//! `present`/`absent` go through the shared table lifecycle. The other
//! states are one-shot actions guarded by an existence check.

use super::{CascadeContext, KindTable, Presence, TableAdapter, UpdateStyle, dependents};
use crate::args;
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, ConflictClassifier, DecodePolicy,
    FieldKind, FieldPolicy, FieldRule, Format, Operation, Plan, ReconcileError, ResourceAdapter,
    ResourceIdentity, ResourceKind, Result, Step,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

static FIELDS: [FieldRule; 2] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
];

pub static TABLE: KindTable = KindTable {
    kind: ResourceKind::StorageVolume,
    noun: "Storage volume",
    payload: "volume",
    command: &["storage", "volume"],
    policy: FieldPolicy::new(&FIELDS, INCUS_CONFIG),
    update: UpdateStyle::Set,
    decode: DecodePolicy::Strict,
    conflicts: &["in use", "currently used", "still in use"],
    force_delete_flag: None,
    cascade: Some(detach_users),
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    #[default]
    Present,
    Absent,
    Restored,
    Exported,
    Imported,
    Copied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Filesystem,
    Block,
    Iso,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageVolumeParams {
    pub pool: String,
    pub name: String,
    #[serde(default)]
    pub state: VolumeState,
    pub volume_type: Option<ContentType>,
    pub content_type: Option<ContentType>,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    /// Cluster member holding the volume
    pub target: Option<String>,
    pub snapshot: Option<String>,
    pub export_to: Option<PathBuf>,
    pub import_from: Option<PathBuf>,
    pub target_pool: Option<String>,
    pub target_volume: Option<String>,
    #[serde(default, rename = "move")]
    pub move_volume: bool,
    pub attach_to: Option<String>,
    pub attach_path: Option<String>,
    pub attach_device: Option<String>,
    #[serde(flatten)]
    pub common: Common,
}

impl StorageVolumeParams {
    pub fn adapter(self, ctx: &Context) -> Result<StorageVolumeAdapter> {
        let content_type = self.content_type.or(self.volume_type);
        if content_type == Some(ContentType::Iso) && self.state != VolumeState::Imported {
            return Err(ReconcileError::configuration(
                "content_type iso is only valid with state: imported",
            ));
        }

        let mut desired = AttributeTree::default();
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }
        if let Some(config) = &self.config {
            desired.insert("config", Value::Object(config.clone()));
        }

        let presence = match self.state {
            VolumeState::Absent => Presence::Absent,
            _ => Presence::Present,
        };
        let create_args = match content_type {
            Some(ContentType::Block) => args!["--type=block"],
            _ => Vec::new(),
        };
        let table = TableAdapter::new(
            &TABLE,
            ctx.client(&self.common),
            vec![self.pool, self.name],
            presence,
            desired,
        )
        .create_args(create_args)
        .member(self.target)
        .force(self.common.force);

        Ok(StorageVolumeAdapter {
            table,
            state: self.state,
            content_type,
            snapshot: self.snapshot,
            export_to: self.export_to,
            import_from: self.import_from,
            target_pool: self.target_pool,
            target_volume: self.target_volume,
            move_volume: self.move_volume,
            attach_to: self.attach_to,
            attach_path: self.attach_path,
            attach_device: self.attach_device,
            force: self.common.force,
        })
    }
}

pub struct StorageVolumeAdapter {
    table: TableAdapter,
    state: VolumeState,
    content_type: Option<ContentType>,
    snapshot: Option<String>,
    export_to: Option<PathBuf>,
    import_from: Option<PathBuf>,
    target_pool: Option<String>,
    target_volume: Option<String>,
    move_volume: bool,
    attach_to: Option<String>,
    attach_path: Option<String>,
    attach_device: Option<String>,
    force: bool,
}

impl StorageVolumeAdapter {
    fn pool(&self) -> &str {
        &self.table.target()[0]
    }

    fn volume(&self) -> &str {
        &self.identity().key[1]
    }

    fn title(&self) -> String {
        self.table.title()
    }

    fn run(&self, change: Change, args: Vec<String>) -> Operation {
        Operation::run(change, self.table.client().invocation(args))
    }

    fn exists(&self, exec: &dyn CommandExecutor, pool: &str, volume: &str) -> Result<bool> {
        Ok(self
            .table
            .client()
            .read(
                exec,
                args!["storage", "volume", "show", pool, volume],
                Format::Yaml,
                DecodePolicy::Lenient,
            )?
            .is_some())
    }

    fn snapshot_name(&self) -> Result<&str> {
        self.snapshot
            .as_deref()
            .ok_or_else(|| ReconcileError::configuration("snapshot is required"))
    }

    fn require_volume(&self, current: Option<&AttributeTree>) -> Result<()> {
        match current {
            Some(_) => Ok(()),
            None => Err(ReconcileError::precondition(format!(
                "{} does not exist",
                self.title()
            ))),
        }
    }

    fn plan_snapshot(
        &self,
        exec: &dyn CommandExecutor,
        current: Option<&AttributeTree>,
        snapshot: &str,
    ) -> Result<Plan> {
        let title = format!("Snapshot {} of {}", snapshot, self.title());
        if self.state == VolumeState::Absent && current.is_none() {
            return Ok(Plan::unchanged(format!("{} is absent", title)));
        }
        self.require_volume(current)?;
        let exists = self.exists(exec, self.pool(), &format!("{}/{}", self.volume(), snapshot))?;

        let mut changes = ChangeSet::new();
        let message = match (self.state, exists) {
            (VolumeState::Absent, false) => return Ok(Plan::unchanged(format!("{} is absent", title))),
            (VolumeState::Absent, true) => {
                changes.push(self.run(
                    Change::action("delete snapshot", snapshot),
                    args!["storage", "volume", "snapshot", "delete", self.pool(), self.volume(), snapshot],
                ));
                format!("{} deleted", title)
            }
            (_, true) => return Ok(Plan::unchanged(format!("{} exists", title))),
            (_, false) => {
                changes.push(self.run(
                    Change::action("snapshot", snapshot),
                    args!["storage", "volume", "snapshot", "create", self.pool(), self.volume(), snapshot],
                ));
                format!("{} created", title)
            }
        };
        Ok(Plan::new(changes, message))
    }

    fn plan_restore(&self, exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let snapshot = self.snapshot_name()?;
        self.require_volume(current)?;
        if !self.exists(exec, self.pool(), &format!("{}/{}", self.volume(), snapshot))? {
            return Err(ReconcileError::precondition(format!(
                "snapshot {} of {} does not exist",
                snapshot,
                self.title()
            )));
        }
        let mut changes = ChangeSet::new();
        changes.push(self.run(
            Change::action("restore", snapshot),
            args!["storage", "volume", "snapshot", "restore", self.pool(), self.volume(), snapshot],
        ));
        Ok(Plan::new(
            changes,
            format!("{} restored from {}", self.title(), snapshot),
        ))
    }

    fn plan_export(&self, current: Option<&AttributeTree>) -> Result<Plan> {
        let path = self
            .export_to
            .as_ref()
            .ok_or_else(|| ReconcileError::configuration("export_to is required"))?;
        self.require_volume(current)?;

        let display = path.display().to_string();
        let mut operation = self.run(
            Change::action("export", &display),
            args!["storage", "volume", "export", self.pool(), self.volume(), &display],
        );
        if path.exists() {
            if !self.force {
                return Ok(Plan::unchanged(format!("{} already exists", display)));
            }
            operation = operation.before(Step::RemoveLocalFile(path.clone()));
        }
        let mut changes = ChangeSet::new();
        changes.push(operation);
        Ok(Plan::new(changes, format!("{} exported to {}", self.title(), display)))
    }

    fn plan_import(&self, current: Option<&AttributeTree>) -> Result<Plan> {
        let path = self
            .import_from
            .as_ref()
            .ok_or_else(|| ReconcileError::configuration("import_from is required"))?;
        if current.is_some() {
            return Ok(Plan::unchanged(format!("{} already exists", self.title())));
        }
        if !path.exists() {
            return Err(ReconcileError::precondition(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let mut args = args![
            "storage",
            "volume",
            "import",
            self.pool(),
            path.display(),
            self.volume()
        ];
        if self.content_type == Some(ContentType::Iso) {
            args.push("--type=iso".to_string());
        }
        let mut changes = ChangeSet::new();
        changes.push(self.run(Change::Create, args));
        Ok(Plan::new(changes, format!("{} imported", self.title())))
    }

    fn plan_copy(&self, exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let client = self.table.client();
        let target_pool = client.qualify(self.target_pool.as_deref().unwrap_or(&self.identity().key[0]));
        let target_volume = self.target_volume.as_deref().unwrap_or(self.volume());
        let destination = format!("{}/{}", target_pool, target_volume);
        let dest_exists = self.exists(exec, &target_pool, target_volume)?;
        let verb = if self.move_volume { "move" } else { "copy" };

        match (current.is_some(), dest_exists, self.move_volume) {
            (_, true, false) | (false, true, true) => {
                return Ok(Plan::unchanged(format!("{} already exists", destination)));
            }
            (true, true, true) => {
                return Err(ReconcileError::precondition(format!(
                    "cannot move {}: {} already exists",
                    self.title(),
                    destination
                )));
            }
            (false, false, _) => {
                return Err(ReconcileError::precondition(format!(
                    "cannot {} {}: source not found",
                    verb,
                    self.title()
                )));
            }
            (true, false, _) => {}
        }

        let mut changes = ChangeSet::new();
        changes.push(self.run(
            Change::action(verb, &destination),
            args![
                "storage",
                "volume",
                verb,
                format!("{}/{}", self.pool(), self.volume()),
                &destination
            ],
        ));
        Ok(Plan::new(changes, format!("{} {} to {}", self.title(), past(verb), destination)))
    }

    /// Attach to `attach_to` unless a disk device already points at the volume
    fn attach_operation(&self, exec: &dyn CommandExecutor) -> Result<Option<Operation>> {
        let Some(instance) = &self.attach_to else {
            return Ok(None);
        };
        let client = self.table.client();
        let instance = client.qualify(instance);
        let config = client.read(
            exec,
            args!["config", "show", &instance],
            Format::Yaml,
            DecodePolicy::Strict,
        )?;
        let Some(config) = config else {
            return Err(ReconcileError::precondition(format!(
                "cannot attach {}: instance {} does not exist",
                self.title(),
                instance
            )));
        };

        let pool = &self.identity().key[0];
        let attached = config.map("devices").is_some_and(|devices| {
            devices.values().any(|device| {
                device.get("type").and_then(Value::as_str) == Some("disk")
                    && device.get("pool").and_then(Value::as_str) == Some(pool.as_str())
                    && device.get("source").and_then(Value::as_str) == Some(self.volume())
            })
        });
        if attached {
            return Ok(None);
        }

        let mut args = args!["storage", "volume", "attach", self.pool(), self.volume(), &instance];
        match (&self.attach_device, &self.attach_path) {
            (Some(device), Some(path)) => args.extend(args![device, path]),
            (Some(device), None) => args.push(device.clone()),
            (None, Some(path)) => args.extend(args![self.volume(), path]),
            (None, None) => {}
        }
        Ok(Some(self.run(Change::action("attach to", instance), args)))
    }
}

fn past(verb: &str) -> &'static str {
    match verb {
        "move" => "moved",
        _ => "copied",
    }
}

impl ResourceAdapter for StorageVolumeAdapter {
    fn identity(&self) -> &ResourceIdentity {
        self.table.identity()
    }

    fn payload_key(&self) -> &'static str {
        TABLE.payload
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        self.table.fetch(exec)
    }

    fn plan(&self, exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        match self.state {
            VolumeState::Restored => return self.plan_restore(exec, current),
            VolumeState::Exported => return self.plan_export(current),
            VolumeState::Imported => return self.plan_import(current),
            VolumeState::Copied => return self.plan_copy(exec, current),
            VolumeState::Present | VolumeState::Absent => {}
        }
        if let Some(snapshot) = &self.snapshot {
            return self.plan_snapshot(exec, current, snapshot);
        }

        let mut plan = self.table.plan(exec, current)?;
        if self.state == VolumeState::Present {
            if let Some(attach) = self.attach_operation(exec)? {
                if !plan.has_changes() {
                    plan.message = format!("{} attached", self.title());
                }
                plan.changes.push(attach);
            }
        }
        Ok(plan)
    }

    fn conflicts(&self) -> ConflictClassifier {
        self.table.conflicts()
    }
}

/// Detach the volume from every instance and profile using it
fn detach_users(ctx: &CascadeContext<'_>) -> Result<Vec<Operation>> {
    let pool = ctx.client.qualify(&ctx.key[0]);
    let volume = &ctx.key[1];
    let mut operations = Vec::new();
    for dep in dependents(ctx.current) {
        let verb = match dep.collection.as_str() {
            "instances" => "detach",
            "profiles" => "detach-profile",
            _ => continue,
        };
        tracing::warn!("Detaching volume {} from {}", volume, dep.name);
        let client = ctx.client.in_project(dep.project.clone());
        operations.push(Operation::run(
            Change::Detach {
                dependent: dep.name.clone(),
            },
            client.invocation(args!["storage", "volume", verb, &pool, volume, &dep.name]),
        ));
    }
    Ok(operations)
}
