//! Instances (containers and virtual machines)
//!
//! Existence comes from `list`, runtime status from the state endpoint.
//! Config and devices are updated key by key; profiles are reassigned in
//! one call when the set differs.

use crate::args;
use crate::client::Incus;
use crate::query;
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, ConflictClassifier, DecodePolicy,
    FieldKind, FieldPolicy, FieldRule, Format, Operation, Plan, ReconcileError, ResourceAdapter,
    ResourceIdentity, ResourceKind, Result, Transition, diff,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

static FIELDS: [FieldRule; 4] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
    FieldRule::new("devices", FieldKind::Devices),
    FieldRule::new("profiles", FieldKind::List),
];

pub static POLICY: FieldPolicy = FieldPolicy::new(&FIELDS, INCUS_CONFIG);

/// A running instance refuses a delete without force
const INSTANCE_CONFLICTS: [&str; 3] = ["currently running", "in use", "still in use"];

const CLOUD_INIT_KEYS: [(&str, &str); 3] = [
    ("user_data", "cloud-init.user-data"),
    ("network_config", "cloud-init.network-config"),
    ("vendor_data", "cloud-init.vendor-data"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Present,
    Absent,
    Restarted,
    Frozen,
    Unfrozen,
    Rebuilt,
}

impl InstanceState {
    fn verb(self) -> &'static str {
        match self {
            InstanceState::Present => "create",
            InstanceState::Absent => "delete",
            InstanceState::Restarted => "restart",
            InstanceState::Frozen => "freeze",
            InstanceState::Unfrozen => "unfreeze",
            InstanceState::Rebuilt => "rebuild",
        }
    }
}

fn default_started() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceParams {
    pub name: String,
    #[serde(default)]
    pub state: InstanceState,
    #[serde(default = "default_started")]
    pub started: bool,
    /// Image as `remote:alias`
    pub source: Option<String>,
    #[serde(default)]
    pub empty: bool,
    #[serde(default)]
    pub vm: bool,
    #[serde(default)]
    pub ephemeral: bool,
    pub instance_type: Option<String>,
    pub profiles: Option<Vec<String>>,
    #[serde(default)]
    pub no_profiles: bool,
    pub network: Option<String>,
    pub storage: Option<String>,
    pub target: Option<String>,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    pub devices: Option<Map<String, Value>>,
    pub cloud_init_user_data: Option<String>,
    pub cloud_init_network_config: Option<String>,
    pub cloud_init_vendor_data: Option<String>,
    #[serde(default)]
    pub cloud_init_disk: bool,
    #[serde(flatten)]
    pub common: Common,
}

impl InstanceParams {
    pub fn adapter(self, ctx: &Context) -> Result<InstanceAdapter> {
        if self.no_profiles && self.profiles.is_some() {
            return Err(ReconcileError::configuration(
                "profiles and no_profiles are mutually exclusive",
            ));
        }
        if self.empty && self.source.is_some() {
            return Err(ReconcileError::configuration(
                "source and empty are mutually exclusive",
            ));
        }

        let desired = self.desired();
        let client = ctx.client(&self.common);
        Ok(InstanceAdapter {
            identity: ResourceIdentity::new(
                client.scope().clone(),
                ResourceKind::Instance,
                [self.name.clone()],
            ),
            target: client.qualify(&self.name),
            client,
            name: self.name,
            state: self.state,
            started: self.started,
            desired,
            force: self.common.force,
            create: CreateOptions {
                source: self.source,
                empty: self.empty,
                vm: self.vm,
                ephemeral: self.ephemeral,
                instance_type: self.instance_type,
                no_profiles: self.no_profiles,
                network: self.network,
                storage: self.storage,
                member: self.target,
            },
        })
    }

    fn desired(&self) -> AttributeTree {
        let mut desired = AttributeTree::default();
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }

        let mut config = self.config.clone().unwrap_or_default();
        let cloud_init = [
            &self.cloud_init_user_data,
            &self.cloud_init_network_config,
            &self.cloud_init_vendor_data,
        ];
        for ((_, key), value) in CLOUD_INIT_KEYS.iter().zip(cloud_init) {
            if let Some(value) = value {
                config.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        if self.config.is_some() || !config.is_empty() {
            desired.insert("config", Value::Object(config));
        }

        let mut devices = self.devices.clone().unwrap_or_default();
        if self.cloud_init_disk {
            devices.insert(
                "cloud-init".to_string(),
                json!({"type": "disk", "source": "cloud-init:config"}),
            );
        }
        if self.devices.is_some() || !devices.is_empty() {
            desired.insert("devices", Value::Object(devices));
        }

        if self.no_profiles {
            desired.insert("profiles", json!([]));
        } else if let Some(profiles) = &self.profiles {
            desired.insert("profiles", json!(profiles));
        }
        desired
    }
}

#[derive(Debug, Clone)]
struct CreateOptions {
    source: Option<String>,
    empty: bool,
    vm: bool,
    ephemeral: bool,
    instance_type: Option<String>,
    no_profiles: bool,
    network: Option<String>,
    storage: Option<String>,
    member: Option<String>,
}

pub struct InstanceAdapter {
    client: Incus,
    identity: ResourceIdentity,
    name: String,
    target: String,
    state: InstanceState,
    started: bool,
    desired: AttributeTree,
    force: bool,
    create: CreateOptions,
}

/// Runtime status: from the merged state, else the list entry
pub fn status(current: &AttributeTree) -> &str {
    current
        .get("state")
        .and_then(|state| state.get("status"))
        .and_then(Value::as_str)
        .or_else(|| current.str_field("status"))
        .unwrap_or("Stopped")
}

/// Map one config or device change onto `incus config ...`
pub(crate) fn config_operation(client: &Incus, instance: &str, change: Change) -> Result<Operation> {
    let args = match &change {
        Change::Set { key, value } => {
            args!["config", "set", instance, format!("{}={}", key, value)]
        }
        Change::Unset { key } => args!["config", "unset", instance, key],
        Change::SetProperty { key, value } => args![
            "config",
            "set",
            instance,
            format!("{}={}", key, value),
            "--property"
        ],
        Change::UnsetProperty { key } => args!["config", "unset", instance, key, "--property"],
        Change::AddDevice {
            name,
            device_type,
            attrs,
        } => {
            let mut args = args!["config", "device", "add", instance, name, device_type];
            args.extend(attrs.iter().map(|(k, v)| format!("{}={}", k, v)));
            args
        }
        Change::SetDeviceAttr { device, key, value } => args![
            "config",
            "device",
            "set",
            instance,
            device,
            format!("{}={}", key, value)
        ],
        Change::UnsetDeviceAttr { device, key } => {
            args!["config", "device", "unset", instance, device, key]
        }
        Change::RemoveDevice { name } => args!["config", "device", "remove", instance, name],
        Change::ReplaceList { values, .. } => {
            args!["profile", "assign", instance, values.join(",")]
        }
        other => {
            return Err(ReconcileError::configuration(format!(
                "instance config cannot apply `{}`",
                other
            )));
        }
    };
    Ok(Operation::run(change, client.invocation(args)))
}

impl InstanceAdapter {
    fn title(&self) -> String {
        format!("Instance {}", self.identity.qualified())
    }

    fn transition(&self, verb: Transition, args: Vec<String>) -> Operation {
        Operation::run(Change::Transition { verb }, self.client.invocation(args))
    }

    fn start(&self) -> Operation {
        self.transition(Transition::Start, args!["start", &self.target])
    }

    fn stop(&self) -> Operation {
        let mut args = args!["stop", &self.target];
        if self.force {
            args.push("--force".to_string());
        }
        self.transition(Transition::Stop, args)
    }

    fn create_operations(&self) -> Result<Vec<Operation>> {
        let opts = &self.create;
        let mut args = match (&opts.source, opts.empty) {
            (Some(source), _) => args!["init", source, &self.target],
            (None, true) => args!["init", &self.target, "--empty"],
            (None, false) => {
                return Err(ReconcileError::configuration(format!(
                    "source or empty is required to create instance {}",
                    self.name
                )));
            }
        };
        if opts.vm {
            args.push("--vm".to_string());
        }
        if opts.ephemeral {
            args.push("--ephemeral".to_string());
        }
        if let Some(instance_type) = &opts.instance_type {
            args.extend(args!["--type", instance_type]);
        }
        if opts.no_profiles {
            args.push("--no-profiles".to_string());
        }
        for profile in self.desired.string_list("profiles") {
            args.extend(args!["--profile", profile]);
        }
        if let Some(network) = &opts.network {
            args.extend(args!["--network", network]);
        }
        if let Some(storage) = &opts.storage {
            args.extend(args!["--storage", storage]);
        }
        if let Some(member) = &opts.member {
            args.extend(args!["--target", member]);
        }

        let mut created = AttributeTree::default();
        if let Some(config) = self.desired.map("config") {
            let mut applied = Map::new();
            for (key, value) in config {
                if let Some(value) = POLICY.normalization.canonical(key, value) {
                    args.extend(args!["--config", format!("{}={}", key, value)]);
                    applied.insert(key.clone(), Value::String(value));
                }
            }
            created.insert("config", Value::Object(applied));
        }
        if let Some(profiles) = self.desired.get("profiles") {
            created.insert("profiles", profiles.clone());
        }

        let mut operations = vec![Operation::run(Change::Create, self.client.invocation(args))];
        let rollback = self
            .client
            .invocation(args!["delete", &self.target, "--force"]);
        for change in diff(&created, &self.desired, &POLICY)? {
            operations.push(
                config_operation(&self.client, &self.target, change)?
                    .with_rollback(rollback.clone()),
            );
        }
        if self.started {
            operations.push(self.start());
        }
        Ok(operations)
    }

    fn rebuild(&self) -> Result<Operation> {
        let mut args = match (&self.create.source, self.create.empty) {
            (Some(source), _) => args!["rebuild", source, &self.target],
            (None, true) => args!["rebuild", &self.target, "--empty"],
            (None, false) => {
                return Err(ReconcileError::configuration(format!(
                    "source or empty is required to rebuild instance {}",
                    self.name
                )));
            }
        };
        if self.force {
            args.push("--force".to_string());
        }
        Ok(self.transition(Transition::Rebuild, args))
    }

    /// Power-state change requested for an existing instance
    fn state_operation(&self, status: &str) -> Result<Option<Operation>> {
        let not_running = || {
            ReconcileError::precondition(format!(
                "cannot {} instance {}: status is {}",
                self.state.verb(),
                self.name,
                status
            ))
        };
        Ok(match (self.state, status) {
            (InstanceState::Present, "Running") if !self.started => Some(self.stop()),
            (InstanceState::Present, "Frozen") if !self.started => Some(self.stop()),
            (InstanceState::Present, "Frozen") => Some(self.transition(
                Transition::Unfreeze,
                args!["resume", &self.target],
            )),
            (InstanceState::Present, "Running") => None,
            (InstanceState::Present, _) if self.started => Some(self.start()),
            (InstanceState::Present, _) => None,
            (InstanceState::Restarted, "Running" | "Frozen") => {
                let mut args = args!["restart", &self.target];
                if self.force {
                    args.push("--force".to_string());
                }
                Some(self.transition(Transition::Restart, args))
            }
            (InstanceState::Restarted, _) => Some(self.start()),
            (InstanceState::Frozen, "Frozen") => None,
            (InstanceState::Frozen, "Running") => Some(self.transition(
                Transition::Freeze,
                args!["pause", &self.target],
            )),
            (InstanceState::Frozen, _) => return Err(not_running()),
            (InstanceState::Unfrozen, "Frozen") => Some(self.transition(
                Transition::Unfreeze,
                args!["resume", &self.target],
            )),
            (InstanceState::Unfrozen, "Running") => None,
            (InstanceState::Unfrozen, _) => return Err(not_running()),
            (InstanceState::Rebuilt | InstanceState::Absent, _) => None,
        })
    }

    fn message(&self) -> String {
        let outcome = match self.state {
            InstanceState::Restarted => "restarted",
            InstanceState::Frozen => "frozen",
            InstanceState::Unfrozen => "unfrozen",
            InstanceState::Rebuilt => "rebuilt",
            InstanceState::Present | InstanceState::Absent => "updated",
        };
        format!("{} {}", self.title(), outcome)
    }
}

impl ResourceAdapter for InstanceAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        let filter = self.client.qualify(&format!("^{}$", self.name));
        let Some(list) = self.client.read(
            exec,
            args!["list", filter, "--format=json"],
            Format::Json,
            DecodePolicy::Lenient,
        )?
        else {
            return Ok(None);
        };
        let Some(found) = list
            .items()
            .iter()
            .find(|item| item.get("name").and_then(Value::as_str) == Some(self.name.as_str()))
        else {
            return Ok(None);
        };

        let mut instance = AttributeTree::new(found.clone());
        let path = format!("/1.0/instances/{}/state", self.name);
        if let Some(state) = query::probe(exec, &self.client, &path)? {
            instance.insert("state", state.into_value());
        }
        Ok(Some(instance))
    }

    fn plan(&self, _exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let title = self.title();
        let Some(current) = current else {
            return match self.state {
                InstanceState::Absent => Ok(Plan::unchanged(format!("{} is absent", title))),
                InstanceState::Present => {
                    let changes: ChangeSet = self.create_operations()?.into_iter().collect();
                    Ok(Plan::new(changes, format!("{} created", title)))
                }
                other => Err(ReconcileError::precondition(format!(
                    "cannot {} instance {}: it does not exist",
                    other.verb(),
                    self.name
                ))),
            };
        };

        let mut changes = ChangeSet::new();
        if self.state == InstanceState::Absent {
            let mut args = args!["delete", &self.target];
            if self.force {
                args.push("--force".to_string());
            }
            changes.push(Operation::run(Change::Delete, self.client.invocation(args)));
            return Ok(Plan::new(changes, format!("{} deleted", title)));
        }

        if self.state == InstanceState::Rebuilt {
            changes.push(self.rebuild()?);
        }
        for change in diff(current, &self.desired, &POLICY)? {
            changes.push(config_operation(&self.client, &self.target, change)?);
        }
        changes.extend(self.state_operation(status(current))?);

        if changes.is_empty() {
            return Ok(Plan::unchanged(format!("{} is up to date", title)));
        }
        Ok(Plan::new(changes, self.message()))
    }

    fn conflicts(&self) -> ConflictClassifier {
        ConflictClassifier::new(&INSTANCE_CONFLICTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::Reconciler;
    use incusflow_core::mock::{ScriptedExecutor, fail, ok};

    const C1: &str = r#"[{
        "name": "c1",
        "status": "Running",
        "description": "",
        "profiles": ["default", "web"],
        "config": {"image.os": "Debian", "limits.cpu": "2", "volatile.base_image": "abc"},
        "devices": {"data": {"type": "disk", "source": "/srv/data", "path": "/mnt"}}
    }]"#;

    fn adapter(value: Value) -> InstanceAdapter {
        serde_json::from_value::<InstanceParams>(value)
            .unwrap()
            .adapter(&Context::default())
            .unwrap()
    }

    fn running(exec: &ScriptedExecutor) {
        exec.on(&["list", "^c1$"], ok(C1));
        exec.on(
            &["query", "/1.0/instances/c1/state"],
            ok(r#"{"status": "Running", "status_code": 103}"#),
        );
    }

    fn stopped(exec: &ScriptedExecutor) {
        exec.on(&["list", "^c1$"], ok(&C1.replace("Running", "Stopped")));
        exec.on(
            &["query", "/1.0/instances/c1/state"],
            ok(r#"{"status": "Stopped", "status_code": 102}"#),
        );
    }

    fn mutating(exec: &ScriptedExecutor) -> Vec<String> {
        exec.mutating_calls().iter().map(|c| c.command_line()).collect()
    }

    #[test]
    fn test_create_from_image() {
        let exec = ScriptedExecutor::new();
        exec.on(&["list", "^c2$"], ok("[]"));
        exec.on(&["init"], ok(""));
        exec.on(&["config", "device", "add"], ok(""));
        exec.on(&["start", "c2"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "name": "c2",
                "source": "images:debian/12",
                "profiles": ["default"],
                "config": {"limits.cpu": 2, "security.nesting": "yes"},
                "devices": {"data": {"type": "disk", "source": "/srv/data", "path": "/mnt"}},
                "cloud_init_user_data": "#cloud-config\n"
            })))
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.msg, "Instance c2 created");
        assert_eq!(
            mutating(&exec),
            vec![
                "incus init images:debian/12 c2 --profile default \
                 --config cloud-init.user-data=#cloud-config\n \
                 --config limits.cpu=2 --config security.nesting=true",
                "incus config device add c2 data disk path=/mnt source=/srv/data",
                "incus start c2",
            ]
        );
    }

    #[test]
    fn test_create_requires_source() {
        let exec = ScriptedExecutor::new();
        let err = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c2"})))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Configuration(_)));
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_exclusive_options() {
        let err = serde_json::from_value::<InstanceParams>(json!({
            "name": "c1", "profiles": ["default"], "no_profiles": true
        }))
        .unwrap()
        .adapter(&Context::default())
        .err()
        .unwrap();
        assert!(matches!(err, ReconcileError::Configuration(_)));
    }

    #[test]
    fn test_running_instance_up_to_date() {
        let exec = ScriptedExecutor::new();
        running(&exec);

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "name": "c1",
                "profiles": ["web", "default"],
                "config": {"limits.cpu": 2}
            })))
            .unwrap();

        assert!(!outcome.changed);
        assert_eq!(outcome.payload["instance"]["state"]["status"], "Running");
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_device_update_is_not_destructive() {
        let exec = ScriptedExecutor::new();
        running(&exec);
        exec.on(&["config", "device", "set"], ok(""));

        Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c1", "devices": {"data": {"path": "/data"}}})))
            .unwrap();

        assert_eq!(mutating(&exec), vec!["incus config device set c1 data path=/data"]);
    }

    #[test]
    fn test_profiles_assigned_in_bulk() {
        let exec = ScriptedExecutor::new();
        running(&exec);
        exec.on(&["profile", "assign"], ok(""));

        Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c1", "profiles": ["default", "gpu"]})))
            .unwrap();

        assert_eq!(mutating(&exec), vec!["incus profile assign c1 default,gpu"]);
    }

    #[test]
    fn test_stop_when_not_started() {
        let exec = ScriptedExecutor::new();
        running(&exec);
        exec.on(&["stop", "c1"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c1", "started": false, "force": true})))
            .unwrap();

        assert_eq!(outcome.changes, vec!["stop"]);
        assert_eq!(mutating(&exec), vec!["incus stop c1 --force"]);
    }

    #[test]
    fn test_freeze_stopped_instance_is_precondition() {
        let exec = ScriptedExecutor::new();
        stopped(&exec);

        let err = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c1", "state": "frozen"})))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Precondition(_)));
    }

    #[test]
    fn test_freeze_running_instance() {
        let exec = ScriptedExecutor::new();
        running(&exec);
        exec.on(&["pause", "c1"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c1", "state": "frozen"})))
            .unwrap();
        assert_eq!(outcome.msg, "Instance c1 frozen");
        assert_eq!(mutating(&exec), vec!["incus pause c1"]);
    }

    #[test]
    fn test_restart_missing_instance_is_precondition() {
        let exec = ScriptedExecutor::new();
        let err = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c9", "state": "restarted"})))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Precondition(_)));
    }

    #[test]
    fn test_check_mode_predicts_without_mutating() {
        let exec = ScriptedExecutor::new();
        stopped(&exec);

        let outcome = Reconciler::new(&exec)
            .check_mode(true)
            .reconcile(&adapter(json!({"name": "c1", "config": {"limits.memory": "1GiB"}})))
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.changes, vec!["set limits.memory=1GiB", "start"]);
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_delete_forces() {
        let exec = ScriptedExecutor::new();
        running(&exec);
        exec.on(&["delete", "c1", "--force"], ok(""));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c1", "state": "absent", "force": true})))
            .unwrap();
        assert_eq!(outcome.msg, "Instance c1 deleted");
        assert!(exec.called(&["delete", "c1", "--force"]));
    }

    #[test]
    fn test_delete_running_without_force() {
        let exec = ScriptedExecutor::new();
        running(&exec);
        exec.on(
            &["delete", "c1"],
            fail(1, "Error: The instance is currently running, stop it first"),
        );

        let err = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "c1", "state": "absent", "force": false})))
            .unwrap_err();

        assert!(matches!(err, ReconcileError::DependencyConflict { .. }));
        assert_eq!(mutating(&exec), vec!["incus delete c1"]);
        assert!(!exec.called(&["--force"]));
    }
}
