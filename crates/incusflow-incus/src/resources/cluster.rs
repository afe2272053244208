//! Cluster members and cluster groups

use super::{KindTable, Presence, TableAdapter, UpdateStyle};
use crate::args;
use crate::client::Incus;
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, DecodePolicy, FieldKind, FieldPolicy,
    FieldRule, Format, Operation, Outcome, Plan, ReconcileError, ResourceAdapter,
    ResourceIdentity, ResourceKind, Result, diff,
};
use serde::Deserialize;
use serde_json::{Map, Value};

static MEMBER_FIELDS: [FieldRule; 3] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
    FieldRule::new("groups", FieldKind::List),
];

static MEMBER_POLICY: FieldPolicy = FieldPolicy::new(&MEMBER_FIELDS, INCUS_CONFIG);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    /// Turn a standalone server into the first cluster member
    Enabled,
    #[default]
    Present,
    Absent,
    /// Report the cluster members without changing anything
    Listed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterMemberParams {
    pub name: String,
    #[serde(default)]
    pub state: MemberState,
    pub description: Option<String>,
    pub config: Option<Map<String, Value>>,
    pub groups: Option<Vec<String>>,
    #[serde(flatten)]
    pub common: Common,
}

impl ClusterMemberParams {
    pub fn adapter(self, ctx: &Context) -> Result<ClusterMemberAdapter> {
        let client = ctx.client(&self.common).unscoped();
        let mut desired = AttributeTree::default();
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }
        if let Some(config) = &self.config {
            desired.insert("config", Value::Object(config.clone()));
        }
        if let Some(groups) = &self.groups {
            desired.insert("groups", serde_json::json!(groups));
        }

        Ok(ClusterMemberAdapter {
            identity: ResourceIdentity::new(
                client.scope().clone(),
                ResourceKind::ClusterMember,
                [self.name.clone()],
            ),
            target: client.qualify(&self.name),
            client,
            state: self.state,
            desired,
            force: self.common.force,
        })
    }
}

pub struct ClusterMemberAdapter {
    client: Incus,
    identity: ResourceIdentity,
    target: String,
    state: MemberState,
    desired: AttributeTree,
    force: bool,
}

impl ClusterMemberAdapter {
    fn set_operation(&self, change: Change) -> Result<Operation> {
        let args = match &change {
            Change::Set { key, value } => {
                args!["cluster", "set", &self.target, format!("{}={}", key, value)]
            }
            Change::Unset { key } => args!["cluster", "unset", &self.target, key],
            Change::SetProperty { key, value } => args![
                "cluster",
                "set",
                &self.target,
                format!("{}={}", key, value),
                "--property"
            ],
            Change::UnsetProperty { key } => {
                args!["cluster", "unset", &self.target, key, "--property"]
            }
            Change::ReplaceList { values, .. } => {
                args!["cluster", "group", "assign", &self.target, values.join(",")]
            }
            other => {
                return Err(ReconcileError::configuration(format!(
                    "cluster member cannot apply `{}`",
                    other
                )));
            }
        };
        Ok(Operation::run(change, self.client.invocation(args)))
    }
}

impl ResourceAdapter for ClusterMemberAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn payload_key(&self) -> &'static str {
        match self.state {
            MemberState::Listed => "members",
            _ => "member",
        }
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        match self.state {
            MemberState::Listed => {
                let mut args = args!["cluster", "list"];
                args.extend(self.client.scope().remote_arg());
                args.push("--format=json".to_string());
                self.client.read(
                    exec,
                    args,
                    Format::Json,
                    DecodePolicy::Strict,
                )
            }
            _ => self.client.read(
                exec,
                args!["cluster", "show", &self.target],
                Format::Yaml,
                DecodePolicy::Strict,
            ),
        }
    }

    fn plan(&self, _exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let name = &self.target;
        match (self.state, current) {
            (MemberState::Listed, _) => Ok(Plan::unchanged("Cluster members listed")),
            (MemberState::Enabled, Some(_)) => Ok(Plan::unchanged(format!(
                "Clustering is already enabled on {}",
                name
            ))),
            (MemberState::Enabled, None) => {
                let mut changes = ChangeSet::new();
                changes.push(Operation::run(
                    Change::action("enable clustering on", name.clone()),
                    self.client.invocation(args!["cluster", "enable", name]),
                ));
                Ok(Plan::new(changes, format!("Clustering enabled on {}", name)))
            }
            (MemberState::Absent, None) => {
                Ok(Plan::unchanged(format!("Cluster member {} is absent", name)))
            }
            (MemberState::Absent, Some(_)) => {
                let mut args = args!["cluster", "remove", name];
                if self.force {
                    args.extend(args!["--force", "--yes"]);
                }
                let mut changes = ChangeSet::new();
                changes.push(Operation::run(Change::Delete, self.client.invocation(args)));
                Ok(Plan::new(changes, format!("Cluster member {} removed", name)))
            }
            (MemberState::Present, None) => {
                let mut changes = ChangeSet::new();
                changes.push(
                    Operation::run(
                        Change::Create,
                        self.client.invocation(args!["cluster", "add", name]),
                    )
                    .captured(),
                );
                Ok(Plan::new(changes, format!("Cluster member {} added", name)))
            }
            (MemberState::Present, Some(current)) => {
                let changes: ChangeSet = diff(current, &self.desired, &MEMBER_POLICY)?
                    .into_iter()
                    .map(|change| self.set_operation(change))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .collect();
                if changes.is_empty() {
                    return Ok(Plan::unchanged(format!("Cluster member {} is up to date", name)));
                }
                Ok(Plan::new(changes, format!("Cluster member {} updated", name)))
            }
        }
    }

    fn finish(&self, outcome: &mut Outcome) -> Result<()> {
        if let Some(token) = outcome.captured.first().and_then(|out| join_token(&out.stdout_str())) {
            outcome
                .payload
                .insert("join_token".to_string(), Value::String(token));
        }
        Ok(())
    }
}

/// Token printed by `cluster add`, the last non-empty output line
fn join_token(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .filter(|line| !line.ends_with(':'))
        .map(str::to_string)
}

static GROUP_FIELDS: [FieldRule; 3] = [
    FieldRule::new("description", FieldKind::Property),
    FieldRule::new("config", FieldKind::Config),
    FieldRule::new("members", FieldKind::List),
];

pub static GROUP_TABLE: KindTable = KindTable {
    kind: ResourceKind::ClusterGroup,
    noun: "Cluster group",
    payload: "group",
    command: &["cluster", "group"],
    policy: FieldPolicy::new(&GROUP_FIELDS, INCUS_CONFIG),
    update: UpdateStyle::Edit,
    decode: DecodePolicy::Strict,
    conflicts: &["in use", "not empty"],
    force_delete_flag: None,
    cascade: None,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterGroupParams {
    pub name: String,
    #[serde(default)]
    pub state: Presence,
    pub description: Option<String>,
    #[serde(flatten)]
    pub common: Common,
}

impl ClusterGroupParams {
    pub fn adapter(self, ctx: &Context) -> Result<TableAdapter> {
        let mut desired = AttributeTree::default();
        if let Some(description) = &self.description {
            desired.insert("description", Value::String(description.clone()));
        }
        Ok(TableAdapter::new(
            &GROUP_TABLE,
            ctx.client(&self.common).unscoped(),
            vec![self.name],
            self.state,
            desired,
        )
        .force(self.common.force))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::Reconciler;
    use incusflow_core::mock::{ScriptedExecutor, ok};
    use serde_json::json;

    const NODE2: &str = "\
server_name: node2
url: https://192.0.2.2:8443
description: \"\"
status: Online
config:
  scheduler.instance: all
groups:
- default
- gpu
";

    fn member(value: Value) -> ClusterMemberAdapter {
        serde_json::from_value::<ClusterMemberParams>(value)
            .unwrap()
            .adapter(&Context::default())
            .unwrap()
    }

    #[test]
    fn test_add_returns_join_token() {
        let exec = ScriptedExecutor::new();
        exec.on(
            &["cluster", "add", "node3"],
            ok("Member node3 join token:\neyJzZXJ2ZXJfbmFtZSI6Im5vZGUzIn0=\n"),
        );

        let outcome = Reconciler::new(&exec).reconcile(&member(json!({"name": "node3"}))).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.payload["join_token"], "eyJzZXJ2ZXJfbmFtZSI6Im5vZGUzIn0=");
    }

    #[test]
    fn test_groups_compare_as_set() {
        let exec = ScriptedExecutor::new();
        exec.on(&["cluster", "show", "node2"], ok(NODE2));

        let outcome = Reconciler::new(&exec)
            .reconcile(&member(json!({"name": "node2", "groups": ["gpu", "default"]})))
            .unwrap();
        assert!(!outcome.changed);
    }

    #[test]
    fn test_groups_assigned_in_bulk() {
        let exec = ScriptedExecutor::new();
        exec.on(&["cluster", "show", "node2"], ok(NODE2));
        exec.on(&["cluster", "group", "assign"], ok(""));

        Reconciler::new(&exec)
            .reconcile(&member(json!({"name": "node2", "groups": ["default", "ssd"]})))
            .unwrap();
        assert!(exec.called(&["cluster", "group", "assign", "node2", "default,ssd"]));
    }

    #[test]
    fn test_forced_remove() {
        let exec = ScriptedExecutor::new();
        exec.once(&["cluster", "show", "node2"], ok(NODE2));
        exec.on(&["cluster", "remove"], ok(""));

        Reconciler::new(&exec)
            .reconcile(&member(json!({"name": "node2", "state": "absent", "force": true})))
            .unwrap();
        assert!(exec.called(&["cluster", "remove", "node2", "--force", "--yes"]));
    }

    #[test]
    fn test_listed_is_read_only() {
        let exec = ScriptedExecutor::new();
        exec.on(
            &["cluster", "list"],
            ok(r#"[{"server_name":"node1","status":"Online"}]"#),
        );

        let outcome = Reconciler::new(&exec)
            .reconcile(&member(json!({"name": "node1", "state": "listed"})))
            .unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.payload["members"][0]["server_name"], "node1");
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_join_token_parsing() {
        assert_eq!(join_token("Member x join token:\nabc\n").as_deref(), Some("abc"));
        assert_eq!(join_token("Member x join token:\n"), None);
    }

    #[test]
    fn test_group_edit_keeps_members() {
        let exec = ScriptedExecutor::new();
        exec.on(
            &["cluster", "group", "show", "gpu"],
            ok("name: gpu\ndescription: \"\"\nconfig: {}\nmembers:\n- node2\n"),
        );
        exec.on(&["cluster", "group", "edit", "gpu"], ok(""));

        let adapter = serde_json::from_value::<ClusterGroupParams>(json!({
            "name": "gpu",
            "description": "GPU nodes"
        }))
        .unwrap()
        .adapter(&Context::default())
        .unwrap();
        Reconciler::new(&exec).reconcile(&adapter).unwrap();

        let call = exec.mutating_calls().remove(0);
        let doc: Value = serde_yaml::from_slice(&call.stdin.unwrap()).unwrap();
        assert_eq!(doc["members"], json!(["node2"]));
        assert_eq!(doc["description"], "GPU nodes");
    }
}
