//! Table-driven adapter for named resources
//!
//! Most kinds share one lifecycle: `show` to fetch, `create` to add,
//! `edit` (YAML on stdin) or per-key `set`/`unset` to update, `delete` to
//! remove. A [`KindTable`] captures the differences.

use crate::args;
use crate::client::Incus;
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, ConflictClassifier, DecodePolicy,
    FieldKind, FieldPolicy, Format, Invocation, Operation, Plan, ReconcileError, ResourceAdapter,
    ResourceIdentity, ResourceKind, Result, diff, merged_document,
};
use serde_json::{Map, Value};

use super::Presence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStyle {
    /// Rewrite the whole document through `edit`
    Edit,
    /// One `set`/`unset` per changed key
    Set,
}

/// Extra operations issued before a forced delete
pub type Cascade = fn(&CascadeContext<'_>) -> Result<Vec<Operation>>;

pub struct CascadeContext<'a> {
    pub exec: &'a dyn CommandExecutor,
    pub client: &'a Incus,
    /// Unqualified key parts
    pub key: &'a [String],
    pub current: &'a AttributeTree,
}

/// Static description of one resource kind
pub struct KindTable {
    pub kind: ResourceKind,
    /// Human name used in messages
    pub noun: &'static str,
    /// Response field holding the final state
    pub payload: &'static str,
    /// Sub-command prefix, e.g. `["network", "acl"]`
    pub command: &'static [&'static str],
    pub policy: FieldPolicy,
    pub update: UpdateStyle,
    pub decode: DecodePolicy,
    pub conflicts: &'static [&'static str],
    /// Flag appended to `delete` when forcing
    pub force_delete_flag: Option<&'static str>,
    pub cascade: Option<Cascade>,
}

pub struct TableAdapter {
    table: &'static KindTable,
    client: Incus,
    identity: ResourceIdentity,
    target: Vec<String>,
    presence: Presence,
    desired: AttributeTree,
    create_args: Vec<String>,
    member_args: Vec<String>,
    rename_from: Option<String>,
    authoritative: bool,
    force: bool,
    missing_for_create: Option<String>,
}

impl TableAdapter {
    pub fn new(
        table: &'static KindTable,
        client: Incus,
        key: Vec<String>,
        presence: Presence,
        desired: AttributeTree,
    ) -> Self {
        let identity = ResourceIdentity::new(client.scope().clone(), table.kind, key.clone());
        let mut target = key;
        if let Some(first) = target.first_mut() {
            *first = client.qualify(first);
        }
        Self {
            table,
            client,
            identity,
            target,
            presence,
            desired,
            create_args: Vec::new(),
            member_args: Vec::new(),
            rename_from: None,
            authoritative: false,
            force: false,
            missing_for_create: None,
        }
    }

    /// Arguments placed after the key on `create`
    pub fn create_args(mut self, args: Vec<String>) -> Self {
        self.create_args = args;
        self
    }

    /// Address a single cluster member with `--target`
    pub fn member(mut self, member: Option<String>) -> Self {
        self.member_args = member
            .map(|m| args!["--target", m])
            .unwrap_or_default();
        self
    }

    pub fn rename_from(mut self, from: Option<String>) -> Self {
        self.rename_from = from;
        self
    }

    /// Treat config/devices as the complete set: unlisted keys are removed
    pub fn authoritative(mut self, authoritative: bool) -> Self {
        self.authoritative = authoritative;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Fail with `message` if the resource has to be created
    pub fn require_for_create(mut self, missing: bool, message: impl Into<String>) -> Self {
        if missing {
            self.missing_for_create = Some(message.into());
        }
        self
    }

    pub fn client(&self) -> &Incus {
        &self.client
    }

    pub fn target(&self) -> &[String] {
        &self.target
    }

    pub fn table(&self) -> &'static KindTable {
        self.table
    }

    pub fn title(&self) -> String {
        format!("{} {}", self.table.noun, self.identity.qualified())
    }

    /// `<prefix> <verb> <key...> <tail...>`
    pub fn command(&self, verb: &str, tail: Vec<String>) -> Vec<String> {
        self.command_for(verb, self.target.clone(), tail)
    }

    fn command_for(&self, verb: &str, target: Vec<String>, tail: Vec<String>) -> Vec<String> {
        let mut args: Vec<String> = self.table.command.iter().map(|s| s.to_string()).collect();
        args.push(verb.to_string());
        args.extend(target);
        args.extend(tail);
        args
    }

    pub fn invocation(&self, verb: &str, tail: Vec<String>) -> Invocation {
        self.client.invocation(self.command(verb, tail))
    }

    fn show(&self, exec: &dyn CommandExecutor, target: Vec<String>) -> Result<Option<AttributeTree>> {
        let args = self.command_for("show", target, self.member_args.clone());
        self.client
            .read(exec, args, Format::Yaml, self.table.decode)
    }

    /// Operations deleting the resource, cascades first when forced
    pub fn delete_operations(
        &self,
        exec: &dyn CommandExecutor,
        current: &AttributeTree,
    ) -> Result<Vec<Operation>> {
        let mut operations = Vec::new();
        let mut tail = self.member_args.clone();
        if self.force {
            if let Some(cascade) = self.table.cascade {
                operations.extend(cascade(&CascadeContext {
                    exec,
                    client: &self.client,
                    key: &self.identity.key,
                    current,
                })?);
            }
            if let Some(flag) = self.table.force_delete_flag {
                tail.push(flag.to_string());
            }
        }
        operations.push(Operation::run(
            Change::Delete,
            self.invocation("delete", tail),
        ));
        Ok(operations)
    }

    /// Changes for an existing resource
    pub fn update_operations(&self, current: &AttributeTree) -> Result<Vec<Operation>> {
        let desired = if self.authoritative {
            authoritative_overlay(current, &self.desired, &self.table.policy)
        } else {
            self.desired.clone()
        };

        let changes = diff(current, &desired, &self.table.policy)?;
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        match self.table.update {
            UpdateStyle::Edit => {
                let doc = merged_document(current, &desired, &self.table.policy);
                Ok(vec![self.edit_operation(changes, &doc)?])
            }
            UpdateStyle::Set => changes.into_iter().map(|c| self.set_operation(c)).collect(),
        }
    }

    /// Create, followed by whatever the create call cannot set
    pub fn create_operations(&self) -> Result<Vec<Operation>> {
        if let Some(message) = &self.missing_for_create {
            return Err(ReconcileError::configuration(message.clone()));
        }
        let mut operations = Vec::new();
        let mut create_tail = self.create_args.clone();
        let empty = AttributeTree::default();

        match self.table.update {
            UpdateStyle::Set => {
                let config = self.create_config();
                create_tail.extend(config.iter().map(|(k, v)| format!("{}={}", k, scalar(v))));
                create_tail.extend(self.member_args.clone());
                operations.push(Operation::run(
                    Change::Create,
                    self.invocation("create", create_tail),
                ));

                let created = AttributeTree::default().with("config", Value::Object(config));
                for change in diff(&created, &self.desired, &self.table.policy)? {
                    operations.push(self.set_operation(change)?);
                }
            }
            UpdateStyle::Edit => {
                create_tail.extend(self.member_args.clone());
                operations.push(Operation::run(
                    Change::Create,
                    self.invocation("create", create_tail),
                ));

                let changes = diff(&empty, &self.desired, &self.table.policy)?;
                if !changes.is_empty() {
                    let doc = merged_document(&empty, &self.desired, &self.table.policy);
                    let rollback = self.invocation("delete", self.member_args.clone());
                    operations.push(self.edit_operation(changes, &doc)?.with_rollback(rollback));
                }
            }
        }
        Ok(operations)
    }

    fn create_config(&self) -> Map<String, Value> {
        let policy = &self.table.policy;
        policy
            .fields
            .iter()
            .filter(|rule| matches!(rule.kind, FieldKind::Config))
            .filter_map(|rule| self.desired.map(rule.name))
            .flat_map(|config| config.iter())
            .filter_map(|(k, v)| {
                policy
                    .normalization
                    .canonical(k, v)
                    .map(|v| (k.clone(), Value::String(v)))
            })
            .collect()
    }

    fn edit_operation(&self, changes: Vec<Change>, doc: &Value) -> Result<Operation> {
        let yaml = serde_yaml::to_string(doc)
            .map_err(|e| ReconcileError::Decode(e.into()))?;
        Ok(Operation::grouped(
            changes,
            self.invocation("edit", self.member_args.clone())
                .with_stdin(yaml),
        ))
    }

    fn set_operation(&self, change: Change) -> Result<Operation> {
        let (verb, mut tail) = match &change {
            Change::Set { key, value } => ("set", args![format!("{}={}", key, value)]),
            Change::Unset { key } => ("unset", args![key]),
            Change::SetProperty { key, value } => {
                ("set", args![format!("{}={}", key, value), "--property"])
            }
            Change::UnsetProperty { key } => ("unset", args![key, "--property"]),
            other => {
                return Err(ReconcileError::configuration(format!(
                    "{} cannot apply `{}`",
                    self.table.noun, other
                )));
            }
        };
        tail.extend(self.member_args.clone());
        Ok(Operation::run(change, self.invocation(verb, tail)))
    }
}

fn scalar(value: &Value) -> String {
    incusflow_core::scalar_string(value).unwrap_or_default()
}

/// Desired state extended with removals for every unlisted key
fn authoritative_overlay(
    current: &AttributeTree,
    desired: &AttributeTree,
    policy: &FieldPolicy,
) -> AttributeTree {
    let mut desired = desired.clone();
    for rule in policy.fields {
        if !matches!(rule.kind, FieldKind::Config | FieldKind::Devices) {
            continue;
        }
        let (Some(have), Some(want)) = (current.map(rule.name), desired.map(rule.name)) else {
            continue;
        };
        let mut want = want.clone();
        for key in have.keys() {
            if !key.starts_with("volatile.") && !want.contains_key(key) {
                want.insert(key.clone(), Value::Null);
            }
        }
        desired.insert(rule.name, Value::Object(want));
    }
    desired
}

impl ResourceAdapter for TableAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn payload_key(&self) -> &'static str {
        self.table.payload
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        self.show(exec, self.target.clone())
    }

    fn plan(&self, exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let title = self.title();

        if self.presence == Presence::Absent {
            return match current {
                None => Ok(Plan::unchanged(format!("{} is absent", title))),
                Some(current) => {
                    let changes: ChangeSet = self.delete_operations(exec, current)?.into_iter().collect();
                    Ok(Plan::new(changes, format!("{} deleted", title)))
                }
            };
        }

        let mut changes = ChangeSet::new();
        let mut base = current.cloned();
        let mut renamed = false;

        if let Some(from) = self.rename_from.as_deref().filter(|f| *f != self.identity.primary()) {
            let source = self.show(exec, vec![self.client.qualify(from)])?;
            match (source, current) {
                (Some(_), Some(_)) => {
                    return Err(ReconcileError::precondition(format!(
                        "cannot rename {} {} to {}: target already exists",
                        self.table.noun,
                        from,
                        self.identity.primary()
                    )));
                }
                (None, None) => {
                    return Err(ReconcileError::precondition(format!(
                        "cannot rename {} {}: source not found",
                        self.table.noun, from
                    )));
                }
                (Some(source), None) => {
                    let args =
                        self.command_for("rename", vec![self.client.qualify(from)], args![self.identity.primary()]);
                    changes.push(Operation::run(
                        Change::Rename {
                            from: from.to_string(),
                            to: self.identity.primary(),
                        },
                        self.client.invocation(args),
                    ));
                    base = Some(source);
                    renamed = true;
                }
                (None, Some(_)) => {}
            }
        }

        let message = match &base {
            None => {
                changes.extend(self.create_operations()?);
                format!("{} created", title)
            }
            Some(base) => {
                changes.extend(self.update_operations(base)?);
                if renamed {
                    format!("{} renamed", title)
                } else {
                    format!("{} updated", title)
                }
            }
        };

        if changes.is_empty() {
            return Ok(Plan::unchanged(format!("{} is up to date", title)));
        }
        Ok(Plan::new(changes, message))
    }

    fn conflicts(&self) -> ConflictClassifier {
        ConflictClassifier::new(self.table.conflicts)
    }
}

/// A resource listed in another resource's `used_by`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    /// API collection, e.g. `instances` or `storage-pools`
    pub collection: String,
    pub name: String,
    /// Remaining path segments
    pub rest: Vec<String>,
    pub project: Option<String>,
}

impl Dependent {
    pub fn parse(entry: &str) -> Option<Self> {
        let (path, query) = match entry.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (entry, None),
        };
        let mut segments = path.trim_start_matches('/').split('/').map(str::to_string);
        if segments.next().as_deref() != Some("1.0") {
            return None;
        }
        let collection = segments.next()?;
        let name = segments.next()?;
        let project = query.and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("project="))
                .map(str::to_string)
        });
        Some(Self {
            collection,
            name,
            rest: segments.collect(),
            project,
        })
    }
}

/// Parsed `used_by` entries of a resource
pub fn dependents(current: &AttributeTree) -> Vec<Dependent> {
    current
        .string_list("used_by")
        .iter()
        .filter_map(|entry| Dependent::parse(entry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_used_by() {
        let dep = Dependent::parse("/1.0/instances/c1?project=team-a").unwrap();
        assert_eq!(dep.collection, "instances");
        assert_eq!(dep.name, "c1");
        assert_eq!(dep.project.as_deref(), Some("team-a"));

        let dep = Dependent::parse("/1.0/storage-pools/default/volumes/custom/data").unwrap();
        assert_eq!(dep.collection, "storage-pools");
        assert_eq!(dep.rest, vec!["volumes", "custom", "data"]);

        assert!(Dependent::parse("/2.0/x/y").is_none());
    }
}
