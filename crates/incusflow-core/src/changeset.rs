//! Mutation intents and the plan that carries them

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tempfile::TempPath;

/// One atomic mutation intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Create,
    Delete,
    Rename {
        from: String,
        to: String,
    },
    /// Top-level property such as `description`
    SetProperty {
        key: String,
        value: String,
    },
    UnsetProperty {
        key: String,
    },
    Set {
        key: String,
        value: String,
    },
    Unset {
        key: String,
    },
    AddDevice {
        name: String,
        device_type: String,
        attrs: BTreeMap<String, String>,
    },
    SetDeviceAttr {
        device: String,
        key: String,
        value: String,
    },
    UnsetDeviceAttr {
        device: String,
        key: String,
    },
    RemoveDevice {
        name: String,
    },
    /// Bulk replacement of a list field
    ReplaceList {
        field: String,
        values: Vec<String>,
    },
    /// Full rewrite of a structured list through `edit`
    ReplaceStructure {
        field: String,
    },
    Transition {
        verb: Transition,
    },
    /// Release a dependent before a forced delete
    Detach {
        dependent: String,
    },
    /// Kind-specific action (push, export, restore, ...)
    Action {
        verb: String,
        target: String,
    },
}

impl Change {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Change::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn unset(key: impl Into<String>) -> Self {
        Change::Unset { key: key.into() }
    }

    pub fn action(verb: impl Into<String>, target: impl Into<String>) -> Self {
        Change::Action {
            verb: verb.into(),
            target: target.into(),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete | Change::Detach { .. })
    }

    fn category(&self) -> ChangeCategory {
        match self {
            Change::Create => ChangeCategory::Create,
            Change::Delete | Change::Detach { .. } => ChangeCategory::Delete,
            Change::Transition { .. } | Change::Action { .. } => ChangeCategory::Other,
            _ => ChangeCategory::Update,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Create => write!(f, "create"),
            Change::Delete => write!(f, "delete"),
            Change::Rename { from, to } => write!(f, "rename {} -> {}", from, to),
            Change::SetProperty { key, value } => write!(f, "set property {}={}", key, value),
            Change::UnsetProperty { key } => write!(f, "unset property {}", key),
            Change::Set { key, value } => write!(f, "set {}={}", key, value),
            Change::Unset { key } => write!(f, "unset {}", key),
            Change::AddDevice {
                name, device_type, ..
            } => write!(f, "add device {} ({})", name, device_type),
            Change::SetDeviceAttr { device, key, value } => {
                write!(f, "set device {}.{}={}", device, key, value)
            }
            Change::UnsetDeviceAttr { device, key } => {
                write!(f, "unset device {}.{}", device, key)
            }
            Change::RemoveDevice { name } => write!(f, "remove device {}", name),
            Change::ReplaceList { field, values } => {
                write!(f, "replace {} [{}]", field, values.join(", "))
            }
            Change::ReplaceStructure { field } => write!(f, "replace {}", field),
            Change::Transition { verb } => write!(f, "{}", verb),
            Change::Detach { dependent } => write!(f, "detach {}", dependent),
            Change::Action { verb, target } => write!(f, "{} {}", verb, target),
        }
    }
}

/// Instance power-state verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
    Rebuild,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Start => write!(f, "start"),
            Transition::Stop => write!(f, "stop"),
            Transition::Restart => write!(f, "restart"),
            Transition::Freeze => write!(f, "freeze"),
            Transition::Unfreeze => write!(f, "unfreeze"),
            Transition::Rebuild => write!(f, "rebuild"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeCategory {
    Create,
    Update,
    Delete,
    Other,
}

/// A single client call: full argv plus optional stdin document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv, stdin: None }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// One step of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Run(Invocation),
    /// Host-side removal of a local file
    RemoveLocalFile(PathBuf),
}

/// The steps that realize one or more changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub changes: Vec<Change>,
    pub steps: Vec<Step>,

    /// Keep the client output for the response payload
    pub capture: bool,

    /// Best-effort undo issued when a step fails
    pub rollback: Option<Invocation>,
}

impl Operation {
    pub fn run(change: Change, invocation: Invocation) -> Self {
        Self::grouped(vec![change], invocation)
    }

    pub fn grouped(changes: Vec<Change>, invocation: Invocation) -> Self {
        Self {
            changes,
            steps: vec![Step::Run(invocation)],
            capture: false,
            rollback: None,
        }
    }

    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn before(mut self, step: Step) -> Self {
        self.steps.insert(0, step);
        self
    }

    pub fn captured(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn with_rollback(mut self, invocation: Invocation) -> Self {
        self.rollback = Some(invocation);
        self
    }

    /// Whether a failure should be checked for a dependency conflict
    pub fn is_delete(&self) -> bool {
        self.changes.iter().any(Change::is_delete)
    }
}

/// Ordered list of operations produced for one resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    operations: Vec<Operation>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn extend(&mut self, operations: impl IntoIterator<Item = Operation>) {
        self.operations.extend(operations);
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// All intents in execution order
    pub fn changes(&self) -> Vec<&Change> {
        self.operations.iter().flat_map(|op| op.changes.iter()).collect()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.changes().iter().map(|c| c.to_string()).collect()
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for change in self.changes() {
            match change.category() {
                ChangeCategory::Create => summary.create += 1,
                ChangeCategory::Update => summary.update += 1,
                ChangeCategory::Delete => summary.delete += 1,
                ChangeCategory::Other => summary.other += 1,
            }
        }
        summary
    }
}

impl FromIterator<Operation> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        Self {
            operations: iter.into_iter().collect(),
        }
    }
}

/// Counts of planned changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub other: usize,
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} other",
            self.create, self.update, self.delete, self.other
        )
    }
}

/// What an adapter intends to do for one reconciliation
#[derive(Debug, Default)]
pub struct Plan {
    pub changes: ChangeSet,

    /// Human-readable result message
    pub message: String,

    /// Extra response fields known at plan time
    pub payload: Map<String, Value>,

    /// Local scratch files that must outlive the apply phase
    pub scratch: Vec<TempPath>,
}

impl Plan {
    pub fn new(changes: ChangeSet, message: impl Into<String>) -> Self {
        Self {
            changes,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn unchanged(message: impl Into<String>) -> Self {
        Self::new(ChangeSet::new(), message)
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn keep_scratch(mut self, path: TempPath) -> Self {
        self.scratch.push(path);
        self
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}
