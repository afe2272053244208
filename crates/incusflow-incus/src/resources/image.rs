//! Images and their aliases

use crate::args;
use crate::client::Incus;
use crate::request::{Common, Context};
use incusflow_core::normalize::INCUS_CONFIG;
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, DecodePolicy, FieldKind, FieldPolicy,
    FieldRule, Format, Operation, Plan, ReconcileError, ResourceAdapter, ResourceIdentity,
    ResourceKind, Result, Step, diff,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

static FIELDS: [FieldRule; 3] = [
    FieldRule::new("public", FieldKind::Property),
    FieldRule::new("auto_update", FieldKind::Property),
    FieldRule::new("properties", FieldKind::Config),
];

static POLICY: FieldPolicy = FieldPolicy::new(&FIELDS, INCUS_CONFIG);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    #[default]
    Present,
    Absent,
    Exported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageParams {
    pub alias: Option<String>,
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub state: ImageState,
    /// Local file to import, or `remote:alias` to copy
    pub source: Option<String>,
    /// Aliases besides `alias`
    pub aliases: Option<Vec<String>>,
    pub properties: Option<Map<String, Value>>,
    pub public: Option<bool>,
    pub auto_update: Option<bool>,
    /// Export destination
    pub dest: Option<PathBuf>,
    #[serde(flatten)]
    pub common: Common,
}

impl ImageParams {
    pub fn adapter(self, ctx: &Context) -> Result<ImageAdapter> {
        let name = self
            .alias
            .clone()
            .or_else(|| self.fingerprint.clone())
            .ok_or_else(|| ReconcileError::configuration("alias or fingerprint is required"))?;

        let mut desired = AttributeTree::default();
        if let Some(public) = self.public {
            desired.insert("public", Value::Bool(public));
        }
        if let Some(auto_update) = self.auto_update {
            desired.insert("auto_update", Value::Bool(auto_update));
        }
        if let Some(properties) = &self.properties {
            desired.insert("properties", Value::Object(properties.clone()));
        }

        let mut aliases: Vec<String> = self.alias.iter().cloned().collect();
        for alias in self.aliases.iter().flatten() {
            if !aliases.contains(alias) {
                aliases.push(alias.clone());
            }
        }

        let client = ctx.client(&self.common);
        Ok(ImageAdapter {
            identity: ResourceIdentity::new(client.scope().clone(), ResourceKind::Image, [name.clone()]),
            target: client.qualify(&name),
            client,
            state: self.state,
            fingerprint: self.fingerprint,
            source: self.source,
            aliases,
            manage_aliases: self.aliases.is_some(),
            desired,
            dest: self.dest,
            force: self.common.force,
        })
    }
}

pub struct ImageAdapter {
    client: Incus,
    identity: ResourceIdentity,
    target: String,
    state: ImageState,
    fingerprint: Option<String>,
    source: Option<String>,
    aliases: Vec<String>,
    /// Whether extra aliases were listed, making the alias set authoritative
    manage_aliases: bool,
    desired: AttributeTree,
    dest: Option<PathBuf>,
    force: bool,
}

fn alias_names(current: &AttributeTree) -> Vec<String> {
    current
        .get("aliases")
        .and_then(Value::as_array)
        .map(|aliases| {
            aliases
                .iter()
                .filter_map(|a| a.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

impl ImageAdapter {
    fn title(&self) -> String {
        format!("Image {}", self.identity.qualified())
    }

    fn create_operation(&self) -> Result<Operation> {
        let source = self.source.as_deref().ok_or_else(|| {
            ReconcileError::configuration(format!(
                "source is required to create image {}",
                self.identity.primary()
            ))
        })?;

        let import = Path::new(source).exists();
        let mut args = if import {
            let mut args = args!["image", "import", source];
            args.extend(self.client.scope().remote_arg());
            args
        } else {
            let destination = self
                .client
                .scope()
                .remote_arg()
                .unwrap_or_else(|| "local:".to_string());
            args!["image", "copy", source, destination]
        };
        for alias in &self.aliases {
            args.extend(args!["--alias", alias]);
        }
        if self.desired.bool_field("public") == Some(true) {
            args.push("--public".to_string());
        }
        if self.desired.bool_field("auto_update") == Some(true) && !import {
            args.push("--auto-update".to_string());
        }
        Ok(Operation::run(Change::Create, self.client.invocation(args)))
    }

    /// `image edit` with the current document and the desired overrides
    fn edit_operation(&self, current: &AttributeTree, changes: Vec<Change>) -> Result<Operation> {
        let mut doc = current.value().as_object().cloned().unwrap_or_default();
        for field in ["public", "auto_update"] {
            if let Some(value) = self.desired.bool_field(field) {
                doc.insert(field.to_string(), Value::Bool(value));
            }
        }
        if let Some(want) = self.desired.map("properties") {
            let mut properties = current.map("properties").cloned().unwrap_or_default();
            for (key, value) in want {
                match POLICY.normalization.canonical(key, value) {
                    Some(value) => properties.insert(key.clone(), Value::String(value)),
                    None => properties.remove(key),
                };
            }
            doc.insert("properties".to_string(), Value::Object(properties));
        }
        let yaml = serde_yaml::to_string(&Value::Object(doc))
            .map_err(|e| ReconcileError::Decode(e.into()))?;
        Ok(Operation::grouped(
            changes,
            self.client
                .invocation(args!["image", "edit", &self.target])
                .with_stdin(yaml),
        ))
    }

    fn alias_operations(&self, current: &AttributeTree) -> Vec<Operation> {
        let have = alias_names(current);
        let Some(fingerprint) = current.str_field("fingerprint") else {
            return Vec::new();
        };
        let mut operations = Vec::new();
        for alias in self.aliases.iter().filter(|a| !have.contains(a)) {
            operations.push(Operation::run(
                Change::action("add alias", alias),
                self.client.invocation(args![
                    "image",
                    "alias",
                    "create",
                    self.client.qualify(alias),
                    fingerprint
                ]),
            ));
        }
        if self.manage_aliases {
            for alias in have.iter().filter(|a| !self.aliases.contains(a)) {
                operations.push(Operation::run(
                    Change::action("remove alias", alias),
                    self.client.invocation(args![
                        "image",
                        "alias",
                        "delete",
                        self.client.qualify(alias)
                    ]),
                ));
            }
        }
        operations
    }

    fn plan_export(&self, current: Option<&AttributeTree>) -> Result<Plan> {
        let dest = self
            .dest
            .as_ref()
            .ok_or_else(|| ReconcileError::configuration("dest is required to export an image"))?;
        if current.is_none() {
            return Err(ReconcileError::precondition(format!("{} does not exist", self.title())));
        }
        let display = dest.display().to_string();
        let mut operation = Operation::run(
            Change::action("export", &display),
            self.client
                .invocation(args!["image", "export", &self.target, &display]),
        );
        if dest.exists() {
            if !self.force {
                return Ok(Plan::unchanged(format!("{} already exists", display)));
            }
            operation = operation.before(Step::RemoveLocalFile(dest.clone()));
        }
        let mut changes = ChangeSet::new();
        changes.push(operation);
        Ok(Plan::new(changes, format!("{} exported to {}", self.title(), display)))
    }
}

impl ResourceAdapter for ImageAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        self.client.read(
            exec,
            args!["image", "show", &self.target],
            Format::Yaml,
            DecodePolicy::Strict,
        )
    }

    fn plan(&self, _exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let title = self.title();
        match (self.state, current) {
            (ImageState::Exported, current) => self.plan_export(current),
            (ImageState::Absent, None) => Ok(Plan::unchanged(format!("{} is absent", title))),
            (ImageState::Absent, Some(current)) => {
                let actual = current.str_field("fingerprint").unwrap_or_default();
                if let Some(expected) = &self.fingerprint {
                    if !actual.starts_with(expected.as_str()) {
                        return Err(ReconcileError::precondition(format!(
                            "refusing to delete {}: fingerprint {} does not match {}",
                            title, actual, expected
                        )));
                    }
                }
                let mut changes = ChangeSet::new();
                changes.push(Operation::run(
                    Change::Delete,
                    self.client.invocation(args!["image", "delete", &self.target]),
                ));
                Ok(Plan::new(changes, format!("{} deleted", title)))
            }
            (ImageState::Present, None) => {
                let mut changes = ChangeSet::new();
                changes.push(self.create_operation()?);
                Ok(Plan::new(changes, format!("{} created", title)))
            }
            (ImageState::Present, Some(current)) => {
                let mut changes = ChangeSet::new();
                let updates = diff(current, &self.desired, &POLICY)?;
                if !updates.is_empty() {
                    changes.push(self.edit_operation(current, updates)?);
                }
                changes.extend(self.alias_operations(current));
                if changes.is_empty() {
                    return Ok(Plan::unchanged(format!("{} is up to date", title)));
                }
                Ok(Plan::new(changes, format!("{} updated", title)))
            }
        }
    }
}
