//! Instance backups exported to a local tarball

use crate::args;
use crate::client::Incus;
use crate::request::{Common, Context};
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, Operation, Plan, ReconcileError,
    ResourceAdapter, ResourceIdentity, ResourceKind, Result, Step,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct ExportParams {
    pub instance: String,
    pub path: PathBuf,
    pub compression: Option<String>,
    #[serde(default)]
    pub optimized_storage: bool,
    #[serde(default)]
    pub instance_only: bool,
    #[serde(flatten)]
    pub common: Common,
}

impl ExportParams {
    pub fn adapter(self, ctx: &Context) -> Result<ExportAdapter> {
        if self.path.is_dir() {
            return Err(ReconcileError::configuration(format!(
                "{} is a directory",
                self.path.display()
            )));
        }
        let client = ctx.client(&self.common);
        let mut args = args![
            "export",
            client.qualify(&self.instance),
            self.path.display()
        ];
        if let Some(compression) = &self.compression {
            args.push(format!("--compression={}", compression));
        }
        if self.optimized_storage {
            args.push("--optimized-storage".to_string());
        }
        if self.instance_only {
            args.push("--instance-only".to_string());
        }

        Ok(ExportAdapter {
            identity: ResourceIdentity::new(
                client.scope().clone(),
                ResourceKind::Export,
                [self.instance],
            ),
            client,
            path: self.path,
            force: self.common.force,
            args,
        })
    }
}

pub struct ExportAdapter {
    client: Incus,
    identity: ResourceIdentity,
    path: PathBuf,
    force: bool,
    args: Vec<String>,
}

impl ResourceAdapter for ExportAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// The local backup file, if written
    fn fetch(&self, _exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() => Ok(Some(AttributeTree::new(json!({
                "path": self.path.display().to_string(),
                "size": meta.len(),
            })))),
            _ => Ok(None),
        }
    }

    fn plan(&self, _exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let display = self.path.display().to_string();
        let mut operation = Operation::run(
            Change::action("export", &display),
            self.client.invocation(self.args.clone()),
        );
        if current.is_some() {
            if !self.force {
                return Ok(Plan::unchanged(format!("{} already exists", display)));
            }
            operation = operation.before(Step::RemoveLocalFile(self.path.clone()));
        }
        let mut changes = ChangeSet::new();
        changes.push(operation);
        Ok(Plan::new(
            changes,
            format!("Instance {} exported to {}", self.identity.qualified(), display),
        ))
    }
}
