//! Instance copy and move, possibly across remotes

use crate::args;
use crate::client::Incus;
use crate::query;
use crate::request::{Common, Context};
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, Operation, Plan, ReconcileError,
    ResourceAdapter, ResourceIdentity, ResourceKind, Result,
};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    #[default]
    Pull,
    Push,
    Relay,
}

impl TransferMode {
    fn as_str(self) -> &'static str {
        match self {
            TransferMode::Pull => "pull",
            TransferMode::Push => "push",
            TransferMode::Relay => "relay",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopyParams {
    pub source: String,
    pub dest: String,
    #[serde(default, rename = "move")]
    pub move_instance: bool,
    #[serde(default)]
    pub instance_only: bool,
    #[serde(default)]
    pub mode: TransferMode,
    pub storage: Option<String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub no_profiles: bool,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(flatten)]
    pub common: Common,
}

/// An instance name with an optional `remote:` prefix
struct Location {
    client: Incus,
    name: String,
}

impl Location {
    fn parse(client: &Incus, name: &str) -> Self {
        match name.split_once(':') {
            Some((remote, name)) => Self {
                client: client.remote(Some(remote.to_string())),
                name: name.to_string(),
            },
            None => Self {
                client: client.clone(),
                name: name.to_string(),
            },
        }
    }

    fn qualified(&self) -> String {
        self.client.qualify(&self.name)
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        query::probe(exec, &self.client, &format!("/1.0/instances/{}", self.name))
    }
}

impl CopyParams {
    pub fn adapter(self, ctx: &Context) -> Result<CopyAdapter> {
        if self.no_profiles && !self.profiles.is_empty() {
            return Err(ReconcileError::configuration(
                "profiles and no_profiles are mutually exclusive",
            ));
        }
        let client = ctx.client(&self.common);
        let source = Location::parse(&client, &self.source);
        let dest = Location::parse(&client, &self.dest);
        if source.qualified() == dest.qualified() {
            return Err(ReconcileError::configuration("source and dest are the same instance"));
        }

        let verb = if self.move_instance { "move" } else { "copy" };
        let mut args = args![verb, source.qualified(), dest.qualified()];
        if self.instance_only {
            args.push("--instance-only".to_string());
        }
        if self.mode != TransferMode::Pull {
            args.push(format!("--mode={}", self.mode.as_str()));
        }
        if let Some(storage) = &self.storage {
            args.push(format!("--storage={}", storage));
        }
        if self.no_profiles {
            args.push("--no-profiles".to_string());
        }
        for profile in &self.profiles {
            args.push(format!("--profile={}", profile));
        }
        if self.ephemeral {
            args.push("--ephemeral".to_string());
        }

        Ok(CopyAdapter {
            identity: ResourceIdentity::new(
                client.scope().clone(),
                ResourceKind::Copy,
                [self.source, self.dest],
            ),
            client,
            source,
            dest,
            move_instance: self.move_instance,
            args,
        })
    }
}

pub struct CopyAdapter {
    client: Incus,
    identity: ResourceIdentity,
    source: Location,
    dest: Location,
    move_instance: bool,
    args: Vec<String>,
}

impl ResourceAdapter for CopyAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// The destination instance
    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        self.dest.fetch(exec)
    }

    fn plan(&self, exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let source = self.source.qualified();
        let dest = self.dest.qualified();
        let dest_exists = current.is_some();

        if !self.move_instance {
            if dest_exists {
                return Ok(Plan::unchanged(format!("Instance {} already exists", dest)));
            }
            if self.source.fetch(exec)?.is_none() {
                return Err(ReconcileError::precondition(format!(
                    "cannot copy {}: source not found",
                    source
                )));
            }
            let mut changes = ChangeSet::new();
            changes.push(Operation::run(
                Change::action("copy", format!("{} -> {}", source, dest)),
                self.client.invocation(self.args.clone()),
            ));
            return Ok(Plan::new(changes, format!("Instance {} copied to {}", source, dest)));
        }

        let source_exists = self.source.fetch(exec)?.is_some();
        match (source_exists, dest_exists) {
            (false, true) => Ok(Plan::unchanged(format!("Instance {} already moved", dest))),
            (true, false) => {
                let mut changes = ChangeSet::new();
                changes.push(Operation::run(
                    Change::Rename {
                        from: source.clone(),
                        to: dest.clone(),
                    },
                    self.client.invocation(self.args.clone()),
                ));
                Ok(Plan::new(changes, format!("Instance {} moved to {}", source, dest)))
            }
            (true, true) => Err(ReconcileError::precondition(format!(
                "cannot move {} to {}: destination already exists",
                source, dest
            ))),
            (false, false) => Err(ReconcileError::precondition(format!(
                "cannot move {}: source not found",
                source
            ))),
        }
    }
}
