//! First-time server initialization from a preseed document

use crate::args;
use crate::client::Incus;
use crate::request::{Common, Context};
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, DecodePolicy, Format, Operation, Plan,
    ReconcileError, ResourceAdapter, ResourceIdentity, ResourceKind, Result, Scope,
};
use serde::Deserialize;
use serde_json::{Value, json};

/// A preseed as a mapping or as YAML text
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Preseed {
    Document(serde_json::Map<String, Value>),
    Text(String),
}

impl Preseed {
    fn to_yaml(&self) -> Result<String> {
        match self {
            Preseed::Document(doc) => Ok(serde_yaml::to_string(doc).map_err(|e| {
                ReconcileError::configuration(format!("cannot render preseed: {}", e))
            })?),
            Preseed::Text(text) => {
                let parsed: Value = serde_yaml::from_str(text).map_err(|e| {
                    ReconcileError::configuration(format!("invalid preseed YAML: {}", e))
                })?;
                if !parsed.is_object() {
                    return Err(ReconcileError::configuration("preseed must be a mapping"));
                }
                Ok(text.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInitParams {
    pub preseed: Preseed,
    #[serde(flatten)]
    pub common: Common,
}

impl ServerInitParams {
    pub fn adapter(self, ctx: &Context) -> Result<ServerInitAdapter> {
        Ok(ServerInitAdapter {
            client: Incus::new(ctx.binary.clone(), Scope::default()),
            identity: ResourceIdentity::new(Scope::default(), ResourceKind::ServerInit, ["local"]),
            preseed: self.preseed.to_yaml()?,
            force: self.common.force,
        })
    }
}

pub struct ServerInitAdapter {
    client: Incus,
    identity: ResourceIdentity,
    preseed: String,
    force: bool,
}

impl ResourceAdapter for ServerInitAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn payload_key(&self) -> &'static str {
        "server"
    }

    /// Present once the server has at least one storage pool
    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        let pools = self
            .client
            .read(
                exec,
                args!["storage", "list", "--format=json"],
                Format::Json,
                DecodePolicy::Lenient,
            )?
            .map(|list| list.items().to_vec())
            .unwrap_or_default();
        if pools.is_empty() {
            return Ok(None);
        }
        Ok(Some(AttributeTree::new(json!({ "storage_pools": pools }))))
    }

    fn plan(&self, _exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        if current.is_some() && !self.force {
            return Ok(Plan::unchanged(
                "Server is already initialized (storage pools found)",
            ));
        }
        let invocation = self
            .client
            .invocation(args!["admin", "init", "--preseed"])
            .with_stdin(self.preseed.as_bytes());
        let mut changes = ChangeSet::new();
        changes.push(Operation::run(Change::action("init", "server"), invocation));
        Ok(Plan::new(changes, "Server initialized from preseed"))
    }
}
