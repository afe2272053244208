//! Caller request format
//!
//! A request is a flat mapping tagged with `kind`, optionally carrying a
//! schema `version` and a `check_mode` flag. A request file holds one
//! request, a list of them, or a mapping with a `requests` list.

use crate::client::Incus;
use crate::resources::{
    admin_init::ServerInitParams,
    cluster::{ClusterGroupParams, ClusterMemberParams},
    copy::CopyParams,
    exec::ExecParams,
    export::ExportParams,
    file::FileParams,
    image::ImageParams,
    instance::InstanceParams,
    instance_config::InstanceConfigParams,
    network::NetworkParams,
    network_acl::NetworkAclParams,
    network_forward::NetworkForwardParams,
    network_zone::NetworkZoneParams,
    profile::ProfileParams,
    project::ProjectParams,
    publish::PublishParams,
    remote::RemoteParams,
    snapshot::SnapshotParams,
    storage_pool::StoragePoolParams,
    storage_volume::StorageVolumeParams,
};
use incusflow_core::{ReconcileError, ResourceAdapter, ResourceKind, Result, Scope};
use serde::Deserialize;
use serde_json::Value;

pub const REQUEST_VERSION: u64 = 1;

/// Fields shared by every request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Common {
    pub remote: Option<String>,
    pub project: Option<String>,
    #[serde(default)]
    pub force: bool,
}

/// Host-supplied defaults used to build clients
#[derive(Debug, Clone)]
pub struct Context {
    pub binary: String,
    pub remote: Option<String>,
    pub project: Option<String>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            binary: "incus".to_string(),
            remote: None,
            project: None,
        }
    }
}

impl Context {
    pub fn client(&self, common: &Common) -> Incus {
        Incus::new(
            self.binary.clone(),
            Scope::new(
                common.remote.clone().or_else(|| self.remote.clone()),
                common.project.clone().or_else(|| self.project.clone()),
            ),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Instance(InstanceParams),
    InstanceConfig(InstanceConfigParams),
    Image(ImageParams),
    Network(NetworkParams),
    NetworkAcl(NetworkAclParams),
    NetworkForward(NetworkForwardParams),
    NetworkZone(NetworkZoneParams),
    Profile(ProfileParams),
    Project(ProjectParams),
    StoragePool(StoragePoolParams),
    StorageVolume(StorageVolumeParams),
    ClusterMember(ClusterMemberParams),
    ClusterGroup(ClusterGroupParams),
    Snapshot(SnapshotParams),
    Remote(RemoteParams),
    File(FileParams),
    Exec(ExecParams),
    Copy(CopyParams),
    Publish(PublishParams),
    Export(ExportParams),
    ServerInit(ServerInitParams),
}

impl Request {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Request::Instance(_) => ResourceKind::Instance,
            Request::InstanceConfig(_) => ResourceKind::InstanceConfig,
            Request::Image(_) => ResourceKind::Image,
            Request::Network(_) => ResourceKind::Network,
            Request::NetworkAcl(_) => ResourceKind::NetworkAcl,
            Request::NetworkForward(_) => ResourceKind::NetworkForward,
            Request::NetworkZone(_) => ResourceKind::NetworkZone,
            Request::Profile(_) => ResourceKind::Profile,
            Request::Project(_) => ResourceKind::Project,
            Request::StoragePool(_) => ResourceKind::StoragePool,
            Request::StorageVolume(_) => ResourceKind::StorageVolume,
            Request::ClusterMember(_) => ResourceKind::ClusterMember,
            Request::ClusterGroup(_) => ResourceKind::ClusterGroup,
            Request::Snapshot(_) => ResourceKind::Snapshot,
            Request::Remote(_) => ResourceKind::Remote,
            Request::File(_) => ResourceKind::File,
            Request::Exec(_) => ResourceKind::Exec,
            Request::Copy(_) => ResourceKind::Copy,
            Request::Publish(_) => ResourceKind::Publish,
            Request::Export(_) => ResourceKind::Export,
            Request::ServerInit(_) => ResourceKind::ServerInit,
        }
    }

    /// Validate the parameters and bind them to an adapter
    pub fn adapter(self, ctx: &Context) -> Result<Box<dyn ResourceAdapter>> {
        Ok(match self {
            Request::Instance(p) => Box::new(p.adapter(ctx)?),
            Request::InstanceConfig(p) => Box::new(p.adapter(ctx)?),
            Request::Image(p) => Box::new(p.adapter(ctx)?),
            Request::Network(p) => Box::new(p.adapter(ctx)?),
            Request::NetworkAcl(p) => Box::new(p.adapter(ctx)?),
            Request::NetworkForward(p) => Box::new(p.adapter(ctx)?),
            Request::NetworkZone(p) => Box::new(p.adapter(ctx)?),
            Request::Profile(p) => Box::new(p.adapter(ctx)?),
            Request::Project(p) => Box::new(p.adapter(ctx)?),
            Request::StoragePool(p) => Box::new(p.adapter(ctx)?),
            Request::StorageVolume(p) => Box::new(p.adapter(ctx)?),
            Request::ClusterMember(p) => Box::new(p.adapter(ctx)?),
            Request::ClusterGroup(p) => Box::new(p.adapter(ctx)?),
            Request::Snapshot(p) => Box::new(p.adapter(ctx)?),
            Request::Remote(p) => Box::new(p.adapter(ctx)?),
            Request::File(p) => Box::new(p.adapter(ctx)?),
            Request::Exec(p) => Box::new(p.adapter(ctx)?),
            Request::Copy(p) => Box::new(p.adapter(ctx)?),
            Request::Publish(p) => Box::new(p.adapter(ctx)?),
            Request::Export(p) => Box::new(p.adapter(ctx)?),
            Request::ServerInit(p) => Box::new(p.adapter(ctx)?),
        })
    }
}

/// A request plus its envelope fields
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub version: u64,
    pub check_mode: bool,
    pub request: Request,
}

impl RequestEnvelope {
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(ReconcileError::configuration("request must be a mapping"));
        };

        let version = match fields.remove("version") {
            None => REQUEST_VERSION,
            Some(v) => v.as_u64().ok_or_else(|| {
                ReconcileError::configuration(format!("invalid request version: {}", v))
            })?,
        };
        if version != REQUEST_VERSION {
            return Err(ReconcileError::configuration(format!(
                "unsupported request version {} (expected {})",
                version, REQUEST_VERSION
            )));
        }

        let check_mode = match fields.remove("check_mode") {
            None => false,
            Some(v) => v.as_bool().ok_or_else(|| {
                ReconcileError::configuration("check_mode must be a boolean")
            })?,
        };

        let kind = fields
            .get("kind")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ReconcileError::configuration("request has no kind"))?;

        let request: Request = serde_json::from_value(Value::Object(fields)).map_err(|e| {
            ReconcileError::configuration(format!("invalid {} request: {}", kind, e))
        })?;

        Ok(Self {
            version,
            check_mode,
            request,
        })
    }
}

/// Parse a YAML or JSON request document
pub fn parse_requests(text: &str) -> Result<Vec<RequestEnvelope>> {
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| ReconcileError::configuration(format!("malformed request document: {}", e)))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) if map.contains_key("requests") => {
            match map.remove("requests") {
                Some(Value::Array(items)) => items,
                _ => return Err(ReconcileError::configuration("`requests` must be a list")),
            }
        }
        single => vec![single],
    };

    items.into_iter().map(RequestEnvelope::from_value).collect()
}
