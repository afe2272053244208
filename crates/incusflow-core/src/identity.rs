//! Resource identity and client scope

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of resources incusflow reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    InstanceConfig,
    Image,
    Network,
    NetworkAcl,
    NetworkForward,
    NetworkZone,
    Profile,
    Project,
    StoragePool,
    StorageVolume,
    ClusterMember,
    ClusterGroup,
    Snapshot,
    Remote,
    File,
    Exec,
    Copy,
    Publish,
    Export,
    ServerInit,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Instance => "instance",
            ResourceKind::InstanceConfig => "instance_config",
            ResourceKind::Image => "image",
            ResourceKind::Network => "network",
            ResourceKind::NetworkAcl => "network_acl",
            ResourceKind::NetworkForward => "network_forward",
            ResourceKind::NetworkZone => "network_zone",
            ResourceKind::Profile => "profile",
            ResourceKind::Project => "project",
            ResourceKind::StoragePool => "storage_pool",
            ResourceKind::StorageVolume => "storage_volume",
            ResourceKind::ClusterMember => "cluster_member",
            ResourceKind::ClusterGroup => "cluster_group",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::Remote => "remote",
            ResourceKind::File => "file",
            ResourceKind::Exec => "exec",
            ResourceKind::Copy => "copy",
            ResourceKind::Publish => "publish",
            ResourceKind::Export => "export",
            ResourceKind::ServerInit => "server_init",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const LOCAL_REMOTE: &str = "local";
const DEFAULT_PROJECT: &str = "default";

/// Remote and project a request is addressed to
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub remote: Option<String>,
    pub project: Option<String>,
}

impl Scope {
    pub fn new(remote: Option<String>, project: Option<String>) -> Self {
        Self { remote, project }
    }

    /// Remote name when it needs a prefix (`local` never does)
    pub fn remote(&self) -> Option<&str> {
        self.remote
            .as_deref()
            .filter(|r| !r.is_empty() && *r != LOCAL_REMOTE)
    }

    /// Project name when it differs from `default`
    pub fn project(&self) -> Option<&str> {
        self.project
            .as_deref()
            .filter(|p| !p.is_empty() && *p != DEFAULT_PROJECT)
    }

    /// `remote:name`, or `name` on the local remote
    pub fn qualify(&self, name: &str) -> String {
        match self.remote() {
            Some(remote) => format!("{}:{}", remote, name),
            None => name.to_string(),
        }
    }

    /// `remote:` for sub-commands that take a bare remote argument
    pub fn remote_arg(&self) -> Option<String> {
        self.remote().map(|r| format!("{}:", r))
    }

    pub fn project_args(&self) -> Vec<String> {
        match self.project() {
            Some(project) => vec!["--project".to_string(), project.to_string()],
            None => Vec::new(),
        }
    }
}

/// Address of one resource within a scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub scope: Scope,
    pub kind: ResourceKind,

    /// Kind-dependent key parts, e.g. `[pool, volume]`
    pub key: Vec<String>,
}

impl ResourceIdentity {
    pub fn new<I, S>(scope: Scope, kind: ResourceKind, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scope,
            kind,
            key: key.into_iter().map(Into::into).collect(),
        }
    }

    /// Key parts joined with `/`
    pub fn primary(&self) -> String {
        self.key.join("/")
    }

    /// Remote-qualified primary key
    pub fn qualified(&self) -> String {
        self.scope.qualify(&self.primary())
    }

    /// Stable key for host-side caches
    pub fn cache_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.scope.remote().unwrap_or(LOCAL_REMOTE),
            self.scope.project().unwrap_or(DEFAULT_PROJECT),
            self.kind,
            self.primary()
        )
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.qualified())?;
        if let Some(project) = self.scope.project() {
            write!(f, " (project {})", project)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_remote_is_not_prefixed() {
        let scope = Scope::new(Some("local".into()), None);
        assert_eq!(scope.qualify("web"), "web");
        assert_eq!(scope.remote_arg(), None);

        let scope = Scope::new(Some("prod".into()), None);
        assert_eq!(scope.qualify("web"), "prod:web");
        assert_eq!(scope.remote_arg().as_deref(), Some("prod:"));
    }

    #[test]
    fn test_default_project_is_omitted() {
        assert!(Scope::new(None, Some("default".into())).project_args().is_empty());
        assert_eq!(
            Scope::new(None, Some("team-a".into())).project_args(),
            vec!["--project", "team-a"]
        );
    }

    #[test]
    fn test_identity_display_and_cache_key() {
        let id = ResourceIdentity::new(
            Scope::new(Some("prod".into()), Some("team-a".into())),
            ResourceKind::StorageVolume,
            ["pool1", "data"],
        );
        assert_eq!(id.to_string(), "storage_volume prod:pool1/data (project team-a)");
        assert_eq!(id.cache_key(), "prod/team-a/storage_volume/pool1/data");

        let local = ResourceIdentity::new(Scope::default(), ResourceKind::Profile, ["web"]);
        assert_eq!(local.cache_key(), "local/default/profile/web");
    }
}
