//! Client remotes
//!
//! Remotes live in the local client configuration, so these commands are
//! never qualified with a remote or scoped to a project.

use super::Presence;
use crate::args;
use crate::client::Incus;
use crate::request::{Common, Context};
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, Format, Operation, Plan,
    ReconcileError, ResourceAdapter, ResourceIdentity, ResourceKind, Result, Scope,
};
use serde::Deserialize;

fn default_protocol() -> String {
    "incus".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteParams {
    pub name: String,
    pub url: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub token: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub accept_certificate: bool,
    /// Default project on the remote
    pub remote_project: Option<String>,
    #[serde(default)]
    pub state: Presence,
    #[serde(flatten)]
    pub common: Common,
}

impl RemoteParams {
    pub fn adapter(self, ctx: &Context) -> Result<RemoteAdapter> {
        if self.token.is_some() && self.password.is_some() {
            return Err(ReconcileError::configuration(
                "token and password are mutually exclusive",
            ));
        }
        if self.name == "local" {
            return Err(ReconcileError::configuration("the local remote cannot be managed"));
        }

        let client = Incus::new(ctx.binary.clone(), Scope::default());
        Ok(RemoteAdapter {
            identity: ResourceIdentity::new(Scope::default(), ResourceKind::Remote, [self.name.clone()]),
            client,
            params: self,
        })
    }
}

pub struct RemoteAdapter {
    client: Incus,
    identity: ResourceIdentity,
    params: RemoteParams,
}

/// Address of a `remote list` entry
fn address(remote: &AttributeTree) -> Option<&str> {
    remote.str_field("Addr").or_else(|| remote.str_field("addr"))
}

impl RemoteAdapter {
    fn add_operation(&self) -> Result<Operation> {
        let p = &self.params;
        let url = p.url.as_deref().ok_or_else(|| {
            ReconcileError::configuration(format!("url is required to add remote {}", p.name))
        })?;
        let mut args = args!["remote", "add", &p.name, url, format!("--protocol={}", p.protocol)];
        if let Some(token) = &p.token {
            args.push(format!("--token={}", token));
        }
        if let Some(password) = &p.password {
            args.push(format!("--password={}", password));
        }
        if p.accept_certificate {
            args.push("--accept-certificate".to_string());
        }
        if let Some(project) = &p.remote_project {
            args.push(format!("--project={}", project));
        }
        Ok(Operation::run(Change::Create, self.client.invocation(args)))
    }
}

impl ResourceAdapter for RemoteAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        let remotes = self.client.read_checked(
            exec,
            args!["remote", "list", "--format=json"],
            Format::Json,
        )?;
        Ok(remotes
            .get(&self.params.name)
            .cloned()
            .map(AttributeTree::new))
    }

    fn plan(&self, _exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let name = &self.params.name;
        let title = format!("Remote {}", name);
        let mut changes = ChangeSet::new();

        let message = match (self.params.state, current) {
            (Presence::Absent, None) => return Ok(Plan::unchanged(format!("{} is absent", title))),
            (Presence::Absent, Some(_)) => {
                changes.push(Operation::run(
                    Change::Delete,
                    self.client.invocation(args!["remote", "remove", name]),
                ));
                format!("{} removed", title)
            }
            (Presence::Present, None) => {
                changes.push(self.add_operation()?);
                format!("{} added", title)
            }
            (Presence::Present, Some(current)) => {
                let Some(url) = &self.params.url else {
                    return Ok(Plan::unchanged(format!("{} is up to date", title)));
                };
                if address(current).map(|a| a.trim_end_matches('/')) == Some(url.trim_end_matches('/')) {
                    return Ok(Plan::unchanged(format!("{} is up to date", title)));
                }
                changes.push(Operation::run(
                    Change::SetProperty {
                        key: "url".to_string(),
                        value: url.clone(),
                    },
                    self.client.invocation(args!["remote", "set-url", name, url]),
                ));
                format!("{} updated", title)
            }
        };
        Ok(Plan::new(changes, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::Reconciler;
    use incusflow_core::mock::{ScriptedExecutor, ok};
    use serde_json::{Value, json};

    const REMOTES: &str = r#"{
        "local": {"Addr": "unix://", "Protocol": "incus", "Public": false},
        "prod": {"Addr": "https://192.0.2.5:8443", "Protocol": "incus", "Public": false}
    }"#;

    fn adapter(value: Value) -> RemoteAdapter {
        let ctx = Context {
            project: Some("team-a".into()),
            ..Default::default()
        };
        serde_json::from_value::<RemoteParams>(value)
            .unwrap()
            .adapter(&ctx)
            .unwrap()
    }

    #[test]
    fn test_add_remote_with_token() {
        let exec = ScriptedExecutor::new();
        exec.on(&["remote", "list"], ok(REMOTES));
        exec.on(&["remote", "add"], ok(""));

        Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "name": "staging",
                "url": "https://192.0.2.6:8443",
                "token": "abc123",
                "accept_certificate": true
            })))
            .unwrap();

        let lines: Vec<String> = exec.mutating_calls().iter().map(|c| c.command_line()).collect();
        assert_eq!(
            lines,
            vec![
                "incus remote add staging https://192.0.2.6:8443 --protocol=incus --token=abc123 --accept-certificate"
            ]
        );
    }

    #[test]
    fn test_same_url_is_up_to_date() {
        let exec = ScriptedExecutor::new();
        exec.on(&["remote", "list"], ok(REMOTES));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "prod", "url": "https://192.0.2.5:8443/"})))
            .unwrap();
        assert!(!outcome.changed);
    }

    #[test]
    fn test_changed_url() {
        let exec = ScriptedExecutor::new();
        exec.on(&["remote", "list"], ok(REMOTES));
        exec.on(&["remote", "set-url"], ok(""));

        Reconciler::new(&exec)
            .reconcile(&adapter(json!({"name": "prod", "url": "https://192.0.2.9:8443"})))
            .unwrap();
        assert!(exec.called(&["remote", "set-url", "prod", "https://192.0.2.9:8443"]));
    }

    #[test]
    fn test_token_and_password_exclusive() {
        let err = serde_json::from_value::<RemoteParams>(json!({
            "name": "x", "token": "a", "password": "b"
        }))
        .unwrap()
        .adapter(&Context::default())
        .err()
        .unwrap();
        assert!(matches!(err, ReconcileError::Configuration(_)));
    }
}
