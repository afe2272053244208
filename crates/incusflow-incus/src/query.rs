//! Read-only queries
//!
//! These never mutate anything and are safe in check mode. Paths are sent
//! through `incus query`, which takes the project as a query parameter
//! rather than through `--project`.

use crate::args;
use crate::client::Incus;
use incusflow_core::{
    AttributeTree, CommandExecutor, DecodePolicy, Format, Result, Scope, decode,
};
use serde::Deserialize;
use serde_json::{Map, Value};

/// `path` with the scope's project appended as a query parameter
pub fn api_path(scope: &Scope, path: &str) -> String {
    let path = match scope.project() {
        Some(project) if path.contains('?') => format!("{}&project={}", path, project),
        Some(project) => format!("{}?project={}", path, project),
        None => path.to_string(),
    };
    scope.qualify(&path)
}

fn query_args(client: &Incus, path: &str) -> Vec<String> {
    args!["query", api_path(client.scope(), path)]
}

/// `incus query <path>`; the call must succeed
pub fn raw(exec: &dyn CommandExecutor, client: &Incus, path: &str) -> Result<AttributeTree> {
    client
        .unscoped()
        .read_checked(exec, query_args(client, path), Format::Json)
}

/// Like [`raw`] but a failed or empty answer means "not there"
pub fn probe(exec: &dyn CommandExecutor, client: &Incus, path: &str) -> Result<Option<AttributeTree>> {
    client.unscoped().read(
        exec,
        query_args(client, path),
        Format::Json,
        DecodePolicy::Lenient,
    )
}

/// Raw attributes of an instance
pub fn instance_config(exec: &dyn CommandExecutor, client: &Incus, name: &str) -> Result<AttributeTree> {
    raw(exec, client, &format!("/1.0/instances/{}", name))
}

/// Raw attributes with the runtime state merged in as `state`
pub fn instance_info(exec: &dyn CommandExecutor, client: &Incus, name: &str) -> Result<AttributeTree> {
    let mut info = instance_config(exec, client, name)?;
    let state = raw(exec, client, &format!("/1.0/instances/{}/state", name))?;
    info.insert("state", state.into_value());
    Ok(info)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub all_projects: bool,
    /// Query every remote speaking the incus protocol
    #[serde(default)]
    pub all_remotes: bool,
}

/// Instances matching the filters
///
/// With `all_remotes` the result maps each remote name to its list.
pub fn list_instances(exec: &dyn CommandExecutor, client: &Incus, filter: &ListFilter) -> Result<Value> {
    if !filter.all_remotes {
        return list_on(exec, client, filter);
    }

    let mut by_remote = Map::new();
    for remote in incus_remotes(exec, client)? {
        let on_remote = client.remote(Some(remote.clone()));
        by_remote.insert(remote, list_on(exec, &on_remote, filter)?);
    }
    Ok(Value::Object(by_remote))
}

fn list_on(exec: &dyn CommandExecutor, client: &Incus, filter: &ListFilter) -> Result<Value> {
    let mut args = args!["list"];
    args.extend(client.scope().remote_arg());
    args.extend(filter.filters.iter().cloned());
    args.push("--format=json".to_string());
    if filter.all_projects {
        args.push("--all-projects".to_string());
    }
    Ok(client.read_checked(exec, args, Format::Json)?.into_value())
}

/// Names of configured remotes using the incus protocol
fn incus_remotes(exec: &dyn CommandExecutor, client: &Incus) -> Result<Vec<String>> {
    let output = client
        .unscoped()
        .run_checked(exec, args!["remote", "list", "--format=json"])?;
    let remotes = decode(&output.stdout, Format::Json)?;
    Ok(remotes
        .value()
        .as_object()
        .map(|remotes| {
            remotes
                .iter()
                .filter(|(_, remote)| {
                    remote
                        .get("Protocol")
                        .or_else(|| remote.get("protocol"))
                        .and_then(Value::as_str)
                        == Some("incus")
                })
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::mock::{ScriptedExecutor, ok};

    #[test]
    fn test_api_path_project_parameter() {
        let scope = Scope::new(Some("prod".into()), Some("team-a".into()));
        assert_eq!(
            api_path(&scope, "/1.0/instances/c1"),
            "prod:/1.0/instances/c1?project=team-a"
        );
        assert_eq!(
            api_path(&scope, "/1.0/instances?recursion=1"),
            "prod:/1.0/instances?recursion=1&project=team-a"
        );
        assert_eq!(api_path(&Scope::default(), "/1.0"), "/1.0");
    }

    #[test]
    fn test_instance_info_merges_state() {
        let exec = ScriptedExecutor::new();
        exec.on(&["query", "/1.0/instances/c1"], ok(r#"{"name":"c1","type":"container"}"#));
        exec.on(&["query", "/1.0/instances/c1/state"], ok(r#"{"status":"Running","pid":42}"#));
        let client = Incus::new("incus", Scope::default());

        let info = instance_info(&exec, &client, "c1").unwrap();
        assert_eq!(info.str_field("type"), Some("container"));
        assert_eq!(info.value()["state"]["status"], "Running");
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_list_all_remotes() {
        let exec = ScriptedExecutor::new();
        exec.on(&["list", "--format=json"], ok(r#"[{"name":"c1"}]"#));
        exec.on(&["list", "prod:", "--format=json"], ok(r#"[{"name":"p1"}]"#));
        exec.on(
            &["remote", "list"],
            ok(r#"{"local":{"Protocol":"incus"},"images":{"Protocol":"simplestreams"},"prod":{"Protocol":"incus"}}"#),
        );
        let client = Incus::new("incus", Scope::default());

        let all = list_instances(
            &exec,
            &client,
            &ListFilter {
                all_remotes: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(all["local"][0]["name"], "c1");
        assert_eq!(all["prod"][0]["name"], "p1");
        assert!(all.get("images").is_none());
    }
}
