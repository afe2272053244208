use super::Host;
use colored::Colorize;
use incusflow_core::Scope;
use incusflow_incus::{Incus, ListFilter, query};

pub enum Lookup {
    Config(String),
    Info(String),
    List(ListFilter),
    Raw(String),
}

/// Run a read-only lookup and print the result as JSON
pub fn handle(
    host: &Host,
    remote: Option<String>,
    project: Option<String>,
    lookup: Lookup,
) -> anyhow::Result<bool> {
    let scope = Scope::new(
        remote.or_else(|| host.settings.remote.clone()),
        project.or_else(|| host.settings.project.clone()),
    );
    let client = Incus::new(host.settings.binary.clone(), scope);
    let exec = &host.executor;

    let result = match &lookup {
        Lookup::Config(name) => query::instance_config(exec, &client, name).map(|t| t.into_value()),
        Lookup::Info(name) => query::instance_info(exec, &client, name).map(|t| t.into_value()),
        Lookup::List(filter) => query::list_instances(exec, &client, filter),
        Lookup::Raw(path) => query::raw(exec, &client, path).map(|t| t.into_value()),
    };

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(true)
        }
        Err(e) => {
            println!("{}", e.to_response());
            eprintln!("{} {}", "✗".red().bold(), e.to_string().red());
            Ok(false)
        }
    }
}
