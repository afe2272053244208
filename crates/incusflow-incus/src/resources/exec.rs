//! Commands run inside an instance
//!
//! Running a command is always reported as a change. A non-zero exit code
//! fails the request with the command's output attached.

use crate::args;
use crate::client::Incus;
use crate::request::{Common, Context};
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, Operation, Outcome, Plan, ReconcileError,
    ResourceAdapter, ResourceIdentity, ResourceKind, Result,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// An argv list, or one line split like a shell would
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Argv(Vec<String>),
    Line(String),
}

impl CommandSpec {
    pub fn argv(&self) -> Result<Vec<String>> {
        let argv = match self {
            CommandSpec::Argv(argv) => argv.clone(),
            CommandSpec::Line(line) => split_command(line)?,
        };
        if argv.is_empty() {
            return Err(ReconcileError::configuration("command is empty"));
        }
        Ok(argv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecMode {
    Interactive,
    NonInteractive,
}

impl ExecMode {
    fn as_str(self) -> &'static str {
        match self {
            ExecMode::Interactive => "interactive",
            ExecMode::NonInteractive => "non-interactive",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecParams {
    pub instance: String,
    pub command: CommandSpec,
    pub user: Option<u32>,
    pub group: Option<u32>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub mode: Option<ExecMode>,
    #[serde(flatten)]
    pub common: Common,
}

impl ExecParams {
    pub fn adapter(self, ctx: &Context) -> Result<ExecAdapter> {
        let command = self.command.argv()?;
        let client = ctx.client(&self.common);
        let instance = client.qualify(&self.instance);

        let mut args = args!["exec", &instance];
        if let Some(user) = self.user {
            args.push(format!("--user={}", user));
        }
        if let Some(group) = self.group {
            args.push(format!("--group={}", group));
        }
        if let Some(cwd) = &self.cwd {
            args.push(format!("--cwd={}", cwd));
        }
        for (key, value) in &self.env {
            args.push(format!("--env={}={}", key, value));
        }
        if let Some(mode) = self.mode {
            args.push(format!("--mode={}", mode.as_str()));
        }
        args.push("--".to_string());
        args.extend(command.iter().cloned());

        Ok(ExecAdapter {
            identity: ResourceIdentity::new(client.scope().clone(), ResourceKind::Exec, [self.instance]),
            client,
            args,
            command,
        })
    }
}

pub struct ExecAdapter {
    client: Incus,
    identity: ResourceIdentity,
    args: Vec<String>,
    command: Vec<String>,
}

impl ResourceAdapter for ExecAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn fetch(&self, _exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        Ok(None)
    }

    fn plan(&self, _exec: &dyn CommandExecutor, _current: Option<&AttributeTree>) -> Result<Plan> {
        let mut changes = ChangeSet::new();
        let command = self.command.join(" ");
        changes.push(
            Operation::run(
                Change::action("exec", &command),
                self.client.invocation(self.args.clone()),
            )
            .captured(),
        );
        Ok(Plan::new(
            changes,
            format!("Ran `{}` in {}", command, self.identity.qualified()),
        ))
    }

    fn finish(&self, outcome: &mut Outcome) -> Result<()> {
        if let Some(output) = outcome.captured.first() {
            outcome.payload.insert("rc".into(), Value::from(output.rc));
            outcome
                .payload
                .insert("stdout".into(), Value::String(output.stdout_str()));
            outcome
                .payload
                .insert("stderr".into(), Value::String(output.stderr_str()));
        }
        Ok(())
    }
}

/// Split a command line on whitespace, honouring quotes and backslashes
pub fn split_command(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(unterminated(line)),
                        },
                        Some(c) => word.push(c),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    word.push(c);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

fn unterminated(line: &str) -> ReconcileError {
    ReconcileError::configuration(format!("unterminated quote in command: {}", line))
}
