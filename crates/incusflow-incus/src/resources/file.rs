//! Files inside instances
//!
//! Remote content is inspected by pulling it into a local temporary file.
//! Pushes and pulls are skipped when the content already matches.

use crate::args;
use crate::client::Incus;
use crate::request::{Common, Context};
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, Operation, Plan, ReconcileError,
    ResourceAdapter, ResourceIdentity, ResourceKind, Result,
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    #[default]
    Pushed,
    Pulled,
    Absent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileParams {
    pub instance: String,
    #[serde(default)]
    pub state: FileState,
    /// Local file to push, or path inside the instance to pull
    pub src: Option<String>,
    /// Literal content to push
    pub content: Option<String>,
    /// Path inside the instance, or local destination when pulling
    pub dest: String,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub mode: Option<String>,
    #[serde(flatten)]
    pub common: Common,
}

impl FileParams {
    pub fn adapter(self, ctx: &Context) -> Result<FileAdapter> {
        let remote_path = match self.state {
            FileState::Pulled => self
                .src
                .clone()
                .ok_or_else(|| ReconcileError::configuration("src is required to pull a file"))?,
            FileState::Pushed | FileState::Absent => self.dest.clone(),
        };
        if !remote_path.starts_with('/') {
            return Err(ReconcileError::configuration(format!(
                "path inside the instance must be absolute: {}",
                remote_path
            )));
        }

        let source = match (self.state, &self.src, &self.content) {
            (FileState::Pushed, Some(_), Some(_)) => {
                return Err(ReconcileError::configuration(
                    "src and content are mutually exclusive",
                ));
            }
            (FileState::Pushed, Some(src), None) => Some(Source::File(PathBuf::from(src))),
            (FileState::Pushed, None, Some(content)) => Some(Source::Content(content.clone())),
            (FileState::Pushed, None, None) => {
                return Err(ReconcileError::configuration(
                    "src or content is required to push a file",
                ));
            }
            _ => None,
        };

        let client = ctx.client(&self.common);
        Ok(FileAdapter {
            identity: ResourceIdentity::new(
                client.scope().clone(),
                ResourceKind::File,
                [self.instance.clone(), remote_path.clone()],
            ),
            remote: client.qualify(&format!("{}{}", self.instance, remote_path)),
            client,
            state: self.state,
            source,
            local: PathBuf::from(&self.dest),
            owner: self.owner,
            group: self.group,
            mode: self.mode,
        })
    }
}

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Content(String),
}

pub struct FileAdapter {
    client: Incus,
    identity: ResourceIdentity,
    /// `instance/path` argument
    remote: String,
    state: FileState,
    source: Option<Source>,
    /// Local destination when pulling
    local: PathBuf,
    owner: Option<u32>,
    group: Option<u32>,
    mode: Option<String>,
}

/// Hex SHA-256 of the content
fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn summary(bytes: &[u8]) -> (u64, String) {
    (bytes.len() as u64, checksum(bytes))
}

fn same_content(current: &AttributeTree, bytes: &[u8]) -> bool {
    let (size, sum) = summary(bytes);
    current.get("size").and_then(|v| v.as_u64()) == Some(size)
        && current.str_field("checksum") == Some(sum.as_str())
}

impl FileAdapter {
    fn title(&self) -> String {
        format!("File {}", self.identity.qualified())
    }

    fn push_operation(&self, plan_scratch: &mut Vec<tempfile::TempPath>) -> Result<Operation> {
        let local = match &self.source {
            Some(Source::File(path)) => path.display().to_string(),
            Some(Source::Content(content)) => {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(content.as_bytes())?;
                let path = file.into_temp_path();
                let display = path.display().to_string();
                plan_scratch.push(path);
                display
            }
            None => return Err(ReconcileError::configuration("nothing to push")),
        };

        let mut args = args!["file", "push", local, &self.remote, "--create-dirs"];
        if let Some(owner) = self.owner {
            args.push(format!("--uid={}", owner));
        }
        if let Some(group) = self.group {
            args.push(format!("--gid={}", group));
        }
        if let Some(mode) = &self.mode {
            args.push(format!("--mode={}", mode));
        }
        Ok(Operation::run(
            Change::action("push", &self.identity.key[1]),
            self.client.invocation(args),
        ))
    }

    fn desired_bytes(&self) -> Result<Vec<u8>> {
        match &self.source {
            Some(Source::File(path)) => std::fs::read(path).map_err(|e| {
                ReconcileError::configuration(format!("cannot read {}: {}", path.display(), e))
            }),
            Some(Source::Content(content)) => Ok(content.as_bytes().to_vec()),
            None => Ok(Vec::new()),
        }
    }
}

/// Pull `remote` into a temporary file; `None` when it does not exist
fn pull(exec: &dyn CommandExecutor, client: &Incus, remote: &str) -> Result<Option<Vec<u8>>> {
    let scratch = tempfile::NamedTempFile::new()?.into_temp_path();
    let output = client.run(exec, args!["file", "pull", remote, scratch.display()])?;
    if !output.success() {
        return Ok(None);
    }
    Ok(Some(std::fs::read(&scratch).unwrap_or_default()))
}

impl ResourceAdapter for FileAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        Ok(pull(exec, &self.client, &self.remote)?.map(|bytes| {
            let (size, sum) = summary(&bytes);
            AttributeTree::new(json!({
                "path": self.identity.key[1],
                "size": size,
                "checksum": sum,
            }))
        }))
    }

    fn plan(&self, _exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        let title = self.title();
        let mut changes = ChangeSet::new();
        let mut scratch = Vec::new();

        let message = match (self.state, current) {
            (FileState::Absent, None) => return Ok(Plan::unchanged(format!("{} is absent", title))),
            (FileState::Absent, Some(_)) => {
                changes.push(Operation::run(
                    Change::Delete,
                    self.client.invocation(args!["file", "delete", &self.remote]),
                ));
                format!("{} deleted", title)
            }
            (FileState::Pushed, current) => {
                let wanted = self.desired_bytes()?;
                if current.is_some_and(|c| same_content(c, &wanted)) {
                    return Ok(Plan::unchanged(format!("{} is up to date", title)));
                }
                changes.push(self.push_operation(&mut scratch)?);
                format!("{} pushed", title)
            }
            (FileState::Pulled, None) => {
                return Err(ReconcileError::precondition(format!("{} does not exist", title)));
            }
            (FileState::Pulled, Some(current)) => {
                if local_matches(&self.local, current) {
                    return Ok(Plan::unchanged(format!(
                        "{} is up to date",
                        self.local.display()
                    )));
                }
                changes.push(Operation::run(
                    Change::action("pull", self.local.display().to_string()),
                    self.client.invocation(args![
                        "file",
                        "pull",
                        &self.remote,
                        self.local.display()
                    ]),
                ));
                format!("{} pulled to {}", title, self.local.display())
            }
        };

        let mut plan = Plan::new(changes, message);
        for path in scratch {
            plan = plan.keep_scratch(path);
        }
        Ok(plan)
    }
}

fn local_matches(local: &Path, current: &AttributeTree) -> bool {
    std::fs::read(local)
        .map(|bytes| same_content(current, &bytes))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::mock::{ScriptedExecutor, ok};
    use incusflow_core::{ExecOutput, Reconciler};
    use serde_json::Value;

    /// Scripted executor whose `file pull` writes fixed content
    struct Pulling {
        inner: ScriptedExecutor,
        content: Option<&'static str>,
    }

    impl CommandExecutor for Pulling {
        fn execute(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
            let pulling = argv.windows(2).any(|w| w[0] == "file" && w[1] == "pull");
            if pulling {
                if let (Some(content), Some(dest)) = (self.content, argv.last()) {
                    std::fs::write(dest, content)?;
                }
            }
            self.inner.execute(argv, stdin)
        }
    }

    fn executor(content: Option<&'static str>) -> Pulling {
        let inner = ScriptedExecutor::new();
        if content.is_some() {
            inner.on(&["file", "pull"], ok(""));
        }
        inner.on(&["file", "push"], ok(""));
        inner.on(&["file", "delete"], ok(""));
        Pulling { inner, content }
    }

    fn adapter(value: Value) -> FileAdapter {
        serde_json::from_value::<FileParams>(value)
            .unwrap()
            .adapter(&Context::default())
            .unwrap()
    }

    #[test]
    fn test_push_skipped_when_content_matches() {
        let exec = executor(Some("127.0.0.1 localhost\n"));
        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "instance": "c1",
                "dest": "/etc/hosts",
                "content": "127.0.0.1 localhost\n"
            })))
            .unwrap();
        assert!(!outcome.changed);
        assert!(exec.inner.mutating_calls().is_empty());
    }

    #[test]
    fn test_push_content_when_different() {
        let exec = executor(Some("old\n"));
        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "instance": "c1",
                "dest": "/etc/motd",
                "content": "new\n",
                "mode": "0644",
                "owner": 0
            })))
            .unwrap();

        assert!(outcome.changed);
        let push = exec.inner.mutating_calls().remove(0);
        assert_eq!(push.argv[1..3], ["file", "push"]);
        assert_eq!(push.argv[4], "c1/etc/motd");
        assert!(push.argv.contains(&"--mode=0644".to_string()));
        assert!(push.argv.contains(&"--uid=0".to_string()));
    }

    #[test]
    fn test_pull_requires_remote_file() {
        let exec = executor(None);
        let err = Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "instance": "c1", "state": "pulled", "src": "/var/log/app.log", "dest": "/tmp/app.log"
            })))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Precondition(_)));
    }

    #[test]
    fn test_pull_skipped_when_local_matches() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("app.conf");
        std::fs::write(&dest, "key=value\n").unwrap();

        let exec = executor(Some("key=value\n"));
        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "instance": "c1", "state": "pulled", "src": "/etc/app.conf", "dest": dest
            })))
            .unwrap();
        assert!(!outcome.changed);
    }

    #[test]
    fn test_delete_existing_file() {
        let exec = executor(Some("x"));
        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"instance": "c1", "state": "absent", "dest": "/tmp/x"})))
            .unwrap();
        assert!(outcome.changed);
        assert!(exec.inner.called(&["file", "delete", "c1/tmp/x"]));
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let (size, sum) = summary(b"");
        assert_eq!(size, 0);
        assert_eq!(
            sum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_relative_path_rejected() {
        let err = serde_json::from_value::<FileParams>(json!({
            "instance": "c1", "dest": "etc/hosts", "content": "x"
        }))
        .unwrap()
        .adapter(&Context::default())
        .err()
        .unwrap();
        assert!(matches!(err, ReconcileError::Configuration(_)));
    }
}
