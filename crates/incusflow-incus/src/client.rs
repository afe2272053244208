//! incus CLI wrapper
//!
//! Builds argument vectors for the `incus` client: binary first, then the
//! `--project` flag when the scope needs one, then the sub-command.

use incusflow_core::{
    AttributeTree, CommandExecutor, DecodePolicy, ExecOutput, Format, Invocation, Result, Scope,
    decode_with,
};

/// Build a `Vec<String>` from mixed string-like arguments
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($arg.to_string()),*]
    };
}

/// incus client bound to a remote and project
#[derive(Debug, Clone)]
pub struct Incus {
    binary: String,
    scope: Scope,
}

impl Incus {
    pub fn new(binary: impl Into<String>, scope: Scope) -> Self {
        Self {
            binary: binary.into(),
            scope,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Same client without a project (projects and remotes are global)
    pub fn unscoped(&self) -> Self {
        Self {
            binary: self.binary.clone(),
            scope: Scope::new(self.scope.remote.clone(), None),
        }
    }

    /// Same client in another project
    pub fn in_project(&self, project: Option<String>) -> Self {
        Self {
            binary: self.binary.clone(),
            scope: Scope::new(self.scope.remote.clone(), project),
        }
    }

    /// Same client on another remote
    pub fn remote(&self, remote: Option<String>) -> Self {
        Self {
            binary: self.binary.clone(),
            scope: Scope::new(remote, self.scope.project.clone()),
        }
    }

    /// `remote:name` on a non-local remote
    pub fn qualify(&self, name: &str) -> String {
        self.scope.qualify(name)
    }

    pub fn argv(&self, args: Vec<String>) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 3);
        argv.push(self.binary.clone());
        argv.extend(self.scope.project_args());
        argv.extend(args);
        argv
    }

    pub fn invocation(&self, args: Vec<String>) -> Invocation {
        Invocation::new(self.argv(args))
    }

    /// Run a sub-command, returning its output whatever the exit code
    pub fn run(&self, exec: &dyn CommandExecutor, args: Vec<String>) -> Result<ExecOutput> {
        exec.execute(&self.argv(args), None)
    }

    /// Run a sub-command that must succeed
    pub fn run_checked(&self, exec: &dyn CommandExecutor, args: Vec<String>) -> Result<ExecOutput> {
        let argv = self.argv(args);
        exec.execute(&argv, None)?.checked(&argv)
    }

    /// Read a resource; a non-zero exit means it does not exist
    pub fn read(
        &self,
        exec: &dyn CommandExecutor,
        args: Vec<String>,
        format: Format,
        policy: DecodePolicy,
    ) -> Result<Option<AttributeTree>> {
        let output = self.run(exec, args)?;
        if !output.success() {
            tracing::debug!("Not found: {}", output.stderr_str().trim());
            return Ok(None);
        }
        Ok(decode_with(&output.stdout, format, policy)?)
    }

    /// Read output that must be present and decodable
    pub fn read_checked(
        &self,
        exec: &dyn CommandExecutor,
        args: Vec<String>,
        format: Format,
    ) -> Result<AttributeTree> {
        let output = self.run_checked(exec, args)?;
        Ok(incusflow_core::decode(&output.stdout, format)?)
    }
}
