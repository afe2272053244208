//! Client process execution

use crate::error::{CommandFailure, ReconcileError, Result};
use std::io::Write;
use std::process::{Command, Stdio};

/// Captured result of one client invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub rc: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.rc == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Turn a non-zero exit into an error carrying the full context
    pub fn checked(self, argv: &[String]) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ReconcileError::ExternalCommand(CommandFailure::new(argv, &self)))
        }
    }
}

/// Runs one argument vector, optionally feeding stdin
///
/// A non-zero exit code is returned as data, not as an error.
pub trait CommandExecutor {
    fn execute(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput>;
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for &T {
    fn execute(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
        (**self).execute(argv, stdin)
    }
}

/// Spawns a fresh child process per call
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    locale: String,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new("C")
    }
}

impl ProcessExecutor {
    /// `locale` is exported to the child as `LC_ALL`
    pub fn new(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
        }
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }
}

impl CommandExecutor for ProcessExecutor {
    fn execute(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ReconcileError::configuration("empty argument vector"))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env("LC_ALL", &self.locale);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: {}", argv.join(" "));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReconcileError::configuration(format!(
                    "client binary not found: {}",
                    program
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let output = std::thread::scope(|scope| {
            let writer = match (stdin, child.stdin.take()) {
                (Some(bytes), Some(mut pipe)) => {
                    Some(scope.spawn(move || pipe.write_all(bytes)))
                }
                _ => None,
            };
            let output = child.wait_with_output();
            if let Some(writer) = writer {
                match writer.join() {
                    Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                        tracing::warn!("Failed to write stdin to {}: {}", program, e);
                    }
                    _ => {}
                }
            }
            output
        })?;

        let result = ExecOutput {
            rc: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        };
        tracing::debug!("Exit code {} from {}", result.rc, program);
        Ok(result)
    }
}
