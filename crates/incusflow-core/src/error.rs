//! Reconciliation error types

use crate::decode::DecodeError;
use crate::executor::ExecOutput;
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// Verbatim record of a sub-command that exited non-zero
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// Full argument vector, starting with the client binary
    pub argv: Vec<String>,

    /// Exit code (-1 when the process was killed by a signal)
    pub rc: i32,

    pub stdout: String,
    pub stderr: String,
}

impl CommandFailure {
    pub fn new(argv: &[String], output: &ExecOutput) -> Self {
        Self {
            argv: argv.to_vec(),
            rc: output.rc,
            stdout: output.stdout_str(),
            stderr: output.stderr_str(),
        }
    }

    /// The argument vector joined for display
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` exited with {}: {}",
            self.command_line(),
            self.rc,
            self.stderr.trim()
        )
    }
}

/// Errors surfaced by a reconciliation
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Missing binary, missing or mutually exclusive parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation is invalid for the current resource state
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Delete or detach blocked by a dependent resource
    #[error("Dependency conflict: {message}")]
    DependencyConflict {
        message: String,
        failure: CommandFailure,
    },

    #[error("Command failed: {0}")]
    ExternalCommand(CommandFailure),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReconcileError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        ReconcileError::Configuration(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        ReconcileError::Precondition(msg.into())
    }

    /// Short machine-readable category name
    pub fn category(&self) -> &'static str {
        match self {
            ReconcileError::Configuration(_) => "configuration",
            ReconcileError::Precondition(_) => "precondition",
            ReconcileError::DependencyConflict { .. } => "dependency_conflict",
            ReconcileError::ExternalCommand(_) => "external_command",
            ReconcileError::Decode(_) => "decode",
            ReconcileError::Io(_) => "io",
        }
    }

    /// The failing sub-command, when there is one
    pub fn failure(&self) -> Option<&CommandFailure> {
        match self {
            ReconcileError::DependencyConflict { failure, .. } => Some(failure),
            ReconcileError::ExternalCommand(failure) => Some(failure),
            _ => None,
        }
    }

    /// Structured failure response for the caller
    pub fn to_response(&self) -> Value {
        let mut response = json!({
            "failed": true,
            "changed": false,
            "error": self.category(),
            "msg": self.to_string(),
        });
        if let (Some(failure), Some(map)) = (self.failure(), response.as_object_mut()) {
            map.insert("cmd".into(), json!(failure.argv));
            map.insert("rc".into(), json!(failure.rc));
            map.insert("stdout".into(), json!(failure.stdout));
            map.insert("stderr".into(), json!(failure.stderr));
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
