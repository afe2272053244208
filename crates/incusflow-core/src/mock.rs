//! Scripted executor for tests
//!
//! Records every call and answers from rules matched against the argument
//! vector. Later rules take precedence over earlier ones; `once` rules are
//! consumed by their first match.

use crate::error::Result;
use crate::executor::{CommandExecutor, ExecOutput};
use std::cell::RefCell;

/// Sub-command verbs that never mutate remote state
pub const READ_ONLY_VERBS: &[&str] = &["show", "list", "query", "info", "get", "pull"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl RecordedCall {
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    /// Whether the call uses a read-only verb among its leading words
    pub fn is_read_only(&self) -> bool {
        let mut args = self.argv.iter().skip(1).peekable();
        if args.next_if(|arg| *arg == "--project").is_some() {
            args.next();
        }
        args.filter(|arg| !arg.starts_with('-'))
            .take(3)
            .any(|arg| READ_ONLY_VERBS.contains(&arg.as_str()))
    }
}

struct Rule {
    pattern: Vec<String>,
    output: ExecOutput,
    once: bool,
}

pub struct ScriptedExecutor {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<RecordedCall>>,
    fallback: ExecOutput,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    /// Unmatched calls fail with "not found"
    pub fn new() -> Self {
        Self {
            rules: RefCell::new(Vec::new()),
            calls: RefCell::new(Vec::new()),
            fallback: fail(1, "Error: not found"),
        }
    }

    /// Answer calls containing `pattern` as a contiguous run of arguments
    pub fn on(&self, pattern: &[&str], output: ExecOutput) -> &Self {
        self.add(pattern, output, false)
    }

    /// Like [`on`](Self::on) but only for the next matching call
    pub fn once(&self, pattern: &[&str], output: ExecOutput) -> &Self {
        self.add(pattern, output, true)
    }

    fn add(&self, pattern: &[&str], output: ExecOutput, once: bool) -> &Self {
        self.rules.borrow_mut().push(Rule {
            pattern: pattern.iter().map(|s| s.to_string()).collect(),
            output,
            once,
        });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(RecordedCall::command_line).collect()
    }

    pub fn mutating_calls(&self) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| !c.is_read_only()).collect()
    }

    /// Whether any recorded call contains `pattern`
    pub fn called(&self, pattern: &[&str]) -> bool {
        self.calls().iter().any(|c| contains_run(&c.argv, pattern))
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
        self.calls.borrow_mut().push(RecordedCall {
            argv: argv.to_vec(),
            stdin: stdin.map(<[u8]>::to_vec),
        });

        let mut rules = self.rules.borrow_mut();
        let hit = rules.iter().rposition(|rule| {
            let pattern: Vec<&str> = rule.pattern.iter().map(String::as_str).collect();
            contains_run(argv, &pattern)
        });
        Ok(match hit {
            Some(index) if rules[index].once => rules.remove(index).output,
            Some(index) => rules[index].output.clone(),
            None => self.fallback.clone(),
        })
    }
}

fn contains_run(argv: &[String], pattern: &[&str]) -> bool {
    if pattern.is_empty() {
        return true;
    }
    argv.windows(pattern.len())
        .any(|window| window.iter().zip(pattern).all(|(a, p)| a == p))
}

/// Successful output with `stdout`
pub fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        rc: 0,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// Failed output with `stderr`
pub fn fail(rc: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        rc,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}
