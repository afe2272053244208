//! Dependency-conflict recognition
//!
//! The client reports in-use failures only as text. Matching is a
//! best-effort classification: anything unrecognized stays a plain
//! command failure.

use crate::error::{CommandFailure, ReconcileError};

/// Phrases the client uses when a delete is blocked by dependents
pub const DEFAULT_CONFLICT_PATTERNS: &[&str] = &[
    "in use",
    "currently used",
    "still in use",
    "not empty",
    "referenced",
];

#[derive(Debug, Clone, Copy)]
pub struct ConflictClassifier {
    patterns: &'static [&'static str],
}

impl Default for ConflictClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_PATTERNS)
    }
}

impl ConflictClassifier {
    pub const fn new(patterns: &'static [&'static str]) -> Self {
        Self { patterns }
    }

    /// The first known phrase contained in `stderr`
    pub fn matches(&self, stderr: &str) -> Option<&'static str> {
        let haystack = stderr.to_lowercase();
        self.patterns
            .iter()
            .copied()
            .find(|pattern| haystack.contains(pattern))
    }

    /// Map a failed delete to the right error
    pub fn classify(&self, subject: &str, failure: CommandFailure) -> ReconcileError {
        match self.matches(&failure.stderr) {
            Some(pattern) => {
                tracing::warn!("{} is blocked by dependents ({})", subject, pattern);
                ReconcileError::DependencyConflict {
                    message: format!(
                        "{} is in use; set force to detach dependents: {}",
                        subject,
                        failure.stderr.trim()
                    ),
                    failure,
                }
            }
            None => ReconcileError::ExternalCommand(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(stderr: &str) -> CommandFailure {
        CommandFailure {
            argv: vec!["incus".into(), "profile".into(), "delete".into(), "web".into()],
            rc: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_known_phrase_is_conflict() {
        let err = ConflictClassifier::default()
            .classify("profile web", failure("Error: Profile is currently in use"));
        assert!(matches!(err, ReconcileError::DependencyConflict { .. }));
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(
            ConflictClassifier::default().matches("Error: Storage pool NOT EMPTY"),
            Some("not empty")
        );
    }

    #[test]
    fn test_unknown_text_falls_back() {
        let err = ConflictClassifier::default()
            .classify("profile web", failure("Error: permission denied"));
        assert!(matches!(err, ReconcileError::ExternalCommand(_)));
    }

    #[test]
    fn test_kind_specific_patterns() {
        let classifier = ConflictClassifier::new(&["in use", "currently used"]);
        assert!(classifier.matches("network is referenced by ACL").is_none());
    }
}
