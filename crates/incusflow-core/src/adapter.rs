//! Resource adapter trait definition

use crate::changeset::Plan;
use crate::classify::ConflictClassifier;
use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::identity::ResourceIdentity;
use crate::reconciler::Outcome;
use crate::tree::AttributeTree;

/// One resource kind bound to one caller request
///
/// Adapters are stateless between calls: everything they know about the
/// remote system comes from `fetch` and the reads done inside `plan`.
pub trait ResourceAdapter {
    fn identity(&self) -> &ResourceIdentity;

    /// Response field holding the final state (e.g. `"instance"`)
    fn payload_key(&self) -> &'static str {
        self.identity().kind.as_str()
    }

    /// Current state, or `None` when the resource does not exist
    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>>;

    /// Changes converging `current` to the request
    ///
    /// May issue read-only queries; must not mutate anything.
    fn plan(&self, exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan>;

    /// Phrases marking a failed delete as a dependency conflict
    fn conflicts(&self) -> ConflictClassifier {
        ConflictClassifier::default()
    }

    /// Post-process captured output into the response payload
    fn finish(&self, _outcome: &mut Outcome) -> Result<()> {
        Ok(())
    }
}
