//! incusflow reconciliation core
//!
//! This crate holds the resource-agnostic half of incusflow: running the
//! client binary, decoding its output, diffing current against desired state
//! and applying the resulting change set.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              incusflow CLI / host               │
//! │          (apply <request.yml> --check)          │
//! └─────────────────┬───────────────────────────────┘
//!                   │ ResourceAdapter
//! ┌─────────────────▼───────────────────────────────┐
//! │                incusflow-core                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │ Reconciler: fetch → plan → apply → fetch │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐   │
//! │  │ Diff Engine│ │  Decoder   │ │  Executor  │   │
//! │  └────────────┘ └────────────┘ └────────────┘   │
//! └─────────────────┬───────────────────────────────┘
//!                   │ argv + stdin
//!           ┌───────▼───────┐
//!           │  incus client │
//!           └───────────────┘
//! ```

pub mod adapter;
pub mod cache;
pub mod changeset;
pub mod classify;
pub mod decode;
pub mod diff;
pub mod error;
pub mod executor;
pub mod identity;
pub mod mock;
pub mod normalize;
pub mod reconciler;
pub mod tree;

// Re-exports
pub use adapter::ResourceAdapter;
pub use cache::{FileStateCache, StateCache};
pub use changeset::{Change, ChangeSet, ChangeSummary, Invocation, Operation, Plan, Step, Transition};
pub use classify::ConflictClassifier;
pub use decode::{DecodeError, DecodePolicy, Format, decode, decode_with};
pub use diff::{FieldKind, FieldPolicy, FieldRule, diff, merged_document, removal_map};
pub use error::{CommandFailure, ReconcileError, Result};
pub use executor::{CommandExecutor, ExecOutput, ProcessExecutor};
pub use identity::{ResourceIdentity, ResourceKind, Scope};
pub use normalize::{NormalizationTable, ValueKind, scalar_string};
pub use reconciler::{Outcome, Reconciler};
pub use tree::AttributeTree;
