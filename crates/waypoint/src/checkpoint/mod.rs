//! Working-directory checkpoints backed by a shadow git repository.
//!
//! - **[`exclusions`]**: which paths are never snapshotted.
//! - **[`shadow`]**: the git subprocess plumbing for one shadow repository.
//! - **[`tracker`]**: the per-task entry point the agent loop calls after
//!   each mutating step.

pub mod exclusions;
pub mod shadow;
pub mod tracker;

pub use exclusions::{DEFAULT_EXCLUSIONS, ExclusionRuleSet};
pub use shadow::{ChangeKind, ChangedFile, CommitInfo, ShadowRepository};
pub use tracker::{AbortSignal, Checkpoint, CheckpointState, CheckpointTracker, MutationGuard};
