//! Context window management: overlay, truncation, and persistence.
//!
//! Long tasks outgrow any model's context window. This module keeps the raw
//! conversation untouched and derives the history actually sent to the model:
//!
//! 1. **[`overlay`]** holds [`ContextUpdate`]s, sparse edits keyed by
//!    `(message_index, block_index)`. The latest update for a block wins;
//!    older ones stay for audit until pruned.
//!
//! 2. **[`store`]** combines the overlay with the task's [`TruncationRange`]
//!    and renders the effective history. Message 0 and the last `tail_keep`
//!    messages are always kept.
//!
//! 3. **[`planner`]** picks how much more history to hide when the
//!    effective history is over budget. Ranges only ever grow.
//!
//! 4. **[`manager`]** ties it together for the agent loop:
//!    [`ContextManager::prepare_request`] before every model call.
//!
//! 5. **[`persist`]** and **[`flusher`]** save state through a
//!    [`ContextPersistence`] gateway on a debounce, pruning old updates on an
//!    interval.

pub mod budget;
pub mod file_reads;
pub mod flusher;
pub mod manager;
pub mod overlay;
pub mod persist;
pub mod planner;
pub mod store;

pub use budget::{ContextUsage, ModelContextProfile, TokenEstimator};
pub use file_reads::{FileReadEntry, FileReadIndex};
pub use flusher::ContextFlusher;
pub use manager::ContextManager;
pub use overlay::{ContextOverlay, ContextUpdate, UpdateType};
pub use persist::{
    ContextPersistence, ContextSnapshot, FileContextPersistence, InMemoryContextPersistence,
};
pub use planner::{Severity, TruncationPlan, TruncationPlanner, TruncationRange};
pub use store::{ContextStore, StoreSnapshot};
