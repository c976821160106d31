//! Convenience re-exports for common `waypoint` types.
//!
//! Meant to be glob-imported by agent loops:
//!
//! ```ignore
//! use waypoint::prelude::*;
//! ```
//!
//! This pulls in the message model, the two per-task entry points
//! ([`ContextManager`] and [`CheckpointTracker`]), their configs, and the
//! error types. Lower-level pieces (overlay, planner, shadow repository,
//! exclusion rules) are left to their modules.

// ── Message model ───────────────────────────────────────────────────
pub use crate::{ContentBlock, Message, MessageLog, MessageRole, ToolMeta};

// ── Context ─────────────────────────────────────────────────────────
pub use crate::context::{
    ContextManager, ContextPersistence, ContextUsage, FileContextPersistence,
    ModelContextProfile, TruncationRange, UpdateType,
};

// ── Checkpoints ─────────────────────────────────────────────────────
pub use crate::checkpoint::{AbortSignal, Checkpoint, CheckpointState, CheckpointTracker};

// ── Config, errors, telemetry ───────────────────────────────────────
pub use crate::config::{CheckpointConfig, ContextConfig, WaypointConfig};
pub use crate::error::{CheckpointError, ContextError, PersistError};
pub use crate::telemetry::{TelemetrySink, TracingTelemetry};
