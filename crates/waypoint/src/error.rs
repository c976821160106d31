//! Error types for the context and checkpoint subsystems.
//!
//! Callers branch on these variants: [`ContextError::Exhausted`] stops the
//! task, [`CheckpointError::NotFound`] is recoverable (list and retry), and
//! [`CheckpointError::is_soft`] marks failures the agent loop logs and moves
//! past without a new checkpoint.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the context overlay, planner, and manager.
#[derive(Debug, Error)]
pub enum ContextError {
    /// An overlay update addressed a message or block that does not exist.
    #[error(
        "invalid overlay index: message {message_index}, block {block_index} \
         (history has {message_count} messages)"
    )]
    InvalidIndex {
        message_index: usize,
        block_index: usize,
        message_count: usize,
    },

    /// Over budget and the planner cannot elide anything further.
    #[error(
        "context exhausted: ~{estimated_tokens} tokens exceed the safe budget of \
         {safe_budget} and no further truncation is possible"
    )]
    Exhausted {
        estimated_tokens: usize,
        safe_budget: usize,
    },

    #[error("failed to (de)serialize context overlay: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the shadow repository and checkpoint tracker.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The requested restore target does not exist in the shadow repository.
    #[error("checkpoint {hash} not found")]
    NotFound { hash: String },

    /// `reset --hard` ran but HEAD does not point at the requested commit.
    #[error("restore verification failed: expected HEAD {expected}, found {actual}")]
    RestoreVerification { expected: String, actual: String },

    /// A git subprocess failed.
    #[error("shadow repository command `git {command}` failed: {message}")]
    ShadowRepository { command: String, message: String },

    #[error("shadow repository I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The task's abort flag was set before the operation started.
    #[error("checkpoint operation aborted")]
    Aborted,

    /// A previous restore failed verification; manual intervention required.
    #[error("checkpoints are degraded after a failed restore verification")]
    Degraded,

    /// Checkpointing is refused for directories like `$HOME` or `/`.
    #[error("refusing to checkpoint protected directory {}", path.display())]
    ProtectedDirectory { path: PathBuf },
}

impl CheckpointError {
    /// Whether the agent loop should log this and continue without a new
    /// checkpoint rather than stopping.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            CheckpointError::ShadowRepository { .. } | CheckpointError::Io(_)
        )
    }
}

/// Errors raised by the overlay persistence gateway.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode persisted context: {0}")]
    Decode(#[from] serde_json::Error),
}
