//! Context-window management and working-directory checkpoints for
//! long-running, tool-using coding agents.
//!
//! `waypoint` keeps two kinds of per-task state that an agent loop needs in
//! order to run for hundreds of turns:
//!
//! 1. **Conversation context.** Raw history is never mutated. Edits live in a
//!    sparse, append-only [`ContextOverlay`](context::ContextOverlay) keyed by
//!    message and block index, and older messages are hidden by a
//!    monotonically growing [`TruncationRange`](context::TruncationRange).
//!    [`ContextManager::prepare_request`](context::ContextManager::prepare_request)
//!    renders the effective history for the next model call and keeps it
//!    within the model's safe budget.
//!
//! 2. **File checkpoints.** A shadow git repository, stored outside the
//!    project tree with its work-tree pointed at the real directory, snapshots
//!    the whole working directory after every mutating step.
//!    [`CheckpointTracker`](checkpoint::CheckpointTracker) commits, lists,
//!    diffs, and restores those snapshots without touching any repository the
//!    user owns.
//!
//! # Where to find things
//!
//! - **Per-request context shaping:** [`context::ContextManager`], backed by
//!   [`context::ContextStore`] and [`context::TruncationPlanner`].
//! - **Overlay persistence:** [`context::persist`] for the gateway trait and
//!   the file-backed implementation, [`context::flusher`] for the debounced
//!   background writer.
//! - **Checkpoints:** [`checkpoint::CheckpointTracker`], built on
//!   [`checkpoint::ShadowRepository`] and [`checkpoint::ExclusionRuleSet`].
//! - **Configuration:** [`config::WaypointConfig`].
//! - **Errors:** [`error`].
//! - **Durations of checkpoint operations:** [`telemetry::TelemetrySink`].
//!
//! # Example
//!
//! ```ignore
//! use waypoint::prelude::*;
//!
//! let manager = ContextManager::new("task-42", ContextConfig::default());
//! let profile = ModelContextProfile::new(200_000, 8_192);
//! let effective = manager.prepare_request(log.messages(), &profile).await?;
//!
//! let tracker = CheckpointTracker::open("/path/to/project", "task-42", CheckpointConfig::default()).await?;
//! let hash = tracker.commit().await?;
//! tracker.restore(&hash).await?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod prelude;
pub mod telemetry;

use serde::{Deserialize, Serialize};

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Per-tool metadata carried by a tool-result block.
///
/// One variant per tool kind, so rendering code matches exhaustively instead
/// of probing an open map.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolMeta {
    FileRead {
        path: String,
    },
    FileWrite {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
    },
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Other {
        tool_name: String,
    },
}

impl ToolMeta {
    /// The path this result read from disk, if it is a file read.
    pub fn read_path(&self) -> Option<&str> {
        match self {
            ToolMeta::FileRead { path } => Some(path),
            _ => None,
        }
    }
}

/// A single content block within a message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        meta: ToolMeta,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// A tool result holding the contents of `path`.
    pub fn file_read(
        tool_use_id: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            meta: ToolMeta::FileRead { path: path.into() },
        }
    }

    /// The block's textual payload (text or tool output).
    pub fn body(&self) -> &str {
        match self {
            ContentBlock::Text { text } => text,
            ContentBlock::ToolResult { content, .. } => content,
        }
    }

    /// Return a copy of this block with its textual payload swapped out.
    /// Tool-result blocks keep their call id and metadata.
    pub fn with_body(&self, body: String) -> Self {
        match self {
            ContentBlock::Text { .. } => ContentBlock::Text { text: body },
            ContentBlock::ToolResult {
                tool_use_id, meta, ..
            } => ContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: body,
                meta: meta.clone(),
            },
        }
    }
}

/// A message in the conversation.
///
/// `index` is the message's position in the raw history, assigned when it is
/// appended and never reused. It survives elision, so overlay entries and
/// truncation ranges can always refer back to the raw message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub index: usize,
    pub role: MessageRole,
    pub blocks: Vec<ContentBlock>,
}

impl Message {
    pub fn user(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            role: MessageRole::User,
            blocks: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            role: MessageRole::Assistant,
            blocks: vec![ContentBlock::text(text)],
        }
    }

    /// Append a block (builder style).
    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.blocks.push(block);
        self
    }

    /// Total characters across all blocks, used for token estimation.
    pub fn char_len(&self) -> usize {
        self.blocks.iter().map(|b| b.body().len()).sum()
    }
}

/// Append-only conversation history that hands out stable message indices.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return the index assigned to it.
    pub fn push(&mut self, role: MessageRole, blocks: Vec<ContentBlock>) -> usize {
        let index = self.messages.len();
        self.messages.push(Message {
            index,
            role,
            blocks,
        });
        index
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
