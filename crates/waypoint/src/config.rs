//! Configuration for the context manager and checkpoint tracker.
//!
//! Every field has a working default, so most callers only need
//! [`WaypointConfig::default()`]. Override individual settings with the
//! `with_*` builder methods or struct update syntax:
//!
//! ```ignore
//! let config = WaypointConfig {
//!     context: ContextConfig::default().with_tail_keep(16),
//!     checkpoint: CheckpointConfig::default().with_storage_root("/var/lib/agent/checkpoints"),
//! };
//! ```
//!
//! Both structs also deserialize from JSON with every field optional, which
//! is what the `waypoint` CLI's `--config` flag reads. Durations are written
//! as whole milliseconds.

use crate::error::PersistError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of most recent messages that are never elided.
pub const DEFAULT_TAIL_KEEP: usize = 10;

/// Default characters per token (conservative estimate for English text and code).
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Name of the agent-specific ignore file read from the working directory root.
pub const DEFAULT_AGENT_IGNORE_FILE: &str = ".waypointignore";

// ── Context config ────────────────────────────────────────────────

/// Settings for [`ContextManager`](crate::context::ContextManager) and its
/// background flusher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Most recent messages that are always kept, whatever the truncation range.
    pub tail_keep: usize,
    /// Characters per token used by the estimator.
    pub chars_per_token: f64,
    /// Inactivity window before dirty overlay state is flushed.
    #[serde(with = "duration_ms")]
    pub flush_debounce: Duration,
    /// How often the background task prunes old overlay updates.
    #[serde(with = "duration_ms")]
    pub prune_interval: Duration,
    /// Updates older than this are pruned (the latest per block always survives).
    #[serde(with = "duration_ms")]
    pub prune_max_age: Duration,
    /// Upper bound on how many earlier messages the dedup pass inspects.
    pub dedup_lookback: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            tail_keep: DEFAULT_TAIL_KEEP,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            flush_debounce: Duration::from_secs(1),
            prune_interval: Duration::from_secs(5 * 60),
            prune_max_age: Duration::from_secs(24 * 60 * 60),
            dedup_lookback: 200,
        }
    }
}

impl ContextConfig {
    pub fn with_tail_keep(mut self, n: usize) -> Self {
        self.tail_keep = n;
        self
    }

    pub fn with_chars_per_token(mut self, cpt: f64) -> Self {
        self.chars_per_token = cpt;
        self
    }

    pub fn with_flush_debounce(mut self, debounce: Duration) -> Self {
        self.flush_debounce = debounce;
        self
    }

    pub fn with_prune_interval(mut self, interval: Duration, max_age: Duration) -> Self {
        self.prune_interval = interval;
        self.prune_max_age = max_age;
        self
    }
}

// ── Checkpoint config ─────────────────────────────────────────────

/// Settings for [`CheckpointTracker`](crate::checkpoint::CheckpointTracker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Root under which shadow repositories are created, one per
    /// `(working directory hash, task id)`. Must live outside any working
    /// directory being checkpointed.
    pub storage_root: PathBuf,
    /// Project ignore file, relative to the working directory.
    pub project_ignore_file: String,
    /// Agent-specific ignore file, relative to the working directory.
    pub agent_ignore_file: String,
    /// Author and committer name for checkpoint commits.
    pub bot_name: String,
    /// Author and committer email for checkpoint commits.
    pub bot_email: String,
    /// Git executable to invoke.
    pub git_binary: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            project_ignore_file: ".gitignore".into(),
            agent_ignore_file: DEFAULT_AGENT_IGNORE_FILE.into(),
            bot_name: "waypoint".into(),
            bot_email: "checkpoints@waypoint.invalid".into(),
            git_binary: "git".into(),
        }
    }
}

impl CheckpointConfig {
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub fn with_agent_ignore_file(mut self, name: impl Into<String>) -> Self {
        self.agent_ignore_file = name.into();
        self
    }

    pub fn with_git_binary(mut self, git: impl Into<String>) -> Self {
        self.git_binary = git.into();
        self
    }
}

/// `<data dir>/waypoint/checkpoints`, falling back to the temp dir on
/// platforms without a data directory.
fn default_storage_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("waypoint")
        .join("checkpoints")
}

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WaypointConfig {
    pub context: ContextConfig,
    pub checkpoint: CheckpointConfig,
}

impl WaypointConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, PersistError> {
        let json = std::fs::read_to_string(path).map_err(|source| PersistError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Serialize a [`Duration`] as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
