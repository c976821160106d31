//! Persistence gateway for per-task context state.
//!
//! The agent loop owns where and how state is stored; the context manager
//! only needs [`ContextPersistence`]. [`FileContextPersistence`] is the
//! default: one directory per task holding `context.json` (the overlay
//! snapshot) and `history.json` (the raw message log). Every write is a
//! whole-file rewrite through a uniquely named temp file and a rename, so a
//! failed or concurrent write leaves the previous file intact.
//!
//! ```text
//! <root>/
//!   <task_id>/
//!     context.json
//!     history.json
//! ```

use crate::Message;
use crate::context::store::StoreSnapshot;
use crate::error::PersistError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Current on-disk snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted context state for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub version: u32,
    /// Unix epoch milliseconds when the snapshot was taken.
    pub saved_at: i64,
    pub state: StoreSnapshot,
}

impl ContextSnapshot {
    pub fn new(state: StoreSnapshot) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: chrono::Utc::now().timestamp_millis(),
            state,
        }
    }
}

/// Where per-task context state is stored.
///
/// Methods are synchronous; async callers run them on a blocking thread.
pub trait ContextPersistence: Send + Sync {
    fn save_context(&self, task_id: &str, snapshot: &ContextSnapshot) -> Result<(), PersistError>;

    /// `Ok(None)` if nothing was ever saved for `task_id`.
    fn load_context(&self, task_id: &str) -> Result<Option<ContextSnapshot>, PersistError>;

    fn save_history(&self, task_id: &str, messages: &[Message]) -> Result<(), PersistError>;

    fn load_history(&self, task_id: &str) -> Result<Option<Vec<Message>>, PersistError>;
}

// ── File-backed ───────────────────────────────────────────────────

/// JSON files under a root directory, one subdirectory per task.
#[derive(Debug, Clone)]
pub struct FileContextPersistence {
    root: PathBuf,
}

impl FileContextPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    fn write_json<T: Serialize + ?Sized>(
        &self,
        task_id: &str,
        file: &str,
        value: &T,
    ) -> Result<(), PersistError> {
        let dir = self.task_dir(task_id);
        std::fs::create_dir_all(&dir).map_err(|source| PersistError::Write {
            path: dir.clone(),
            source,
        })?;

        let final_path = dir.join(file);
        let json = serde_json::to_vec(value)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|source| PersistError::Write {
            path: dir.clone(),
            source,
        })?;
        tmp.write_all(&json).map_err(|source| PersistError::Write {
            path: tmp.path().to_path_buf(),
            source,
        })?;
        tmp.persist(&final_path).map_err(|e| PersistError::Write {
            path: final_path,
            source: e.error,
        })?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(
        &self,
        task_id: &str,
        file: &str,
    ) -> Result<Option<T>, PersistError> {
        let path = self.task_dir(task_id).join(file);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistError::Read { path, source }),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

impl ContextPersistence for FileContextPersistence {
    fn save_context(&self, task_id: &str, snapshot: &ContextSnapshot) -> Result<(), PersistError> {
        self.write_json(task_id, "context.json", snapshot)
    }

    fn load_context(&self, task_id: &str) -> Result<Option<ContextSnapshot>, PersistError> {
        self.read_json(task_id, "context.json")
    }

    fn save_history(&self, task_id: &str, messages: &[Message]) -> Result<(), PersistError> {
        self.write_json(task_id, "history.json", messages)
    }

    fn load_history(&self, task_id: &str) -> Result<Option<Vec<Message>>, PersistError> {
        self.read_json(task_id, "history.json")
    }
}

// ── In-memory ─────────────────────────────────────────────────────

/// Keeps the latest snapshot per task in memory. Useful in tests and for
/// agents that persist elsewhere. Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct InMemoryContextPersistence {
    contexts: Mutex<std::collections::HashMap<String, ContextSnapshot>>,
    histories: Mutex<std::collections::HashMap<String, Vec<Message>>>,
    fail_writes: AtomicUsize,
    save_attempts: AtomicUsize,
}

impl InMemoryContextPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` context writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// How many times `save_context` was called, failed calls included.
    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ContextPersistence for InMemoryContextPersistence {
    fn save_context(&self, task_id: &str, snapshot: &ContextSnapshot) -> Result<(), PersistError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(PersistError::Write {
                path: PathBuf::from(task_id),
                source: std::io::Error::other("injected write failure"),
            });
        }
        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.insert(task_id.to_string(), snapshot.clone());
        }
        Ok(())
    }

    fn load_context(&self, task_id: &str) -> Result<Option<ContextSnapshot>, PersistError> {
        Ok(self
            .contexts
            .lock()
            .ok()
            .and_then(|contexts| contexts.get(task_id).cloned()))
    }

    fn save_history(&self, task_id: &str, messages: &[Message]) -> Result<(), PersistError> {
        if let Ok(mut histories) = self.histories.lock() {
            histories.insert(task_id.to_string(), messages.to_vec());
        }
        Ok(())
    }

    fn load_history(&self, task_id: &str) -> Result<Option<Vec<Message>>, PersistError> {
        Ok(self
            .histories
            .lock()
            .ok()
            .and_then(|histories| histories.get(task_id).cloned()))
    }
}
