//! Per-task checkpoint orchestration.
//!
//! [`CheckpointTracker`] is what the agent loop calls after every tool
//! execution that may have changed files. It refreshes the exclusion rules,
//! commits the working directory to the task's [`ShadowRepository`], and
//! keeps the ordered checkpoint list with each checkpoint's
//! [`CheckpointState`].
//!
//! All operations take the tracker's per-task lock. A file-mutating tool
//! call should run under a [`MutationGuard`] and finish with
//! [`MutationGuard::commit`], so the next mutation cannot start before the
//! previous checkpoint's hash is recorded.

use crate::checkpoint::exclusions::ExclusionRuleSet;
use crate::checkpoint::shadow::{ChangedFile, JournalEntry, ShadowRepository};
use crate::config::CheckpointConfig;
use crate::error::CheckpointError;
use crate::telemetry::{CheckpointOperation, DurationSample, TelemetrySink, TracingTelemetry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

// ── Abort signal ─────────────────────────────────────────────────────

/// Cooperative cancellation flag shared between the agent loop and the
/// tracker. Checked before a commit starts and when a mutation guard is
/// acquired; a git call already running is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Checkpoint ───────────────────────────────────────────────────────

/// Lifecycle of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Pending,
    Committed,
    /// The newest checkpoint, and the working tree has not been rolled back.
    Active,
    /// A later commit or a restore to another checkpoint replaced it.
    Superseded,
    /// The working tree was restored to this checkpoint.
    RolledBackTo,
}

impl CheckpointState {
    pub fn can_transition_to(self, next: CheckpointState) -> bool {
        use CheckpointState::*;
        matches!(
            (self, next),
            (Pending, Committed)
                | (Committed, Active)
                | (Active, Superseded)
                | (Active, RolledBackTo)
                | (Superseded, RolledBackTo)
                | (RolledBackTo, Superseded)
        )
    }

    /// Whether this checkpoint is the one the working tree currently matches.
    pub fn is_current(self) -> bool {
        matches!(self, CheckpointState::Active | CheckpointState::RolledBackTo)
    }
}

impl std::fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointState::Pending => "pending",
            CheckpointState::Committed => "committed",
            CheckpointState::Active => "active",
            CheckpointState::Superseded => "superseded",
            CheckpointState::RolledBackTo => "rolled-back-to",
        };
        f.write_str(s)
    }
}

/// A restorable snapshot of the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub commit_hash: String,
    pub task_id: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub parent_hash: Option<String>,
    pub state: CheckpointState,
}

impl Checkpoint {
    /// Move to `next` if the transition is legal. Returns whether it moved.
    fn advance(&mut self, next: CheckpointState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            debug!(
                "ignoring checkpoint transition {} -> {next} for {}",
                self.state, self.commit_hash
            );
            return false;
        }
        self.state = next;
        true
    }
}

// ── Tracker ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct TrackerState {
    checkpoints: Vec<Checkpoint>,
    exclusions: ExclusionRuleSet,
    degraded: bool,
}

impl TrackerState {
    fn current_mut(&mut self) -> Option<&mut Checkpoint> {
        self.checkpoints.iter_mut().find(|c| c.state.is_current())
    }

    fn find_mut(&mut self, hash: &str) -> Option<&mut Checkpoint> {
        self.checkpoints.iter_mut().find(|c| c.commit_hash == hash)
    }
}

/// Checkpoints for one `(working directory, task)`.
pub struct CheckpointTracker {
    task_id: String,
    work_dir: PathBuf,
    config: CheckpointConfig,
    repo: ShadowRepository,
    state: Mutex<TrackerState>,
    telemetry: Arc<dyn TelemetrySink>,
    abort: AbortSignal,
}

impl CheckpointTracker {
    /// Open (creating if needed) the task's shadow repository and reload the
    /// checkpoints it already holds.
    pub async fn open(
        work_dir: impl AsRef<Path>,
        task_id: impl Into<String>,
        config: CheckpointConfig,
    ) -> Result<Self, CheckpointError> {
        let task_id = task_id.into();
        let work_dir = tokio::fs::canonicalize(work_dir.as_ref()).await?;
        check_work_dir(&work_dir, &config.storage_root)?;

        let repo = ShadowRepository::new(&work_dir, &task_id, &config);
        repo.ensure_initialized().await?;

        let checkpoints = load_checkpoints(&repo, &task_id).await?;
        if !checkpoints.is_empty() {
            debug!(
                "reloaded {} checkpoints for task {task_id}",
                checkpoints.len()
            );
        }

        let exclusions = ExclusionRuleSet::compute_for_directory(&work_dir, &config);
        Ok(Self {
            task_id,
            work_dir,
            config,
            repo,
            state: Mutex::new(TrackerState {
                checkpoints,
                exclusions,
                degraded: false,
            }),
            telemetry: Arc::new(TracingTelemetry),
            abort: AbortSignal::new(),
        })
    }

    /// Send commit and restore durations to `sink` instead of the log.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Share an abort flag with the agent loop.
    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn shadow(&self) -> &ShadowRepository {
        &self.repo
    }

    /// Deterministic commit message for this `(working directory, task)`.
    pub fn commit_message(&self) -> String {
        format!(
            "waypoint checkpoint {}",
            identity_hash(&self.work_dir, &self.task_id)
        )
    }

    /// Snapshot the working directory. Returns the new commit hash.
    pub async fn commit(&self) -> Result<String, CheckpointError> {
        if self.abort.is_aborted() {
            return Err(CheckpointError::Aborted);
        }
        let mut state = self.state.lock().await;
        self.commit_locked(&mut state).await
    }

    /// [`commit`](Self::commit), logging instead of returning the error.
    /// Shadow-repository failures are soft: the loop carries on without a
    /// new checkpoint.
    pub async fn commit_or_log(&self) -> Option<String> {
        match self.commit().await {
            Ok(hash) => Some(hash),
            Err(e) if e.is_soft() => {
                warn!("task {}: continuing without checkpoint: {e}", self.task_id);
                None
            }
            Err(e) => {
                warn!("task {}: checkpoint skipped: {e}", self.task_id);
                None
            }
        }
    }

    /// Restore the working directory to `hash`. Restoring the same hash
    /// again simply resets again.
    ///
    /// A failed verification marks the tracker degraded; later commits and
    /// restores fail with [`CheckpointError::Degraded`] until
    /// [`clear_degraded`](Self::clear_degraded).
    pub async fn restore(&self, hash: &str) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        if state.degraded {
            return Err(CheckpointError::Degraded);
        }

        // `clean` must see the current rules, or newly excluded files go too.
        self.sync_exclusions(&mut state).await?;

        let started = Instant::now();
        let result = self.repo.reset_hard(hash).await;
        self.record(CheckpointOperation::Restore, started, result.is_ok());

        let restored = match result {
            Ok(full) => full,
            Err(e) => {
                if matches!(e, CheckpointError::RestoreVerification { .. }) {
                    warn!(
                        "task {}: restore verification failed, checkpoints degraded: {e}",
                        self.task_id
                    );
                    state.degraded = true;
                }
                return Err(e);
            }
        };

        let previous = state
            .current_mut()
            .filter(|c| c.commit_hash != restored)
            .map(|c| {
                c.advance(CheckpointState::Superseded);
                c.commit_hash.clone()
            });
        if let Some(target) = state.find_mut(&restored) {
            target.advance(CheckpointState::RolledBackTo);
        }

        info!(
            "task {}: restored {} to checkpoint {restored}{}",
            self.task_id,
            self.work_dir.display(),
            previous
                .map(|p| format!(" (was {p})"))
                .unwrap_or_default()
        );
        Ok(())
    }

    /// All checkpoints, oldest first.
    pub async fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.state.lock().await.checkpoints.clone()
    }

    /// The checkpoint the working tree currently matches, if any.
    pub async fn current(&self) -> Option<Checkpoint> {
        self.state
            .lock()
            .await
            .checkpoints
            .iter()
            .find(|c| c.state.is_current())
            .cloned()
    }

    /// Unified diff; see [`ShadowRepository::diff`] for the defaults.
    pub async fn diff(&self, from: Option<&str>, to: Option<&str>) -> Result<String, CheckpointError> {
        let mut state = self.state.lock().await;
        self.sync_exclusions(&mut state).await?;
        self.repo.diff(from, to).await
    }

    /// Changed files between two snapshots, same defaults as [`diff`](Self::diff).
    pub async fn changed_files(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<ChangedFile>, CheckpointError> {
        let mut state = self.state.lock().await;
        self.sync_exclusions(&mut state).await?;
        self.repo.changed_files(from, to).await
    }

    /// Current exclusion patterns, refreshed and written to the shadow
    /// repository if an ignore file changed.
    pub async fn exclusions(&self) -> Result<Vec<String>, CheckpointError> {
        let mut state = self.state.lock().await;
        self.sync_exclusions(&mut state).await?;
        Ok(state.exclusions.patterns().to_vec())
    }

    /// Hold the per-task lock for the duration of a file-mutating tool call.
    pub async fn mutation_guard(&self) -> Result<MutationGuard<'_>, CheckpointError> {
        if self.abort.is_aborted() {
            return Err(CheckpointError::Aborted);
        }
        Ok(MutationGuard {
            tracker: self,
            state: self.state.lock().await,
        })
    }

    pub async fn is_degraded(&self) -> bool {
        self.state.lock().await.degraded
    }

    /// Re-enable commits and restores after manual intervention.
    pub async fn clear_degraded(&self) {
        let mut state = self.state.lock().await;
        if state.degraded {
            info!("task {}: degraded flag cleared", self.task_id);
        }
        state.degraded = false;
    }

    /// Delete the task's shadow repository and every checkpoint in it.
    pub async fn delete_all(self) -> Result<(), CheckpointError> {
        let _state = self.state.lock().await;
        self.repo.delete().await
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn commit_locked(&self, state: &mut TrackerState) -> Result<String, CheckpointError> {
        if state.degraded {
            return Err(CheckpointError::Degraded);
        }

        let started = Instant::now();
        let result = self.commit_inner(state).await;
        self.record(CheckpointOperation::Commit, started, result.is_ok());
        let entry = result?;

        if let Some(previous) = state.current_mut() {
            previous.advance(CheckpointState::Superseded);
        }
        let mut checkpoint = Checkpoint {
            commit_hash: entry.hash.clone(),
            task_id: self.task_id.clone(),
            timestamp: entry.timestamp,
            parent_hash: entry.parent,
            state: CheckpointState::Pending,
        };
        checkpoint.advance(CheckpointState::Committed);
        checkpoint.advance(CheckpointState::Active);
        state.checkpoints.push(checkpoint);

        debug!("task {}: checkpoint {}", self.task_id, entry.hash);
        Ok(entry.hash)
    }

    async fn commit_inner(&self, state: &mut TrackerState) -> Result<JournalEntry, CheckpointError> {
        if self.repo.ensure_initialized().await? {
            // Recreated underneath us: history is gone.
            state.checkpoints.clear();
        }
        self.sync_exclusions(state).await?;

        let parent = self.repo.head().await?;
        let hash = self.repo.stage_and_commit(&self.commit_message()).await?;
        self.repo.pin(&hash).await?;

        let entry = JournalEntry {
            hash,
            parent,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.repo.append_journal(&entry).await?;
        Ok(entry)
    }

    /// Refresh the rule set if an ignore file changed and write it out.
    async fn sync_exclusions(&self, state: &mut TrackerState) -> Result<(), CheckpointError> {
        if state.exclusions.refresh(&self.work_dir, &self.config) {
            debug!("task {}: exclusion rules changed", self.task_id);
        }
        self.repo.write_exclusions(&state.exclusions).await
    }

    fn record(&self, operation: CheckpointOperation, started: Instant, ok: bool) {
        self.telemetry.record_duration(&DurationSample {
            operation,
            task_id: self.task_id.clone(),
            duration: started.elapsed(),
            ok,
        });
    }
}

/// Exclusive access to the working directory for one file-mutating step.
///
/// While a guard is alive no other commit, restore, or mutation for the
/// task can start. Dropping it without committing releases the lock.
pub struct MutationGuard<'a> {
    tracker: &'a CheckpointTracker,
    state: MutexGuard<'a, TrackerState>,
}

impl MutationGuard<'_> {
    /// Checkpoint the mutation and release the lock.
    pub async fn commit(mut self) -> Result<String, CheckpointError> {
        if self.tracker.abort.is_aborted() {
            return Err(CheckpointError::Aborted);
        }
        self.tracker.commit_locked(&mut self.state).await
    }
}

/// Refuse `$HOME`, filesystem roots, and storage roots inside the tree.
fn check_work_dir(work_dir: &Path, storage_root: &Path) -> Result<(), CheckpointError> {
    let is_home = dirs::home_dir()
        .and_then(|home| std::fs::canonicalize(home).ok())
        .is_some_and(|home| home == work_dir);
    if is_home || work_dir.parent().is_none() {
        return Err(CheckpointError::ProtectedDirectory {
            path: work_dir.to_path_buf(),
        });
    }

    let storage_root = std::fs::canonicalize(storage_root).unwrap_or_else(|_| storage_root.to_path_buf());
    if storage_root.starts_with(work_dir) {
        return Err(CheckpointError::ShadowRepository {
            command: "init".into(),
            message: format!(
                "storage root {} is inside the working directory {}",
                storage_root.display(),
                work_dir.display()
            ),
        });
    }
    Ok(())
}

/// Rebuild the checkpoint list from the repository's journal. The commit at
/// HEAD is current: `Active` if it is the newest, `RolledBackTo` otherwise.
async fn load_checkpoints(
    repo: &ShadowRepository,
    task_id: &str,
) -> Result<Vec<Checkpoint>, CheckpointError> {
    let entries = repo.read_journal().await?;
    let head = repo.head().await?;
    let newest = entries.last().map(|e| e.hash.clone());

    Ok(entries
        .into_iter()
        .map(|entry| {
            let state = if head.as_deref() != Some(entry.hash.as_str()) {
                CheckpointState::Superseded
            } else if newest.as_deref() == Some(entry.hash.as_str()) {
                CheckpointState::Active
            } else {
                CheckpointState::RolledBackTo
            };
            Checkpoint {
                commit_hash: entry.hash,
                task_id: task_id.to_string(),
                timestamp: entry.timestamp,
                parent_hash: entry.parent,
                state,
            }
        })
        .collect())
}

/// First 16 hex chars of SHA-256 over `work_dir \0 task_id`.
fn identity_hash(work_dir: &Path, task_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(work_dir.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(task_id.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}
