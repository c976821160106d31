//! Git plumbing for the shadow repository.
//!
//! A shadow repository is an ordinary git directory that lives under the
//! checkpoint storage root, never inside the working directory, and whose
//! work tree is the real working directory. Every invocation passes
//! `--git-dir` and `--work-tree` explicitly and clears the `GIT_*`
//! environment, so a repository the user owns in the same directory is never
//! read or written.
//!
//! Subprocesses run through `tokio::process`, so the caller's runtime is
//! never blocked. A git call is not killed when its future is dropped; it
//! runs to completion rather than leaving the object store half-written.

use crate::checkpoint::exclusions::ExclusionRuleSet;
use crate::config::CheckpointConfig;
use crate::error::CheckpointError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Hash of the empty tree, used to diff against a repository with no commits.
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Environment variables that would redirect git away from the shadow repo.
const GIT_ENV_OVERRIDES: &[&str] = &[
    "GIT_DIR",
    "GIT_WORK_TREE",
    "GIT_INDEX_FILE",
    "GIT_OBJECT_DIRECTORY",
    "GIT_ALTERNATE_OBJECT_DIRECTORIES",
    "GIT_NAMESPACE",
    "GIT_COMMON_DIR",
    "GIT_CEILING_DIRECTORIES",
];

/// Paths per `git rm --cached` invocation.
const UNTRACK_BATCH: usize = 200;

/// Append-only list of checkpoint commits, inside the git directory.
const JOURNAL_FILE: &str = "waypoint-journal";

/// Written once every init setting is applied. Until it exists the settings
/// are applied again.
const INIT_MARKER: &str = "waypoint-initialized";

/// One line of the checkpoint journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub hash: String,
    pub parent: Option<String>,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl JournalEntry {
    fn to_line(&self) -> String {
        format!(
            "{} {} {}\n",
            self.hash,
            self.parent.as_deref().unwrap_or("-"),
            self.timestamp
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let hash = fields.next()?.to_string();
        let parent = match fields.next()? {
            "-" => None,
            p => Some(p.to_string()),
        };
        let timestamp = fields.next()?.parse().ok()?;
        Some(Self {
            hash,
            parent,
            timestamp,
        })
    }
}

/// One commit in the shadow repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub parent: Option<String>,
    /// Commit time, Unix epoch milliseconds.
    pub timestamp: i64,
    pub subject: String,
}

/// How a file differs between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    TypeChanged,
    Other,
}

impl ChangeKind {
    fn from_status(status: &str) -> Self {
        match status.chars().next() {
            Some('A') => ChangeKind::Added,
            Some('M') => ChangeKind::Modified,
            Some('D') => ChangeKind::Deleted,
            Some('T') => ChangeKind::TypeChanged,
            _ => ChangeKind::Other,
        }
    }

    /// Single-letter code as printed by `git diff --name-status`.
    pub fn code(self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Modified => 'M',
            ChangeKind::Deleted => 'D',
            ChangeKind::TypeChanged => 'T',
            ChangeKind::Other => '?',
        }
    }
}

/// A file that differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub kind: ChangeKind,
    pub path: String,
}

/// Handle to one task's shadow repository.
#[derive(Debug, Clone)]
pub struct ShadowRepository {
    git_dir: PathBuf,
    work_tree: PathBuf,
    git_binary: String,
    bot_name: String,
    bot_email: String,
}

impl ShadowRepository {
    /// Handle for the shadow repository of `(work_tree, task_id)`. Nothing is
    /// created until [`ensure_initialized`](Self::ensure_initialized).
    pub fn new(work_tree: impl Into<PathBuf>, task_id: &str, config: &CheckpointConfig) -> Self {
        let work_tree = work_tree.into();
        Self {
            git_dir: Self::location(&config.storage_root, &work_tree, task_id),
            work_tree,
            git_binary: config.git_binary.clone(),
            bot_name: config.bot_name.clone(),
            bot_email: config.bot_email.clone(),
        }
    }

    /// `<storage_root>/<work tree hash>/<task_id>`.
    pub fn location(storage_root: &Path, work_tree: &Path, task_id: &str) -> PathBuf {
        storage_root.join(work_tree_hash(work_tree)).join(task_id)
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    /// Create the repository if it does not exist yet, or finish a setup an
    /// earlier call left half done. Returns `true` if the repository was
    /// created by this call.
    pub async fn ensure_initialized(&self) -> Result<bool, CheckpointError> {
        if self.git_dir.join(INIT_MARKER).is_file() {
            return Ok(false);
        }
        let created = !self.git_dir.join("HEAD").is_file();

        tokio::fs::create_dir_all(&self.git_dir).await?;
        if created {
            self.git(&["init", "--quiet"]).await?;
        }

        let work_tree = self.work_tree.to_string_lossy().into_owned();
        let no_hooks = self.git_dir.join("no-hooks").to_string_lossy().into_owned();
        let settings: [(&str, &str); 8] = [
            ("core.bare", "false"),
            ("core.worktree", &work_tree),
            ("core.autocrlf", "false"),
            ("core.quotePath", "false"),
            ("core.hooksPath", &no_hooks),
            ("commit.gpgsign", "false"),
            ("user.name", &self.bot_name),
            ("user.email", &self.bot_email),
        ];
        for (key, value) in settings {
            self.git(&["config", key, value]).await?;
        }
        tokio::fs::write(self.git_dir.join(INIT_MARKER), "").await?;

        if created {
            info!(
                "created shadow repository {} for {}",
                self.git_dir.display(),
                self.work_tree.display()
            );
        } else {
            warn!(
                "finished incomplete setup of shadow repository {}",
                self.git_dir.display()
            );
        }
        Ok(created)
    }

    /// Write `rules` to `info/exclude`.
    pub async fn write_exclusions(&self, rules: &ExclusionRuleSet) -> Result<(), CheckpointError> {
        let info = self.git_dir.join("info");
        tokio::fs::create_dir_all(&info).await?;
        tokio::fs::write(info.join("exclude"), rules.to_exclude_file()).await?;
        Ok(())
    }

    /// Stage everything not excluded and commit it. Empty commits are
    /// allowed, so every call yields a new hash.
    pub async fn stage_and_commit(&self, message: &str) -> Result<String, CheckpointError> {
        self.stage_all().await?;
        self.git(&["commit", "--quiet", "--allow-empty", "--no-verify", "-m", message])
            .await?;
        self.head().await?.ok_or_else(|| CheckpointError::ShadowRepository {
            command: "rev-parse HEAD".into(),
            message: "no HEAD after commit".into(),
        })
    }

    /// Reset the working tree to `hash`, then verify HEAD. Returns the full
    /// hash restored.
    ///
    /// Files created after `hash` are removed unless excluded; excluded and
    /// ignored files are left alone.
    pub async fn reset_hard(&self, hash: &str) -> Result<String, CheckpointError> {
        let expected = self.resolve(hash).await?;
        self.git(&["reset", "--hard", "--quiet", &expected]).await?;
        self.git(&["clean", "-fd", "--quiet"]).await?;

        let actual = self.head().await?.unwrap_or_default();
        if actual != expected {
            return Err(CheckpointError::RestoreVerification { expected, actual });
        }
        Ok(expected)
    }

    /// Pin `hash` under `refs/waypoint/` so it stays reachable after a reset
    /// moves the branch back past it.
    pub async fn pin(&self, hash: &str) -> Result<(), CheckpointError> {
        let name = format!("refs/waypoint/{hash}");
        self.git(&["update-ref", &name, hash]).await?;
        Ok(())
    }

    /// Append a commit to the checkpoint journal.
    pub async fn append_journal(&self, entry: &JournalEntry) -> Result<(), CheckpointError> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.git_dir.join(JOURNAL_FILE))
            .await?;
        file.write_all(entry.to_line().as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every commit ever made, oldest first. Reads the journal, or falls back
    /// to the history reachable from HEAD when there is none.
    pub async fn read_journal(&self) -> Result<Vec<JournalEntry>, CheckpointError> {
        match tokio::fs::read_to_string(self.git_dir.join(JOURNAL_FILE)).await {
            Ok(text) => Ok(text.lines().filter_map(JournalEntry::parse).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(self
                .log()
                .await?
                .into_iter()
                .map(|c| JournalEntry {
                    hash: c.hash,
                    parent: c.parent,
                    timestamp: c.timestamp,
                })
                .collect()),
            Err(e) => Err(e.into()),
        }
    }

    /// Unified diff. `(None, None)`: working tree against HEAD.
    /// `(Some(from), None)`: working tree against `from`. `(from, Some(to))`:
    /// `from` (default HEAD) against `to`.
    pub async fn diff(&self, from: Option<&str>, to: Option<&str>) -> Result<String, CheckpointError> {
        let args = self.diff_args(from, to).await?;
        let mut argv = vec!["diff", "--no-color", "--no-ext-diff"];
        argv.extend(args.iter().map(String::as_str));
        self.git(&argv).await
    }

    /// Files that differ, with the same defaults as [`diff`](Self::diff).
    pub async fn changed_files(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<ChangedFile>, CheckpointError> {
        let args = self.diff_args(from, to).await?;
        let mut argv = vec!["diff", "--name-status", "--no-renames", "-z"];
        argv.extend(args.iter().map(String::as_str));
        let out = self.git(&argv).await?;

        let mut fields = out.split('\0').filter(|f| !f.is_empty());
        let mut files = Vec::new();
        while let (Some(status), Some(path)) = (fields.next(), fields.next()) {
            files.push(ChangedFile {
                kind: ChangeKind::from_status(status),
                path: path.to_string(),
            });
        }
        Ok(files)
    }

    /// All commits, oldest first.
    pub async fn log(&self) -> Result<Vec<CommitInfo>, CheckpointError> {
        if self.head().await?.is_none() {
            return Ok(Vec::new());
        }
        let out = self
            .git(&["log", "--reverse", "--format=%H%x1f%P%x1f%ct%x1f%s"])
            .await?;
        Ok(out.lines().filter_map(parse_log_line).collect())
    }

    /// Current HEAD, or `None` before the first commit.
    pub async fn head(&self) -> Result<Option<String>, CheckpointError> {
        let output = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    /// Whether `hash` names a commit in this repository.
    pub async fn commit_exists(&self, hash: &str) -> Result<bool, CheckpointError> {
        if !is_hex(hash) {
            return Ok(false);
        }
        let object = format!("{hash}^{{commit}}");
        Ok(self.run(&["cat-file", "-e", &object]).await?.status.success())
    }

    /// Remove the repository from disk.
    pub async fn delete(&self) -> Result<(), CheckpointError> {
        match tokio::fs::remove_dir_all(&self.git_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Drop the per-directory parent once its last task is gone.
        if let Some(parent) = self.git_dir.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        info!("deleted shadow repository {}", self.git_dir.display());
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────

    /// `add -A`, then drop anything already tracked that is now excluded.
    async fn stage_all(&self) -> Result<(), CheckpointError> {
        self.git(&["add", "-A"]).await?;

        let tracked_ignored = self
            .git(&["ls-files", "-z", "--cached", "--ignored", "--exclude-standard"])
            .await?;
        let paths: Vec<&str> = tracked_ignored.split('\0').filter(|p| !p.is_empty()).collect();
        for batch in paths.chunks(UNTRACK_BATCH) {
            let mut argv = vec!["rm", "--cached", "--quiet", "--ignore-unmatch", "--"];
            argv.extend(batch);
            self.git(&argv).await?;
        }
        Ok(())
    }

    /// Full hash for `hash`, or `NotFound`.
    async fn resolve(&self, hash: &str) -> Result<String, CheckpointError> {
        if !self.commit_exists(hash).await? {
            return Err(CheckpointError::NotFound { hash: hash.into() });
        }
        let object = format!("{hash}^{{commit}}");
        Ok(self
            .git(&["rev-parse", "--verify", &object])
            .await?
            .trim()
            .to_string())
    }

    /// Arguments selecting the two sides of a diff. Sides involving the
    /// working tree stage it first, so new files show up.
    async fn diff_args(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<String>, CheckpointError> {
        let base = match from {
            Some(hash) => self.resolve(hash).await?,
            None => self
                .head()
                .await?
                .unwrap_or_else(|| EMPTY_TREE.to_string()),
        };
        match to {
            Some(hash) => Ok(vec![base, self.resolve(hash).await?]),
            None => {
                self.stage_all().await?;
                Ok(vec!["--cached".into(), base])
            }
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String, CheckpointError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(CheckpointError::ShadowRepository {
                command: args.join(" "),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run(&self, args: &[&str]) -> Result<Output, CheckpointError> {
        let mut cmd = Command::new(&self.git_binary);
        cmd.arg(format!("--git-dir={}", self.git_dir.display()))
            .arg(format!("--work-tree={}", self.work_tree.display()))
            .args(args)
            .current_dir(&self.work_tree)
            .stdin(Stdio::null());
        for var in GIT_ENV_OVERRIDES {
            cmd.env_remove(var);
        }

        let started = Instant::now();
        let output = cmd.output().await?;
        debug!(
            "git {} -> {} in {:?}",
            args.join(" "),
            output.status.code().unwrap_or(-1),
            started.elapsed()
        );
        Ok(output)
    }
}

/// First 16 hex chars of SHA-256 of the working directory path.
pub fn work_tree_hash(work_tree: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(work_tree.to_string_lossy().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.len() <= 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_log_line(line: &str) -> Option<CommitInfo> {
    let mut fields = line.splitn(4, '\x1f');
    let hash = fields.next()?.to_string();
    let parent = fields
        .next()?
        .split_whitespace()
        .next()
        .map(str::to_string);
    let secs: i64 = fields.next()?.parse().ok()?;
    let subject = fields.next().unwrap_or_default().to_string();
    Some(CommitInfo {
        hash,
        parent,
        timestamp: secs * 1000,
        subject,
    })
}
