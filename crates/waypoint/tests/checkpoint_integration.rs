//! Integration tests for checkpoints against a real `git` binary.
//!
//! Each test uses two temp directories: the working directory being
//! checkpointed and a separate storage root for shadow repositories. Tests
//! return early when `git` is not installed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use waypoint::checkpoint::{ChangeKind, CheckpointState, CheckpointTracker};
use waypoint::config::CheckpointConfig;
use waypoint::error::CheckpointError;
use waypoint::telemetry::{CheckpointOperation, RecordingTelemetry};

fn git_available() -> bool {
    let ok = std::process::Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success());
    if !ok {
        eprintln!("git not found; skipping");
    }
    ok
}

struct Fixture {
    work: tempfile::TempDir,
    storage: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            work: tempfile::tempdir().unwrap(),
            storage: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self) -> CheckpointConfig {
        CheckpointConfig::default().with_storage_root(self.storage.path())
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.work.path().join(rel)
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path(rel)).unwrap()
    }

    async fn tracker(&self) -> CheckpointTracker {
        CheckpointTracker::open(self.work.path(), "task-1", self.config())
            .await
            .unwrap()
    }
}

/// A `git` stand-in: runs `prelude` in `sh`, then hands over to real git.
#[cfg(unix)]
fn git_wrapper(dir: &Path, prelude: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("git-wrapper.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{prelude}\nexec git \"$@\"\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn shadow_config_value(git_dir: &Path, key: &str) -> String {
    let out = std::process::Command::new("git")
        .arg(format!("--git-dir={}", git_dir.display()))
        .args(["config", "--get", key])
        .output()
        .unwrap();
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn user_git(dir: &Path, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
        .args(["-c", "user.name=t", "-c", "user.email=t@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(out.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&out.stdout).into_owned()
}

// ── Commit and restore ───────────────────────────────────────────────

#[tokio::test]
async fn restore_after_commit_reproduces_tree_and_leaves_excluded_files() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "alpha\n");
    fx.write("src/lib.rs", "pub fn lib() {}\n");
    fx.write(".gitignore", "*.log\n");
    fx.write("debug.log", "log v1\n");
    fx.write("node_modules/dep/index.js", "dep v1\n");

    let tracker = fx.tracker().await;
    let hash = tracker.commit().await.unwrap();

    fx.write("a.txt", "alpha changed\n");
    std::fs::remove_file(fx.path("src/lib.rs")).unwrap();
    fx.write("new.txt", "created later\n");
    fx.write("debug.log", "log v2\n");
    fx.write("node_modules/dep/index.js", "dep v2\n");

    tracker.restore(&hash).await.unwrap();

    assert_eq!(fx.read("a.txt"), "alpha\n");
    assert_eq!(fx.read("src/lib.rs"), "pub fn lib() {}\n");
    assert!(!fx.path("new.txt").exists());
    // Ignored and excluded files are never touched.
    assert_eq!(fx.read("debug.log"), "log v2\n");
    assert_eq!(fx.read("node_modules/dep/index.js"), "dep v2\n");
}

#[tokio::test]
async fn restore_keeps_files_excluded_after_the_checkpoint() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "alpha\n");
    let tracker = fx.tracker().await;
    let hash = tracker.commit().await.unwrap();

    // New exclusions appear after the last commit; no commit picks them up.
    fx.write(".waypointignore", "notes/\n.waypointignore\n");
    fx.write("notes/todo.md", "keep me\n");
    fx.write("a.txt", "alpha changed\n");

    tracker.restore(&hash).await.unwrap();

    assert_eq!(fx.read("a.txt"), "alpha\n");
    assert_eq!(fx.read("notes/todo.md"), "keep me\n");
    assert!(fx.path(".waypointignore").exists());
}

#[tokio::test]
async fn unknown_hash_is_not_found_and_tree_untouched() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "one\n");
    let tracker = fx.tracker().await;
    tracker.commit().await.unwrap();
    fx.write("a.txt", "two\n");

    for bogus in ["0123456789abcdef0123456789abcdef01234567", "--hard", "HEAD~1"] {
        let err = tracker.restore(bogus).await.unwrap_err();
        assert!(
            matches!(err, CheckpointError::NotFound { .. }),
            "{bogus}: {err}"
        );
    }
    assert_eq!(fx.read("a.txt"), "two\n");
    assert!(!tracker.is_degraded().await);
}

#[tokio::test]
async fn empty_commit_yields_new_hash() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "same\n");
    let tracker = fx.tracker().await;

    let first = tracker.commit().await.unwrap();
    let before = tracker.list_checkpoints().await.len();
    let second = tracker.commit().await.unwrap();
    let list = tracker.list_checkpoints().await;

    assert_ne!(first, second);
    assert_eq!(list.len(), before + 1);
    assert_eq!(list[0].state, CheckpointState::Superseded);
    assert_eq!(list[1].state, CheckpointState::Active);
    assert_eq!(list[1].parent_hash.as_deref(), Some(first.as_str()));
}

#[tokio::test]
async fn restore_states_and_idempotence() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "v1\n");
    let tracker = fx.tracker().await;
    let c1 = tracker.commit().await.unwrap();
    fx.write("a.txt", "v2\n");
    let c2 = tracker.commit().await.unwrap();

    tracker.restore(&c1).await.unwrap();
    tracker.restore(&c1).await.unwrap();
    assert_eq!(fx.read("a.txt"), "v1\n");

    let list = tracker.list_checkpoints().await;
    assert_eq!(list[0].commit_hash, c1);
    assert_eq!(list[0].state, CheckpointState::RolledBackTo);
    assert_eq!(list[1].commit_hash, c2);
    assert_eq!(list[1].state, CheckpointState::Superseded);

    // Restoring forward again is allowed: every checkpoint is kept.
    tracker.restore(&c2).await.unwrap();
    assert_eq!(fx.read("a.txt"), "v2\n");

    fx.write("a.txt", "v3\n");
    let c3 = tracker.commit().await.unwrap();
    let list = tracker.list_checkpoints().await;
    assert_eq!(list.len(), 3);
    assert_eq!(list[1].state, CheckpointState::Superseded);
    assert_eq!(list[2].commit_hash, c3);
    assert_eq!(list[2].state, CheckpointState::Active);
    assert_eq!(list.iter().filter(|c| c.state.is_current()).count(), 1);
}

#[tokio::test]
async fn reopen_reloads_history() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "v1\n");
    let c1 = {
        let tracker = fx.tracker().await;
        let c1 = tracker.commit().await.unwrap();
        fx.write("a.txt", "v2\n");
        tracker.commit().await.unwrap();
        tracker.restore(&c1).await.unwrap();
        c1
    };

    let tracker = fx.tracker().await;
    let list = tracker.list_checkpoints().await;
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].commit_hash, c1);
    assert_eq!(list[0].state, CheckpointState::RolledBackTo);
    assert_eq!(list[1].state, CheckpointState::Superseded);
    assert_eq!(tracker.current().await.map(|c| c.commit_hash), Some(c1));
}

// ── Diff ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn diff_defaults() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "old line\n");
    let tracker = fx.tracker().await;
    let c1 = tracker.commit().await.unwrap();

    fx.write("a.txt", "new line\n");
    fx.write("b.txt", "brand new\n");

    let working = tracker.diff(None, None).await.unwrap();
    assert!(working.contains("-old line"));
    assert!(working.contains("+new line"));
    assert!(working.contains("b.txt"));

    let changed = tracker.changed_files(Some(&c1), None).await.unwrap();
    assert!(changed.iter().any(|f| f.path == "a.txt" && f.kind == ChangeKind::Modified));
    assert!(changed.iter().any(|f| f.path == "b.txt" && f.kind == ChangeKind::Added));

    let c2 = tracker.commit().await.unwrap();
    let between = tracker.diff(Some(&c1), Some(&c2)).await.unwrap();
    assert!(between.contains("+new line"));
    assert!(tracker.diff(None, None).await.unwrap().is_empty());

    let err = tracker.diff(Some("deadbeef"), None).await.unwrap_err();
    assert!(matches!(err, CheckpointError::NotFound { .. }));
}

// ── Isolation ────────────────────────────────────────────────────────

#[tokio::test]
async fn user_repository_is_untouched() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "tracked by the user\n");
    user_git(fx.work.path(), &["init", "--quiet"]);
    user_git(fx.work.path(), &["add", "a.txt"]);
    user_git(fx.work.path(), &["commit", "--quiet", "-m", "user commit"]);
    let user_head = user_git(fx.work.path(), &["rev-parse", "HEAD"]);

    fx.write("scratch.txt", "agent output\n");
    let tracker = fx.tracker().await;
    let hash = tracker.commit().await.unwrap();

    assert_eq!(user_git(fx.work.path(), &["rev-parse", "HEAD"]), user_head);
    assert!(!tracker.shadow().git_dir().starts_with(fx.work.path()));
    assert_ne!(hash.trim(), user_head.trim());

    // The user's index still does not know about the scratch file.
    let status = user_git(fx.work.path(), &["status", "--porcelain"]);
    assert!(status.contains("?? scratch.txt"));
}

#[tokio::test]
async fn exclusions_are_deterministic_and_refresh() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write(".waypointignore", "secrets/\n");
    let tracker = fx.tracker().await;

    let first = tracker.exclusions().await.unwrap();
    assert_eq!(first, tracker.exclusions().await.unwrap());
    assert_eq!(first.last().map(String::as_str), Some("secrets/"));

    fx.write("secrets/key.pem", "private\n");
    fx.write("visible.txt", "hello\n");
    let c1 = tracker.commit().await.unwrap();
    fx.write("visible.txt", "hello again\n");
    let c2 = tracker.commit().await.unwrap();
    let changed = tracker.changed_files(Some(&c1), Some(&c2)).await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].path, "visible.txt");

    let from_empty = tracker.diff(None, None).await.unwrap();
    assert!(!from_empty.contains("key.pem"));
}

// ── Failure recovery ─────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn interrupted_setup_is_finished_on_next_open() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "x\n");
    let tools = tempfile::tempdir().unwrap();
    let failed_once = tools.path().join("failed-once");
    let git = git_wrapper(
        tools.path(),
        &format!(
            "for a in \"$@\"; do\n  if [ \"$a\" = core.hooksPath ] && [ ! -e '{flag}' ]; then\n    touch '{flag}'; echo boom >&2; exit 1\n  fi\ndone",
            flag = failed_once.display()
        ),
    );
    let config = fx.config().with_git_binary(git);

    let err = CheckpointTracker::open(fx.work.path(), "task-1", config.clone())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CheckpointError::ShadowRepository { .. }));
    assert!(failed_once.exists());

    let tracker = CheckpointTracker::open(fx.work.path(), "task-1", config)
        .await
        .unwrap();
    let git_dir = tracker.shadow().git_dir().to_path_buf();
    assert_eq!(
        shadow_config_value(&git_dir, "core.hooksPath"),
        git_dir.join("no-hooks").to_string_lossy()
    );
    assert_eq!(shadow_config_value(&git_dir, "commit.gpgsign"), "false");
    assert!(!shadow_config_value(&git_dir, "user.email").is_empty());
    assert!(tracker.commit().await.is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn failed_restore_verification_degrades_until_cleared() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    let tools = tempfile::tempdir().unwrap();
    let break_reset = tools.path().join("break-reset");
    // While the flag exists, `reset` reports success without moving HEAD.
    let git = git_wrapper(
        tools.path(),
        &format!(
            "if [ -e '{flag}' ]; then\n  for a in \"$@\"; do\n    if [ \"$a\" = reset ]; then exit 0; fi\n  done\nfi",
            flag = break_reset.display()
        ),
    );
    let tracker = CheckpointTracker::open(fx.work.path(), "task-1", fx.config().with_git_binary(git))
        .await
        .unwrap();

    fx.write("a.txt", "v1\n");
    let c1 = tracker.commit().await.unwrap();
    fx.write("a.txt", "v2\n");
    let c2 = tracker.commit().await.unwrap();

    std::fs::write(&break_reset, "").unwrap();
    let err = tracker.restore(&c1).await.unwrap_err();
    assert!(matches!(err, CheckpointError::RestoreVerification { .. }));
    assert!(tracker.is_degraded().await);
    assert!(matches!(tracker.commit().await, Err(CheckpointError::Degraded)));
    assert!(matches!(tracker.restore(&c2).await, Err(CheckpointError::Degraded)));
    assert_eq!(tracker.list_checkpoints().await.len(), 2);

    std::fs::remove_file(&break_reset).unwrap();
    tracker.clear_degraded().await;
    assert!(!tracker.is_degraded().await);
    tracker.restore(&c1).await.unwrap();
    assert_eq!(fx.read("a.txt"), "v1\n");
    assert!(tracker.commit().await.is_ok());
}

// ── Ordering, abort, telemetry ───────────────────────────────────────

#[tokio::test]
async fn mutation_guard_blocks_commits_until_released() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "v1\n");
    let tracker = fx.tracker().await;

    let guard = tracker.mutation_guard().await.unwrap();
    let blocked = tokio::time::timeout(Duration::from_millis(100), tracker.commit()).await;
    assert!(blocked.is_err(), "commit must wait for the guard");

    fx.write("a.txt", "v2\n");
    let hash = guard.commit().await.unwrap();
    assert_eq!(tracker.current().await.map(|c| c.commit_hash), Some(hash));
}

#[tokio::test]
async fn abort_stops_new_commits() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    let tracker = fx.tracker().await;
    tracker.abort_signal().abort();

    assert!(matches!(tracker.commit().await, Err(CheckpointError::Aborted)));
    assert!(tracker.commit_or_log().await.is_none());
    assert!(matches!(
        tracker.mutation_guard().await.map(|_| ()),
        Err(CheckpointError::Aborted)
    ));
    assert!(tracker.list_checkpoints().await.is_empty());

    tracker.abort_signal().reset();
    assert!(tracker.commit_or_log().await.is_some());
}

#[tokio::test]
async fn durations_are_reported() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "x\n");
    let telemetry = RecordingTelemetry::new();
    let tracker = fx.tracker().await.with_telemetry(Arc::new(telemetry.clone()));

    let hash = tracker.commit().await.unwrap();
    tracker.restore(&hash).await.unwrap();
    let _ = tracker.restore("ffffffffffffffffffffffffffffffffffffffff").await;

    assert_eq!(telemetry.count(CheckpointOperation::Commit), 1);
    assert_eq!(telemetry.count(CheckpointOperation::Restore), 2);
    let samples = telemetry.samples();
    assert!(samples.iter().all(|s| s.task_id == "task-1"));
    assert!(!samples.last().unwrap().ok);
}

#[tokio::test]
async fn delete_all_removes_shadow_repository() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    fx.write("a.txt", "x\n");
    let tracker = fx.tracker().await;
    tracker.commit().await.unwrap();
    let git_dir = tracker.shadow().git_dir().to_path_buf();
    assert!(git_dir.exists());

    tracker.delete_all().await.unwrap();
    assert!(!git_dir.exists());
    assert_eq!(fx.read("a.txt"), "x\n");
}

#[tokio::test]
async fn missing_work_dir_is_io_error() {
    let fx = Fixture::new();
    let missing = fx.work.path().join("does-not-exist");
    let err = CheckpointTracker::open(&missing, "t", fx.config())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CheckpointError::Io(_)));
}
