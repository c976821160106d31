//! Glob patterns that must never be snapshotted.
//!
//! An [`ExclusionRuleSet`] is written to the shadow repository's
//! `info/exclude` before every commit. Patterns come, in priority order, from:
//!
//! 1. [`DEFAULT_EXCLUSIONS`]: dependency directories, VCS metadata, build
//!    output, OS metadata files, plus any Git LFS patterns declared in the
//!    project's `.gitattributes`.
//! 2. The project's own ignore file (`.gitignore`).
//! 3. The agent ignore file (`.waypointignore`), which may re-include paths
//!    with `!pattern`.
//!
//! Later patterns win, as in any gitignore file. The set remembers the
//! modification times of its source files; [`ExclusionRuleSet::refresh`]
//! recomputes it only when one of them changed.

use crate::config::CheckpointConfig;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Patterns excluded from every checkpoint.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    // VCS metadata
    ".git/",
    ".hg/",
    ".svn/",
    // Dependencies
    "node_modules/",
    "bower_components/",
    ".pnpm-store/",
    "vendor/bundle/",
    ".venv/",
    "venv/",
    "__pycache__/",
    "*.pyc",
    ".tox/",
    ".mypy_cache/",
    ".pytest_cache/",
    ".gradle/",
    // Build output
    "target/",
    "build/",
    "dist/",
    "out/",
    ".next/",
    ".nuxt/",
    ".turbo/",
    ".cache/",
    "coverage/",
    "*.o",
    "*.class",
    // OS and editor metadata
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "*.swp",
    "*.swo",
];

const GITATTRIBUTES: &str = ".gitattributes";

/// Modification time of one source file at the time the set was computed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceStamp {
    path: PathBuf,
    /// `None` if the file did not exist.
    modified: Option<SystemTime>,
}

impl SourceStamp {
    fn take(path: PathBuf) -> Self {
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self { path, modified }
    }

    fn changed(&self) -> bool {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            != self.modified
    }
}

/// Ordered exclusion patterns for one working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionRuleSet {
    patterns: Vec<String>,
    sources: Vec<SourceStamp>,
}

impl ExclusionRuleSet {
    /// Compute the pattern list for `workdir`. Missing ignore files
    /// contribute nothing; unreadable ones are logged and skipped.
    pub fn compute_for_directory(workdir: &Path, config: &CheckpointConfig) -> Self {
        let attributes = workdir.join(GITATTRIBUTES);
        let project = workdir.join(&config.project_ignore_file);
        let agent = workdir.join(&config.agent_ignore_file);

        let mut patterns: Vec<String> = DEFAULT_EXCLUSIONS.iter().map(|p| p.to_string()).collect();
        if let Some(text) = read_source(&attributes) {
            patterns.extend(parse_lfs_patterns(&text));
        }
        if let Some(text) = read_source(&project) {
            patterns.extend(parse_ignore_file(&text));
        }
        if let Some(text) = read_source(&agent) {
            patterns.extend(parse_ignore_file(&text));
        }

        debug!(
            "computed {} exclusion patterns for {}",
            patterns.len(),
            workdir.display()
        );
        Self {
            patterns,
            sources: [attributes, project, agent]
                .into_iter()
                .map(SourceStamp::take)
                .collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether any source file changed since the set was computed.
    pub fn is_stale(&self) -> bool {
        self.sources.iter().any(SourceStamp::changed)
    }

    /// Recompute if stale. Returns `true` if the pattern list changed.
    pub fn refresh(&mut self, workdir: &Path, config: &CheckpointConfig) -> bool {
        if !self.is_stale() {
            return false;
        }
        let fresh = Self::compute_for_directory(workdir, config);
        let changed = fresh.patterns != self.patterns;
        *self = fresh;
        changed
    }

    /// Render as the contents of a git `info/exclude` file.
    pub fn to_exclude_file(&self) -> String {
        let mut out = String::from("# Generated by waypoint. Rewritten before every checkpoint.\n");
        for pattern in &self.patterns {
            out.push_str(pattern);
            out.push('\n');
        }
        out
    }
}

fn read_source(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("ignoring unreadable ignore file {}: {e}", path.display());
            None
        }
    }
}

/// Patterns from a gitignore-format file: blank lines and comments dropped,
/// trailing whitespace trimmed, negations kept.
pub fn parse_ignore_file(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Patterns whose attributes include `filter=lfs`.
pub fn parse_lfs_patterns(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pattern = fields.next()?;
            fields
                .any(|attr| attr == "filter=lfs")
                .then(|| pattern.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CheckpointConfig {
        CheckpointConfig::default()
    }

    #[test]
    fn defaults_only_for_bare_directory() {
        let dir = tempfile::tempdir().unwrap();
        let rules = ExclusionRuleSet::compute_for_directory(dir.path(), &config());
        assert_eq!(rules.patterns().len(), DEFAULT_EXCLUSIONS.len());
        assert!(rules.patterns().iter().any(|p| p == "node_modules/"));
    }

    #[test]
    fn sources_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "# comment\n*.tmp\n\nsecrets/  \n").unwrap();
        std::fs::write(dir.path().join(".waypointignore"), "!keep.tmp\nscratch/\n").unwrap();
        std::fs::write(
            dir.path().join(".gitattributes"),
            "*.psd filter=lfs diff=lfs merge=lfs -text\n*.rs text\n",
        )
        .unwrap();

        let rules = ExclusionRuleSet::compute_for_directory(dir.path(), &config());
        let tail: Vec<&str> = rules.patterns()[DEFAULT_EXCLUSIONS.len()..]
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(tail, ["*.psd", "*.tmp", "secrets/", "!keep.tmp", "scratch/"]);
    }

    #[test]
    fn recompute_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "a\nb\n").unwrap();
        let first = ExclusionRuleSet::compute_for_directory(dir.path(), &config());
        let second = ExclusionRuleSet::compute_for_directory(dir.path(), &config());
        assert_eq!(first.patterns(), second.patterns());
        assert_eq!(first.to_exclude_file(), second.to_exclude_file());
        assert!(!first.is_stale());
    }

    #[test]
    fn refresh_picks_up_new_ignore_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut rules = ExclusionRuleSet::compute_for_directory(dir.path(), &config());
        assert!(!rules.refresh(dir.path(), &config()));

        std::fs::write(dir.path().join(".waypointignore"), "logs/\n").unwrap();
        assert!(rules.is_stale());
        assert!(rules.refresh(dir.path(), &config()));
        assert_eq!(rules.patterns().last().map(String::as_str), Some("logs/"));
        assert!(!rules.is_stale());
    }

    #[test]
    fn custom_agent_ignore_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".agentignore"), "x/\n").unwrap();
        let cfg = config().with_agent_ignore_file(".agentignore");
        let rules = ExclusionRuleSet::compute_for_directory(dir.path(), &cfg);
        assert_eq!(rules.patterns().last().map(String::as_str), Some("x/"));
    }

    #[test]
    fn exclude_file_lists_every_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let rules = ExclusionRuleSet::compute_for_directory(dir.path(), &config());
        let text = rules.to_exclude_file();
        assert!(text.starts_with('#'));
        assert_eq!(text.lines().count(), rules.patterns().len() + 1);
    }

    #[test]
    fn lfs_parser_ignores_other_attributes() {
        let text = "# lfs\n*.bin filter=lfs\n*.txt eol=lf\n\n";
        assert_eq!(parse_lfs_patterns(text), ["*.bin"]);
    }
}
