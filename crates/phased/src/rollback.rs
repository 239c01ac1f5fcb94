//! Git savepoints and rollback.
//!
//! A savepoint is a force-overwritable tag on HEAD taken before each
//! attempt, under `savepoint/<run key>/`. Rolling back resets to the tag and
//! removes untracked files, but a safe rollback refuses to run when the clean
//! would delete a protected path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::git::{self, run_key, sanitize_ref_component};

pub const PROTECTED_REFUSAL: &str = "Protected files would be deleted";

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("failed to inspect workspace: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RollbackError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Savepoint {
    pub tag: String,
    pub run_id: String,
    pub phase_id: String,
    pub created_at: DateTime<Utc>,
    /// Uncommitted changes were stashed before tagging.
    pub stashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack {
        tag: String,
        /// Untracked paths removed by the clean.
        removed: Vec<String>,
    },
    Refused {
        message: String,
        protected_paths: Vec<String>,
    },
}

impl RollbackOutcome {
    pub fn is_refused(&self) -> bool {
        matches!(self, Self::Refused { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RollbackManager {
    workspace: PathBuf,
    run_id: String,
    protected: Vec<String>,
}

impl RollbackManager {
    pub fn new(workspace: &Path, run_id: &str, protected: Vec<String>) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            run_id: run_id.to_string(),
            protected,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Ends in `/`, so no other run's namespace starts with it.
    fn tag_prefix(&self) -> String {
        format!("savepoint/{}/", run_key(&self.run_id))
    }

    /// Stash uncommitted work, then tag HEAD.
    pub fn create_savepoint(&self, phase_id: &str) -> Result<Savepoint> {
        let created_at = Utc::now();
        let tag = format!(
            "{}{}-{}",
            self.tag_prefix(),
            sanitize_ref_component(phase_id),
            created_at.format("%Y%m%dT%H%M%SZ")
        );

        let stashed = git::stash_push(&self.workspace, &format!("phased: before {tag}"))?;
        git::tag_force(&self.workspace, &tag)?;

        tracing::debug!(run_id = %self.run_id, phase_id, tag = %tag, stashed, "savepoint created");
        Ok(Savepoint {
            tag,
            run_id: self.run_id.clone(),
            phase_id: phase_id.to_string(),
            created_at,
            stashed,
        })
    }

    /// Reset the workspace to `savepoint`.
    ///
    /// With `safe_clean`, the untracked files the clean would delete are
    /// checked first and the rollback is refused, leaving the tree untouched,
    /// if any of them is protected.
    pub fn rollback_to_savepoint(
        &self,
        savepoint: &Savepoint,
        reason: &str,
        safe_clean: bool,
    ) -> Result<RollbackOutcome> {
        let would_remove = git::clean_dry_run(&self.workspace)?;

        if safe_clean {
            let protected_paths = self.protected_among(&would_remove)?;
            if !protected_paths.is_empty() {
                tracing::warn!(
                    run_id = %self.run_id,
                    phase_id = %savepoint.phase_id,
                    tag = %savepoint.tag,
                    reason,
                    protected = ?protected_paths,
                    "rollback refused"
                );
                return Ok(RollbackOutcome::Refused {
                    message: PROTECTED_REFUSAL.to_string(),
                    protected_paths,
                });
            }
        }

        git::reset_hard(&self.workspace, &savepoint.tag)?;
        git::clean_force(&self.workspace)?;

        tracing::info!(
            run_id = %self.run_id,
            phase_id = %savepoint.phase_id,
            tag = %savepoint.tag,
            reason,
            removed = would_remove.len(),
            "rolled back to savepoint"
        );
        Ok(RollbackOutcome::RolledBack {
            tag: savepoint.tag.clone(),
            removed: would_remove,
        })
    }

    /// Delete this run's savepoint tags. Returns how many were removed.
    pub fn cleanup(&self) -> Result<usize> {
        let tags = git::list_tags(&self.workspace, &format!("{}*", self.tag_prefix()))?;
        for tag in &tags {
            git::delete_tag(&self.workspace, tag)?;
        }
        tracing::debug!(run_id = %self.run_id, count = tags.len(), "savepoint tags removed");
        Ok(tags.len())
    }

    /// Commit the work of a completed phase. Returns false if nothing changed.
    pub fn commit_phase(&self, phase_id: &str) -> Result<bool> {
        let message = format!("phased: complete phase {phase_id} of run {}", self.run_id);
        Ok(git::commit_all(&self.workspace, &message)?)
    }

    /// Protected files among the paths `git clean` would remove, descending
    /// into directories since their content goes with them.
    fn protected_among(&self, would_remove: &[String]) -> Result<Vec<String>> {
        let mut protected = Vec::new();
        for entry in would_remove {
            if entry.ends_with('/') {
                if self.is_protected(entry) {
                    protected.push(entry.clone());
                    continue;
                }
                for file in list_files(&self.workspace, entry.trim_end_matches('/'))? {
                    if self.is_protected(&file) {
                        protected.push(file);
                    }
                }
            } else if self.is_protected(entry) {
                protected.push(entry.clone());
            }
        }
        Ok(protected)
    }

    pub fn is_protected(&self, path: &str) -> bool {
        is_protected(path, &self.protected)
    }
}

/// Whether a workspace-relative path matches any protected pattern.
///
/// Patterns ending in `/` match a directory segment anywhere in the path.
/// Patterns containing `/` match the whole path; others match the file name.
/// Glob syntax; `*` may cross `/`.
pub fn is_protected(path: &str, patterns: &[String]) -> bool {
    let path = path.trim_start_matches("./");
    let trimmed = path.trim_end_matches('/');
    let name = trimmed.rsplit('/').next().unwrap_or(trimmed);

    patterns.iter().any(|pattern| {
        if let Some(dir) = pattern.strip_suffix('/') {
            let dir = dir.trim_start_matches("./");
            let as_dir = format!("{trimmed}/");
            as_dir.starts_with(&format!("{dir}/")) || as_dir.contains(&format!("/{dir}/"))
        } else if pattern.contains('/') {
            glob_match(pattern, trimmed)
        } else {
            glob_match(pattern, name)
        }
    })
}

/// An unparsable pattern only matches itself.
fn glob_match(pattern: &str, text: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(compiled) => compiled.matches(text),
        Err(_) => pattern == text,
    }
}

/// All files under `root/relative`, as `/`-separated paths relative to `root`.
fn list_files(root: &Path, relative: &str) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root.join(relative)) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(path) = entry.path().strip_prefix(root) {
            files.push(path.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::setup_test_repo;
    use phase_core::config::default_protected_paths;

    fn manager(repo: &Path) -> RollbackManager {
        RollbackManager::new(repo, "run-1", default_protected_paths())
    }

    #[test]
    fn protected_patterns() {
        let patterns = default_protected_paths();
        for path in [
            ".env",
            ".env.local",
            "config/.env",
            "certs/server.pem",
            "id.key",
            "credentials.json",
            "data/app.db",
            "cache.sqlite3",
            ".phased/locks/a.lock",
            "logs/",
            "nested/logs/out.txt",
        ] {
            assert!(is_protected(path, &patterns), "{path}");
        }
        for path in ["src/main.rs", "environment.md", "keys.rs", "logsfile.txt", "dbg.txt"] {
            assert!(!is_protected(path, &patterns), "{path}");
        }
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*.pem", "a.pem"));
        assert!(glob_match("credentials*", "credentials"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b", "ac"));
        assert!(glob_match("config/*.toml", "config/app.toml"));
        assert!(glob_match("id_[re]sa*", "id_rsa.pub"));
        assert!(glob_match("[oops", "[oops"));
    }

    #[test]
    fn list_files_walks_nested_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("build/keys/old")).unwrap();
        std::fs::write(dir.path().join("build/app.log"), "").unwrap();
        std::fs::write(dir.path().join("build/keys/old/server.pem"), "").unwrap();

        let mut files = list_files(dir.path(), "build").unwrap();
        files.sort();
        assert_eq!(files, vec!["build/app.log", "build/keys/old/server.pem"]);
    }

    #[test]
    fn rollback_restores_tracked_and_removes_untracked() {
        let repo = setup_test_repo();
        let manager = manager(repo.path());
        let savepoint = manager.create_savepoint("p1").unwrap();
        assert!(savepoint.tag.starts_with(&format!("savepoint/{}/p1-", run_key("run-1"))));
        assert!(!savepoint.stashed);

        std::fs::write(repo.path().join("README.md"), "broken").unwrap();
        std::fs::write(repo.path().join("junk.txt"), "junk").unwrap();

        let outcome = manager
            .rollback_to_savepoint(&savepoint, "attempt failed", true)
            .unwrap();
        assert!(matches!(outcome, RollbackOutcome::RolledBack { .. }));
        assert_eq!(
            std::fs::read_to_string(repo.path().join("README.md")).unwrap(),
            "# Test"
        );
        assert!(!repo.path().join("junk.txt").exists());
    }

    #[test]
    fn safe_rollback_refuses_to_delete_protected_files() {
        let repo = setup_test_repo();
        let manager = manager(repo.path());
        let savepoint = manager.create_savepoint("p1").unwrap();

        std::fs::write(repo.path().join("README.md"), "changed").unwrap();
        std::fs::write(repo.path().join(".env"), "SECRET=1").unwrap();
        std::fs::create_dir(repo.path().join("out")).unwrap();
        std::fs::write(repo.path().join("out/server.key"), "k").unwrap();

        let outcome = manager
            .rollback_to_savepoint(&savepoint, "attempt failed", true)
            .unwrap();
        let RollbackOutcome::Refused {
            message,
            mut protected_paths,
        } = outcome
        else {
            panic!("expected refusal");
        };
        protected_paths.sort();
        assert_eq!(message, PROTECTED_REFUSAL);
        assert_eq!(protected_paths, vec![".env", "out/server.key"]);
        // Nothing was touched.
        assert!(repo.path().join(".env").exists());
        assert_eq!(
            std::fs::read_to_string(repo.path().join("README.md")).unwrap(),
            "changed"
        );
    }

    #[test]
    fn unsafe_rollback_cleans_everything() {
        let repo = setup_test_repo();
        let manager = manager(repo.path());
        let savepoint = manager.create_savepoint("p1").unwrap();
        std::fs::write(repo.path().join(".env"), "SECRET=1").unwrap();

        let outcome = manager
            .rollback_to_savepoint(&savepoint, "forced", false)
            .unwrap();
        assert!(!outcome.is_refused());
        assert!(!repo.path().join(".env").exists());
    }

    #[test]
    fn savepoint_stashes_uncommitted_work() {
        let repo = setup_test_repo();
        let manager = manager(repo.path());
        std::fs::write(repo.path().join("wip.txt"), "wip").unwrap();

        let savepoint = manager.create_savepoint("p1").unwrap();
        assert!(savepoint.stashed);
        assert!(!repo.path().join("wip.txt").exists());
    }

    #[test]
    fn cleanup_removes_only_this_runs_tags() {
        let repo = setup_test_repo();
        let mine = manager(repo.path());
        let other = RollbackManager::new(repo.path(), "other", Vec::new());
        mine.create_savepoint("p1").unwrap();
        mine.create_savepoint("p2").unwrap();
        other.create_savepoint("p1").unwrap();

        assert_eq!(mine.cleanup().unwrap(), 2);
        assert_eq!(mine.cleanup().unwrap(), 0);
        assert_eq!(
            git::list_tags(repo.path(), "savepoint/*").unwrap().len(),
            1
        );
    }

    #[test]
    fn cleanup_spares_runs_sharing_an_id_prefix() {
        let repo = setup_test_repo();
        let short = RollbackManager::new(repo.path(), "r", Vec::new());
        let long = RollbackManager::new(repo.path(), "r-x", Vec::new());
        let savepoint = long.create_savepoint("p1").unwrap();

        assert_eq!(short.cleanup().unwrap(), 0);

        std::fs::write(repo.path().join("README.md"), "broken").unwrap();
        let outcome = long
            .rollback_to_savepoint(&savepoint, "attempt failed", true)
            .unwrap();
        assert!(!outcome.is_refused());
        assert_eq!(
            std::fs::read_to_string(repo.path().join("README.md")).unwrap(),
            "# Test"
        );
    }

    #[test]
    fn commit_phase_records_work() {
        let repo = setup_test_repo();
        let manager = manager(repo.path());
        assert!(!manager.commit_phase("p1").unwrap());

        std::fs::write(repo.path().join("feature.rs"), "fn main() {}").unwrap();
        assert!(manager.commit_phase("p1").unwrap());
        let savepoint = manager.create_savepoint("p2").unwrap();
        assert!(!savepoint.stashed);
        assert!(repo.path().join("feature.rs").exists());
    }
}
