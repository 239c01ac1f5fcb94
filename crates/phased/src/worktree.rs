//! Per-run git worktrees.
//!
//! Each run executes in `<worktree_root>/<run key>` on branch
//! `<run_branch_prefix><run key>`, isolated from other runs and from the
//! source checkout. The run key is the sanitized id plus a hash suffix.

use phase_core::config::Config;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::git::{self, run_key};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("worktree path exists and is not a git worktree: {0}")]
    PathOccupied(PathBuf),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    repo: PathBuf,
    worktree_root: PathBuf,
    branch_prefix: String,
    base_branch: Option<String>,
}

impl WorkspaceManager {
    pub fn new(repo: &Path, config: &Config) -> Self {
        let worktree_root = if config.worktree_root.is_relative() {
            repo.join(&config.worktree_root)
        } else {
            config.worktree_root.clone()
        };
        Self {
            repo: repo.to_path_buf(),
            worktree_root,
            branch_prefix: config.run_branch_prefix.clone(),
            base_branch: config.base_branch.clone(),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn worktree_path(&self, run_id: &str) -> PathBuf {
        self.worktree_root.join(run_key(run_id))
    }

    pub fn run_branch(&self, run_id: &str) -> String {
        format!("{}{}", self.branch_prefix, run_key(run_id))
    }

    /// Create the worktree for a run and return its path.
    ///
    /// An existing worktree left by an interrupted run is reused.
    pub fn create_worktree(&self, run_id: &str) -> Result<PathBuf> {
        let path = self.worktree_path(run_id);
        if path.exists() {
            if path.join(".git").exists() {
                tracing::info!(run_id, path = %path.display(), "reusing existing worktree");
                return Ok(path);
            }
            return Err(WorktreeError::PathOccupied(path));
        }

        let base = match &self.base_branch {
            Some(branch) => branch.clone(),
            None => git::detect_default_branch(&self.repo)?,
        };
        let branch = self.run_branch(run_id);
        git::add_worktree(&self.repo, &path, &branch, &base)?;

        tracing::info!(
            run_id,
            path = %path.display(),
            branch = %branch,
            base = %base,
            "worktree created"
        );
        Ok(path)
    }

    /// Remove a run's worktree. Missing worktrees are not an error.
    pub fn remove_worktree(&self, run_id: &str) -> Result<()> {
        let path = self.worktree_path(run_id);
        if path.exists() {
            git::remove_worktree_force(&self.repo, &path)?;
            tracing::info!(run_id, path = %path.display(), "worktree removed");
        }
        git::prune_worktrees(&self.repo)?;
        Ok(())
    }
}
