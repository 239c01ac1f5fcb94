//! Git operations used by the executor.
//!
//! Worktrees, savepoint tags, stash, reset and clean. All helpers run `git`
//! synchronously against a local repository and never touch remotes.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run git with `args` in `dir`, returning stdout on success.
fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)
}

/// Run git and report only whether it exited successfully.
fn git_succeeds(dir: &Path, args: &[&str]) -> Result<bool> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    Ok(output.status.success())
}

/// Detect the default branch for a repository.
///
/// Tries `refs/remotes/origin/HEAD`, then the currently checked-out branch,
/// then `main` and `master`.
pub fn detect_default_branch(repo: &Path) -> Result<String> {
    if let Ok(full_ref) = run_git(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = full_ref.trim().strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    if let Ok(current) = run_git(repo, &["branch", "--show-current"]) {
        let current = current.trim();
        if !current.is_empty() {
            return Ok(current.to_string());
        }
    }

    for candidate in ["main", "master"] {
        if branch_exists(repo, candidate)? {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

/// Check if a branch exists locally.
pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    git_succeeds(
        repo,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )
}

/// Resolve HEAD to a commit id.
pub fn head_commit(repo: &Path) -> Result<String> {
    Ok(run_git(repo, &["rev-parse", "HEAD"])?.trim().to_string())
}

/// Replace characters that are not safe in ref names and directory names.
pub fn sanitize_ref_component(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.replace("..", "-")
    }
}

/// Stable per-run key for file and ref names: the sanitized id plus a hash
/// suffix, so ids that sanitize alike (`a/b`, `a-b`) stay apart.
pub fn run_key(run_id: &str) -> String {
    let digest = Sha256::digest(run_id.as_bytes());
    let suffix: String = format!("{digest:x}").chars().take(12).collect();
    format!("{}-{suffix}", sanitize_ref_component(run_id))
}

/// Add a worktree at `path` on `branch`, creating the branch from `base` if missing.
pub fn add_worktree(repo: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let path_str = path.to_string_lossy();
    if branch_exists(repo, branch)? {
        run_git(repo, &["worktree", "add", path_str.as_ref(), branch])?;
    } else {
        run_git(repo, &["worktree", "add", "-b", branch, path_str.as_ref(), base])?;
    }
    Ok(())
}

/// Force remove a worktree (even with local changes).
pub fn remove_worktree_force(repo: &Path, path: &Path) -> Result<()> {
    run_git(
        repo,
        &["worktree", "remove", "--force", path.to_string_lossy().as_ref()],
    )?;
    Ok(())
}

/// Drop administrative records of worktrees whose directories are gone.
pub fn prune_worktrees(repo: &Path) -> Result<()> {
    run_git(repo, &["worktree", "prune"])?;
    Ok(())
}

/// Check if the working tree is clean, counting untracked files as changes.
pub fn is_working_tree_clean(repo: &Path) -> Result<bool> {
    Ok(run_git(repo, &["status", "--porcelain"])?.trim().is_empty())
}

/// Stash uncommitted changes including untracked files.
///
/// Returns false when there was nothing to stash.
pub fn stash_push(repo: &Path, message: &str) -> Result<bool> {
    if is_working_tree_clean(repo)? {
        return Ok(false);
    }
    run_git(repo, &["stash", "push", "--include-untracked", "-m", message])?;
    Ok(true)
}

/// Create or move `tag` to HEAD.
pub fn tag_force(repo: &Path, tag: &str) -> Result<()> {
    run_git(repo, &["tag", "-f", tag, "HEAD"])?;
    Ok(())
}

/// List tags matching a glob pattern.
pub fn list_tags(repo: &Path, pattern: &str) -> Result<Vec<String>> {
    Ok(run_git(repo, &["tag", "--list", pattern])?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}

pub fn delete_tag(repo: &Path, tag: &str) -> Result<()> {
    run_git(repo, &["tag", "-d", tag])?;
    Ok(())
}

pub fn reset_hard(repo: &Path, rev: &str) -> Result<()> {
    run_git(repo, &["reset", "--hard", rev])?;
    Ok(())
}

/// Paths `git clean -fd` would delete, without deleting anything.
pub fn clean_dry_run(repo: &Path) -> Result<Vec<String>> {
    let stdout = run_git(repo, &["clean", "-fdn"])?;
    Ok(stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Would remove "))
        .map(|path| path.trim().to_string())
        .collect())
}

/// Delete untracked files and directories.
pub fn clean_force(repo: &Path) -> Result<()> {
    run_git(repo, &["clean", "-fd"])?;
    Ok(())
}

/// Create `dir` with a `.gitignore` that hides its whole content from git.
///
/// Keeps executor state (locks, worktrees, database) out of stash, clean and
/// commits of the repository it lives in.
pub fn ignore_directory(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let ignore = dir.join(".gitignore");
    if !ignore.exists() {
        std::fs::write(ignore, "*\n")?;
    }
    Ok(())
}

/// Stage everything and commit. Returns false when there was nothing to commit.
pub fn commit_all(repo: &Path, message: &str) -> Result<bool> {
    if is_working_tree_clean(repo)? {
        return Ok(false);
    }
    run_git(repo, &["add", "--all"])?;
    run_git(repo, &["commit", "--no-verify", "-m", message])?;
    Ok(true)
}
