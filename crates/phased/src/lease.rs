//! Workspace lease: at most one executor works in a given directory.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::lock::{FileLock, LockHolder, Result};

/// Lease on a workspace path, keyed by the SHA-256 of its canonical form.
#[derive(Debug)]
pub struct WorkspaceLease {
    workspace: PathBuf,
    lock: FileLock,
}

/// Canonical form of a workspace path; falls back to the given path if it
/// cannot be resolved.
fn canonical_workspace(workspace: &Path) -> PathBuf {
    workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf())
}

/// Lock file name for a workspace path.
pub fn lease_key(workspace: &Path) -> String {
    let canonical = canonical_workspace(workspace);
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    format!("{digest:x}")
}

impl WorkspaceLease {
    pub fn new(lock_dir: &Path, workspace: &Path) -> Self {
        let canonical = canonical_workspace(workspace);
        let path = lock_dir
            .join("leases")
            .join(format!("{}.lock", lease_key(&canonical)));
        let lock = FileLock::new(path, format!("workspace:{}", canonical.display()));
        Self {
            workspace: canonical,
            lock,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Non-blocking; returns false if another holder has the lease.
    pub fn acquire(&mut self) -> Result<bool> {
        let acquired = self.lock.try_acquire()?;
        if acquired {
            tracing::debug!(workspace = %self.workspace.display(), "workspace lease acquired");
        }
        Ok(acquired)
    }

    pub fn release(&mut self) -> Result<()> {
        self.lock.release()
    }

    pub fn force_unlock(&mut self) -> Result<bool> {
        self.lock.force_unlock()
    }

    pub fn holder(&self) -> Result<Option<LockHolder>> {
        self.lock.holder()
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_held()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn same_path_spelled_differently_shares_a_lease() {
        let locks = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        std::fs::create_dir(workspace.path().join("sub")).unwrap();
        let direct = workspace.path().to_path_buf();
        let indirect = workspace.path().join("sub/..");

        assert_eq!(lease_key(&direct), lease_key(&indirect));

        let mut first = WorkspaceLease::new(locks.path(), &direct);
        let mut second = WorkspaceLease::new(locks.path(), &indirect);
        assert!(first.acquire().unwrap());
        assert!(!second.acquire().unwrap());

        first.release().unwrap();
        first.release().unwrap();
        assert!(second.acquire().unwrap());
    }

    #[test]
    fn different_workspaces_do_not_conflict() {
        let locks = TempDir::new().unwrap();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let mut lease_a = WorkspaceLease::new(locks.path(), a.path());
        let mut lease_b = WorkspaceLease::new(locks.path(), b.path());
        assert!(lease_a.acquire().unwrap());
        assert!(lease_b.acquire().unwrap());
    }

    #[test]
    fn key_is_hex_sha256() {
        let key = lease_key(Path::new("/does/not/exist"));
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn holder_and_force_unlock() {
        let locks = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let mut lease = WorkspaceLease::new(locks.path(), workspace.path());
        lease.acquire().unwrap();

        let holder = lease.holder().unwrap().unwrap();
        assert!(holder.resource.starts_with("workspace:"));

        let mut other = WorkspaceLease::new(locks.path(), workspace.path());
        assert!(other.force_unlock().unwrap());
        assert!(other.acquire().unwrap());
    }
}
