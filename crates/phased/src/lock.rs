//! Lock files with holder metadata.
//!
//! Acquisition is a single atomic `create_new` of the lock file; the JSON
//! body records who holds it. Shared by the workspace lease and the
//! executor lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode lock holder: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{resource} is already locked{}", .holder.as_ref().map(|h| format!(" by {h}")).unwrap_or_default())]
    AlreadyHeld {
        resource: String,
        holder: Option<String>,
    },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub resource: String,
    /// Identifies the acquiring instance so release never deletes a foreign lock.
    #[serde(default)]
    pub token: String,
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} on {} since {}",
            self.pid,
            self.hostname,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Best-effort host name for lock metadata.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// A non-blocking lock file. Released on drop if still held.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    resource: String,
    token: Option<String>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, resource: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            resource: resource.into(),
            token: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    fn io_error(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Try to take the lock without waiting.
    ///
    /// Returns `Ok(false)` when another holder owns the lock. Acquiring a lock
    /// this instance already holds succeeds.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(self.io_error(e)),
        };

        let token = Uuid::now_v7().to_string();
        let holder = LockHolder {
            pid: std::process::id(),
            hostname: hostname(),
            acquired_at: Utc::now(),
            resource: self.resource.clone(),
            token: token.clone(),
        };
        let body = serde_json::to_vec(&holder)?;
        if let Err(e) = file.write_all(&body).and_then(|()| file.sync_all()) {
            drop(file);
            let _ = std::fs::remove_file(&self.path);
            return Err(self.io_error(e));
        }

        self.token = Some(token);
        Ok(true)
    }

    /// Release the lock. Idempotent; never deletes a lock held by someone else.
    pub fn release(&mut self) -> Result<()> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };

        match self.holder()? {
            Some(holder) if holder.token == token => match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(self.io_error(e)),
            },
            Some(holder) => {
                tracing::warn!(
                    resource = %self.resource,
                    holder = %holder,
                    "lock was taken over by another holder, leaving it in place"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Remove the lock file regardless of holder. Returns whether a lock existed.
    pub fn force_unlock(&mut self) -> Result<bool> {
        self.token = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Read the current holder, if the lock file exists and is readable.
    pub fn holder(&self) -> Result<Option<LockHolder>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        // A body still being written or hand-edited does not identify anyone.
        Ok(serde_json::from_str(&content).ok())
    }

    /// Build the `AlreadyHeld` error for this lock, naming the holder if known.
    pub fn already_held(&self) -> LockError {
        LockError::AlreadyHeld {
            resource: self.resource.clone(),
            holder: self.holder().ok().flatten().map(|h| h.to_string()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(resource = %self.resource, error = %e, "failed to release lock on drop");
        }
    }
}
