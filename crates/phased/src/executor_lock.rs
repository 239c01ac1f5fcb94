//! Per-run executor lock: at most one executor drives a given run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::git::run_key;
use crate::lock::{FileLock, LockError, LockHolder, Result};

#[derive(Debug)]
pub struct ExecutorLockManager {
    dir: PathBuf,
    held: Mutex<HashMap<String, FileLock>>,
}

/// Holds the executor lock for a run until dropped.
#[derive(Debug)]
pub struct ExecutorLockGuard {
    run_id: String,
    lock: FileLock,
}

impl ExecutorLockGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Release explicitly, surfacing any error instead of logging it on drop.
    pub fn release(mut self) -> Result<()> {
        self.lock.release()
    }
}

impl ExecutorLockManager {
    pub fn new(lock_dir: &Path) -> Self {
        Self {
            dir: lock_dir.join("executors"),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, run_id: &str) -> FileLock {
        let name = format!("{}.lock", run_key(run_id));
        FileLock::new(self.dir.join(name), format!("run:{run_id}"))
    }

    /// Non-blocking; returns false if another executor holds the run.
    pub fn try_acquire(&self, run_id: &str) -> Result<bool> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains_key(run_id) {
            return Ok(true);
        }
        let mut lock = self.lock_for(run_id);
        if !lock.try_acquire()? {
            return Ok(false);
        }
        held.insert(run_id.to_string(), lock);
        tracing::debug!(run_id, "executor lock acquired");
        Ok(true)
    }

    /// Release a lock taken with `try_acquire`. Idempotent.
    pub fn release(&self, run_id: &str) -> Result<()> {
        let lock = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        match lock {
            Some(mut lock) => lock.release(),
            None => Ok(()),
        }
    }

    /// Remove a run's lock file regardless of holder.
    pub fn force_unlock(&self, run_id: &str) -> Result<bool> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        let removed = self.lock_for(run_id).force_unlock()?;
        if removed {
            tracing::warn!(run_id, "executor lock force-unlocked");
        }
        Ok(removed)
    }

    pub fn holder(&self, run_id: &str) -> Result<Option<LockHolder>> {
        self.lock_for(run_id).holder()
    }

    /// Acquire a lock released when the guard drops.
    pub fn acquire_scoped(&self, run_id: &str) -> Result<ExecutorLockGuard> {
        let mut lock = self.lock_for(run_id);
        if !lock.try_acquire()? {
            let err = lock.already_held();
            if let LockError::AlreadyHeld { holder, .. } = &err {
                tracing::info!(run_id, holder = holder.as_deref().unwrap_or("unknown"), "run is locked by another executor");
            }
            return Err(err);
        }
        Ok(ExecutorLockGuard {
            run_id: run_id.to_string(),
            lock,
        })
    }
}
