//! Parallel run orchestration.
//!
//! Runs execute concurrently only behind the parallelism gate. Each run gets
//! its executor lock, its own worktree and a lease on that worktree for the
//! duration of the executor; all three are released on every exit path.

use phase_core::config::Config;
use phase_core::{IntentionAnchor, ParallelismPolicyGate, PolicyViolation, RunState};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use crate::executor_lock::ExecutorLockManager;
use crate::lease::WorkspaceLease;
use crate::lock::LockError;
use crate::worktree::{WorkspaceManager, WorktreeError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("workspace {0} is leased by another executor")]
    LeaseHeld(PathBuf),
    #[error("executor failed: {0}")]
    Executor(String),
    #[error("executor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub run_id: String,
    pub workspace: Option<PathBuf>,
    pub state: Option<RunState>,
    pub error: Option<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.state == Some(RunState::Completed)
    }

    fn failed(run_id: &str, workspace: Option<PathBuf>, error: &OrchestratorError) -> Self {
        Self {
            run_id: run_id.to_string(),
            workspace,
            state: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateResult {
    /// One entry per requested run, in request order.
    pub results: Vec<RunResult>,
    pub all_successful: bool,
}

#[derive(Debug)]
struct Shared {
    workspaces: WorkspaceManager,
    locks: ExecutorLockManager,
    lock_dir: PathBuf,
    worktree_cleanup: bool,
    /// Serializes worktree administration on the shared repository.
    git_admin: Mutex<()>,
}

#[derive(Debug, Clone)]
pub struct ParallelRunOrchestrator {
    shared: Arc<Shared>,
    max_workers: usize,
    gate: ParallelismPolicyGate,
}

impl ParallelRunOrchestrator {
    /// `config` paths must already be resolved against the repository.
    pub fn new(repo: &Path, config: &Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                workspaces: WorkspaceManager::new(repo, config),
                locks: ExecutorLockManager::new(&config.lock_dir),
                lock_dir: config.lock_dir.clone(),
                worktree_cleanup: config.worktree_cleanup,
                git_admin: Mutex::new(()),
            }),
            max_workers: config.parallel_max_workers.max(1),
            gate: ParallelismPolicyGate,
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.shared.workspaces
    }

    pub fn locks(&self) -> &ExecutorLockManager {
        &self.shared.locks
    }

    /// Execute `run_ids` concurrently, each in its own worktree.
    ///
    /// The parallelism gate is checked before any workspace is touched. A
    /// failing run does not stop the others.
    pub async fn execute_parallel<F, Fut, E>(
        &self,
        run_ids: &[String],
        executor: F,
        anchor: Option<&IntentionAnchor>,
    ) -> Result<AggregateResult>
    where
        F: Fn(String, PathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<RunState, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.gate.check(run_ids.len(), anchor)?;
        tracing::info!(runs = run_ids.len(), max_workers = self.max_workers, "starting parallel runs");

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let executor = Arc::new(executor);
        let mut handles = Vec::with_capacity(run_ids.len());

        for run_id in run_ids {
            let shared = Arc::clone(&self.shared);
            let semaphore = Arc::clone(&semaphore);
            let executor = Arc::clone(&executor);
            let id = run_id.clone();
            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return RunResult::failed(
                        &id,
                        None,
                        &OrchestratorError::Executor("worker pool closed".to_string()),
                    );
                };
                run_isolated(&shared, &id, executor.as_ref()).await
            });
            handles.push((run_id.clone(), handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (run_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(run_id = %run_id, error = %err, "run task panicked");
                    RunResult::failed(&run_id, None, &OrchestratorError::Join(err))
                }
            };
            results.push(result);
        }

        let all_successful = results.iter().all(RunResult::is_success);
        tracing::info!(runs = results.len(), all_successful, "parallel runs finished");
        Ok(AggregateResult {
            results,
            all_successful,
        })
    }

    /// Execute one run in the source repository. Needs no anchor and only
    /// takes the executor lock.
    pub async fn execute_single<F, Fut, E>(&self, run_id: &str, executor: F) -> RunResult
    where
        F: FnOnce(String, PathBuf) -> Fut,
        Fut: Future<Output = std::result::Result<RunState, E>>,
        E: std::fmt::Display,
    {
        let guard = match self.shared.locks.acquire_scoped(run_id) {
            Ok(guard) => guard,
            Err(err) => return RunResult::failed(run_id, None, &OrchestratorError::from(err)),
        };

        let repo = self.shared.workspaces.repo().to_path_buf();
        let outcome = executor(run_id.to_string(), repo.clone()).await;
        let result = finish(run_id, repo, outcome);

        if let Err(err) = guard.release() {
            tracing::warn!(run_id, error = %err, "failed to release executor lock");
        }
        result
    }
}

fn finish<E: std::fmt::Display>(
    run_id: &str,
    workspace: PathBuf,
    outcome: std::result::Result<RunState, E>,
) -> RunResult {
    match outcome {
        Ok(state) => RunResult {
            run_id: run_id.to_string(),
            workspace: Some(workspace),
            state: Some(state),
            error: None,
        },
        Err(err) => RunResult::failed(
            run_id,
            Some(workspace),
            &OrchestratorError::Executor(err.to_string()),
        ),
    }
}

/// Executor lock, worktree, lease, executor; then release in reverse.
async fn run_isolated<F, Fut, E>(shared: &Shared, run_id: &str, executor: &F) -> RunResult
where
    F: Fn(String, PathBuf) -> Fut,
    Fut: Future<Output = std::result::Result<RunState, E>>,
    E: std::fmt::Display,
{
    let guard = match shared.locks.acquire_scoped(run_id) {
        Ok(guard) => guard,
        Err(err) => return RunResult::failed(run_id, None, &OrchestratorError::from(err)),
    };

    let (created, reused) = {
        let _admin = shared.git_admin.lock().await;
        let reused = shared.workspaces.worktree_path(run_id).exists();
        (shared.workspaces.create_worktree(run_id), reused)
    };
    let result = match created {
        Ok(workspace) => {
            let (result, leased) = run_leased(shared, run_id, workspace, executor).await;
            // A reused worktree we never leased belongs to whoever holds the lease.
            if shared.worktree_cleanup && (leased || !reused) {
                let _admin = shared.git_admin.lock().await;
                if let Err(err) = shared.workspaces.remove_worktree(run_id) {
                    tracing::warn!(run_id, error = %err, "failed to remove worktree");
                }
            }
            result
        }
        Err(err) => RunResult::failed(run_id, None, &OrchestratorError::from(err)),
    };

    if let Err(err) = guard.release() {
        tracing::warn!(run_id, error = %err, "failed to release executor lock");
    }
    result
}

async fn run_leased<F, Fut, E>(
    shared: &Shared,
    run_id: &str,
    workspace: PathBuf,
    executor: &F,
) -> (RunResult, bool)
where
    F: Fn(String, PathBuf) -> Fut,
    Fut: Future<Output = std::result::Result<RunState, E>>,
    E: std::fmt::Display,
{
    let mut lease = WorkspaceLease::new(&shared.lock_dir, &workspace);
    match lease.acquire() {
        Ok(true) => {}
        Ok(false) => {
            let error = OrchestratorError::LeaseHeld(workspace.clone());
            return (RunResult::failed(run_id, Some(workspace), &error), false);
        }
        Err(err) => {
            let error = OrchestratorError::from(err);
            return (RunResult::failed(run_id, Some(workspace), &error), false);
        }
    }

    tracing::info!(run_id, workspace = %workspace.display(), "run executing in worktree");
    let outcome = executor(run_id.to_string(), workspace.clone()).await;
    if let Err(err) = lease.release() {
        tracing::warn!(run_id, error = %err, "failed to release workspace lease");
    }
    (finish(run_id, workspace, outcome), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::setup_test_repo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(repo: &Path, workers: usize) -> Config {
        let mut config = Config {
            parallel_max_workers: workers,
            ..Config::default()
        };
        config.resolve_paths(repo);
        config
    }

    fn anchor(isolation: bool) -> IntentionAnchor {
        IntentionAnchor {
            anchor_id: "anchor-1".to_string(),
            parallelism_isolation: isolation,
            approved_by: Some("ops".to_string()),
            issued_at: None,
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn gate_is_checked_before_any_workspace_work() {
        let repo = setup_test_repo();
        let orchestrator = ParallelRunOrchestrator::new(repo.path(), &config(repo.path(), 2));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = orchestrator
            .execute_parallel(
                &ids(&["a", "b"]),
                move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>(RunState::Completed) }
                },
                None,
            )
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::Policy(PolicyViolation::ParallelismNotAuthorized { run_count: 2 }))
        ));

        let denied = orchestrator
            .execute_parallel(
                &ids(&["a", "b"]),
                |_, _| async { Ok::<_, String>(RunState::Completed) },
                Some(&anchor(false)),
            )
            .await;
        assert!(matches!(
            denied,
            Err(OrchestratorError::Policy(PolicyViolation::AnchorDeniesParallelism { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!orchestrator.workspaces().worktree_path("a").exists());
    }

    #[tokio::test]
    async fn bounds_concurrency_and_reports_failures() {
        let repo = setup_test_repo();
        let orchestrator = ParallelRunOrchestrator::new(repo.path(), &config(repo.path(), 2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));

        let aggregate = orchestrator
            .execute_parallel(
                &ids(&["r1", "r2", "r3", "r4"]),
                move |run_id, workspace| {
                    let running = Arc::clone(&r);
                    let peak = Arc::clone(&p);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(workspace.join("README.md").exists());
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        if run_id == "r3" {
                            Err("phase p1 failed".to_string())
                        } else {
                            Ok(RunState::Completed)
                        }
                    }
                },
                Some(&anchor(true)),
            )
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(!aggregate.all_successful);
        assert_eq!(aggregate.results.len(), 4);
        assert_eq!(aggregate.results[2].run_id, "r3");
        assert!(aggregate.results[2].error.as_deref().unwrap().contains("phase p1 failed"));
        assert!(aggregate.results[0].is_success());

        // Worktrees were cleaned up and all locks released.
        for id in ["r1", "r2", "r3", "r4"] {
            assert!(!orchestrator.workspaces().worktree_path(id).exists());
            assert!(orchestrator.locks().holder(id).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn locked_run_is_not_executed() {
        let repo = setup_test_repo();
        let config = config(repo.path(), 2);
        let orchestrator = ParallelRunOrchestrator::new(repo.path(), &config);
        let other = ExecutorLockManager::new(&config.lock_dir);
        let _held = other.acquire_scoped("busy").unwrap();

        let aggregate = orchestrator
            .execute_parallel(
                &ids(&["busy", "free"]),
                |_, _| async { Ok::<_, String>(RunState::Completed) },
                Some(&anchor(true)),
            )
            .await
            .unwrap();
        assert!(aggregate.results[0].error.as_deref().unwrap().contains("already locked"));
        assert!(aggregate.results[1].is_success());
    }

    #[tokio::test]
    async fn single_run_needs_no_anchor_and_uses_the_repo() {
        let repo = setup_test_repo();
        let orchestrator = ParallelRunOrchestrator::new(repo.path(), &config(repo.path(), 1));
        let expected = repo.path().to_path_buf();

        let result = orchestrator
            .execute_single("solo", move |_, workspace| async move {
                assert_eq!(workspace, expected);
                Ok::<_, String>(RunState::Completed)
            })
            .await;
        assert!(result.is_success());
        assert!(orchestrator.locks().holder("solo").unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_worktree_is_removed_when_its_lease_is_taken() {
        let repo = setup_test_repo();
        let root = repo.path().canonicalize().unwrap();
        let config = config(&root, 2);
        let orchestrator = ParallelRunOrchestrator::new(&root, &config);
        let path = orchestrator.workspaces().worktree_path("stale");
        let mut stale = WorkspaceLease::new(&config.lock_dir, &path);
        assert!(stale.acquire().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let aggregate = orchestrator
            .execute_parallel(
                &ids(&["stale", "free"]),
                move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>(RunState::Completed) }
                },
                Some(&anchor(true)),
            )
            .await
            .unwrap();

        assert!(aggregate.results[0].error.as_deref().unwrap().contains("leased by another executor"));
        assert!(aggregate.results[1].is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
        assert!(orchestrator.locks().holder("stale").unwrap().is_none());
        stale.release().unwrap();
    }

    #[tokio::test]
    async fn worktree_leased_by_another_executor_is_left_alone() {
        let repo = setup_test_repo();
        let config = config(repo.path(), 1);
        let orchestrator = ParallelRunOrchestrator::new(repo.path(), &config);
        let path = orchestrator.workspaces().create_worktree("busy").unwrap();
        let mut other = WorkspaceLease::new(&config.lock_dir, &path);
        assert!(other.acquire().unwrap());

        let aggregate = orchestrator
            .execute_parallel(
                &ids(&["busy"]),
                |_, _| async { Ok::<_, String>(RunState::Completed) },
                None,
            )
            .await
            .unwrap();

        assert!(!aggregate.all_successful);
        assert!(path.join("README.md").exists());
        other.release().unwrap();
    }

    #[tokio::test]
    async fn worktrees_are_kept_when_cleanup_is_disabled() {
        let repo = setup_test_repo();
        let mut config = config(repo.path(), 1);
        config.worktree_cleanup = false;
        let orchestrator = ParallelRunOrchestrator::new(repo.path(), &config);

        orchestrator
            .execute_parallel(
                &ids(&["keep"]),
                |_, _| async { Ok::<_, String>(RunState::Failed) },
                None,
            )
            .await
            .unwrap();
        assert!(orchestrator.workspaces().worktree_path("keep").exists());
    }
}
