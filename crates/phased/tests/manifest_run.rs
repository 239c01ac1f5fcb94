//! Integration tests for manifest execution.
//!
//! Drives runs end to end through `Executor` with scripted agents against a
//! temporary git repository: retries with diagnostics, resume, locking and
//! parallel worktree isolation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use phase_core::{
    ApprovalStatus, AttemptStatus, Config, Id, IntentionAnchor, PhaseState, RunManifest, RunState,
};
use phased::agents::{
    AuditRequest, AuditVerdict, Auditor, BuildOutcome, BuildRequest, Builder, DiagnosticsBackend,
    LogApprovalChannel, Result as AgentResult,
};
use phased::doctor::{DoctorAction, DoctorRequest, DoctorResponse};
use phased::engine::Agents;
use phased::executor_lock::ExecutorLockManager;
use phased::git::run_key;
use phased::parallel::OrchestratorError;
use phased::storage::StorageError;
use phased::{propose_scope_reduction, Executor, ExecutorError};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn setup_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "Initial commit"]);
    dir
}

/// Builder that replays a script of statuses, then completes. Each attempt
/// writes a file in the workspace it was given.
#[derive(Default)]
struct ScriptedBuilder {
    script: Mutex<VecDeque<AttemptStatus>>,
    workspaces: Mutex<Vec<PathBuf>>,
    calls: AtomicU32,
}

impl ScriptedBuilder {
    fn new(script: &[AttemptStatus]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Builder for ScriptedBuilder {
    async fn build(
        &self,
        request: &BuildRequest,
        _cancel: &CancellationToken,
    ) -> AgentResult<BuildOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.workspaces.lock().unwrap().push(request.workspace.clone());
        let status = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(AttemptStatus::Complete);
        std::fs::write(
            request.workspace.join(format!("{}-{}.txt", request.phase_id, request.attempt)),
            status.as_str(),
        )
        .unwrap();
        Ok(if status == AttemptStatus::Complete {
            BuildOutcome::complete("implemented")
        } else {
            BuildOutcome::failed(status, "tests failed")
        })
    }
}

struct ApprovingAuditor;

#[async_trait]
impl Auditor for ApprovingAuditor {
    async fn review(
        &self,
        _request: &AuditRequest,
        _cancel: &CancellationToken,
    ) -> AgentResult<AuditVerdict> {
        Ok(AuditVerdict::Approve)
    }
}

#[derive(Default)]
struct CountingDiagnostics {
    calls: AtomicU32,
}

#[async_trait]
impl DiagnosticsBackend for CountingDiagnostics {
    async fn diagnose(&self, _request: &DoctorRequest) -> AgentResult<DoctorResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DoctorResponse {
            action: DoctorAction::RetryWithFix,
            rationale: "flaky assertion".to_string(),
            hint: Some("check the fixture".to_string()),
            fix: None,
            provider: None,
        })
    }
}

fn agents(builder: Arc<ScriptedBuilder>, diagnostics: Option<Arc<CountingDiagnostics>>) -> Agents {
    Agents {
        builder,
        auditor: Arc::new(ApprovingAuditor),
        diagnostics: diagnostics.map(|d| d as Arc<dyn DiagnosticsBackend>),
        approvals: Arc::new(LogApprovalChannel),
    }
}


const SINGLE_RUN: &str = r"
runs:
  - run_id: feature
    phases:
      - phase_id: models
        description: add the user model
      - phase_id: handlers
        depends_on: [models]
";

const TWO_RUNS: &str = r"
runs:
  - run_id: alpha
    phases:
      - phase_id: build
  - run_id: beta
    phases:
      - phase_id: build
";

#[tokio::test]
async fn single_run_retries_with_diagnostics_and_completes() {
    let repo = setup_repo();
    let builder = ScriptedBuilder::new(&[AttemptStatus::BuilderFailed, AttemptStatus::BuilderFailed]);
    let diagnostics = Arc::new(CountingDiagnostics::default());
    let executor = Executor::new(
        repo.path(),
        Config::default(),
        agents(Arc::clone(&builder), Some(Arc::clone(&diagnostics))),
    )
    .await
    .unwrap();

    let manifest = RunManifest::parse(SINGLE_RUN).unwrap();
    let aggregate = executor
        .execute_manifest(&manifest, None, CancellationToken::new())
        .await
        .unwrap();

    assert!(aggregate.all_successful, "{aggregate:?}");
    assert_eq!(aggregate.results[0].state, Some(RunState::Completed));
    // Three attempts for the first phase, one for the second.
    assert_eq!(builder.calls.load(Ordering::SeqCst), 4);
    assert_eq!(diagnostics.calls.load(Ordering::SeqCst), 2);

    let run_id = Id::from_string("feature");
    let run = executor.storage().get_run(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
    let phases = executor.storage().list_phases(&run_id).await.unwrap();
    assert!(phases.iter().all(|p| p.state == PhaseState::Complete));
    assert_eq!(phases[0].retry_attempt, 2);
    assert!(!executor.storage().list_events(&run_id).await.unwrap().is_empty());

    // Only the successful attempt survives; state directories stay untracked.
    assert!(repo.path().join("models-2.txt").exists());
    assert!(!repo.path().join("models-0.txt").exists());
    assert_eq!(git(repo.path(), &["status", "--porcelain"]), "");

    let locks = ExecutorLockManager::new(&executor.config().lock_dir);
    assert!(locks.holder("feature").unwrap().is_none());
}

#[tokio::test]
async fn completed_run_is_not_rebuilt() {
    let repo = setup_repo();
    let builder = ScriptedBuilder::new(&[]);
    let executor = Executor::new(repo.path(), Config::default(), agents(Arc::clone(&builder), None))
        .await
        .unwrap();
    let manifest = RunManifest::parse(SINGLE_RUN).unwrap();

    let first = executor
        .execute_manifest(&manifest, None, CancellationToken::new())
        .await
        .unwrap();
    assert!(first.all_successful);
    assert_eq!(builder.calls.load(Ordering::SeqCst), 2);

    let second = executor
        .execute_manifest(&manifest, None, CancellationToken::new())
        .await
        .unwrap();
    assert!(second.all_successful);
    assert_eq!(builder.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn locked_run_is_reported_as_failed() {
    let repo = setup_repo();
    let builder = ScriptedBuilder::new(&[]);
    let executor = Executor::new(repo.path(), Config::default(), agents(Arc::clone(&builder), None))
        .await
        .unwrap();

    let other = ExecutorLockManager::new(&executor.config().lock_dir);
    assert!(other.try_acquire("feature").unwrap());

    let manifest = RunManifest::parse(SINGLE_RUN).unwrap();
    let aggregate = executor
        .execute_manifest(&manifest, None, CancellationToken::new())
        .await
        .unwrap();

    assert!(!aggregate.all_successful);
    assert!(aggregate.results[0].error.is_some());
    assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
    other.release("feature").unwrap();
}

#[tokio::test]
async fn parallel_runs_need_an_anchor() {
    let repo = setup_repo();
    let builder = ScriptedBuilder::new(&[]);
    let executor = Executor::new(repo.path(), Config::default(), agents(Arc::clone(&builder), None))
        .await
        .unwrap();
    let manifest = RunManifest::parse(TWO_RUNS).unwrap();

    let err = executor
        .execute_manifest(&manifest, None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Orchestrator(OrchestratorError::Policy(_))
    ));
    assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn anchored_parallel_runs_use_separate_worktrees() {
    let repo = setup_repo();
    let builder = ScriptedBuilder::new(&[]);
    let executor = Executor::new(repo.path(), Config::default(), agents(Arc::clone(&builder), None))
        .await
        .unwrap();
    let manifest = RunManifest::parse(TWO_RUNS).unwrap();
    let anchor = IntentionAnchor {
        anchor_id: "anchor-1".to_string(),
        parallelism_isolation: true,
        ..Default::default()
    };

    let aggregate = executor
        .execute_manifest(&manifest, Some(&anchor), CancellationToken::new())
        .await
        .unwrap();
    assert!(aggregate.all_successful, "{aggregate:?}");
    assert_eq!(aggregate.results.len(), 2);

    let workspaces = builder.workspaces.lock().unwrap().clone();
    assert_eq!(workspaces.len(), 2);
    assert_ne!(workspaces[0], workspaces[1]);
    for workspace in &workspaces {
        assert_ne!(workspace.as_path(), repo.path());
        // Worktrees are removed once their run finishes.
        assert!(!workspace.exists());
    }
    // The main checkout was never touched.
    assert!(!repo.path().join("build-0.txt").exists());

    // Each run's work lives on its own branch.
    let branch = format!("run/{}", run_key("alpha"));
    let log = git(repo.path(), &["log", "--oneline", &branch]);
    assert!(log.lines().count() >= 2, "{log}");
}

const SCOPED_RUN: &str = r"
runs:
  - run_id: scoped
    phases:
      - phase_id: build
        scope:
          paths: [src/, vendor/]
        file_context: [src/lib.rs]
";

#[tokio::test]
async fn approved_scope_reduction_applies_when_the_run_executes() {
    let repo = setup_repo();
    let builder = ScriptedBuilder::new(&[]);
    let executor = Executor::new(repo.path(), Config::default(), agents(Arc::clone(&builder), None))
        .await
        .unwrap();
    let manifest = RunManifest::parse(SCOPED_RUN).unwrap();
    let run_id = executor.register(&manifest.runs[0]).await.unwrap();

    let missing = propose_scope_reduction(
        executor.storage(),
        &run_id,
        &Id::from_string("nope"),
        vec!["vendor/".to_string()],
        String::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        missing,
        ExecutorError::Storage(StorageError::PhaseNotFound { .. })
    ));

    let proposal = propose_scope_reduction(
        executor.storage(),
        &run_id,
        &Id::from_string("build"),
        vec!["vendor/".to_string()],
        "vendored code is frozen".to_string(),
    )
    .await
    .unwrap();
    executor
        .storage()
        .resolve_approval(&proposal.id, ApprovalStatus::Approved)
        .await
        .unwrap();

    let aggregate = executor
        .execute_manifest(&manifest, None, CancellationToken::new())
        .await
        .unwrap();
    assert!(aggregate.all_successful, "{aggregate:?}");

    let phase = executor
        .storage()
        .get_phase(&run_id, &Id::from_string("build"))
        .await
        .unwrap();
    assert_eq!(phase.scope.paths, vec!["src/"]);
}
