//! phased - phase execution engine for autonomous multi-phase build runs.
//!
//! Library components: git isolation (worktrees, leases, executor locks,
//! savepoints), agent seams, diagnostics and fixes, persistence, the phase
//! engine and the parallel run orchestrator.

pub mod agents;
pub mod doctor;
pub mod engine;
pub mod executor_lock;
pub mod fix;
pub mod git;
pub mod lease;
pub mod lock;
pub mod parallel;
pub mod rollback;
pub mod runner;
pub mod storage;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use phase_core::manifest::{ManifestError, RunSpec};
use phase_core::{Config, Id, IntentionAnchor, RunManifest, RunState, ScopeReductionProposal};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use agents::{AgentError, CommandAuditor, CommandBuilder, CommandDiagnostics, LogApprovalChannel};
use engine::{Agents, EngineError, PhaseExecutionEngine};
use parallel::{AggregateResult, OrchestratorError, ParallelRunOrchestrator};
use storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{0} is not configured")]
    MissingCommand(&'static str),
    #[error("agent setup failed: {0}")]
    Agent(#[from] AgentError),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("failed to prepare state directory: {0}")]
    Git(#[from] git::GitError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Create the executor state directories and hide them from git, so that
/// stash, clean and phase commits never touch them.
pub fn prepare_state_dirs(config: &Config) -> Result<()> {
    let mut dirs: Vec<&Path> = vec![config.lock_dir.as_path(), config.worktree_root.as_path()];
    if let Some(parent) = config.db_path.parent() {
        dirs.push(parent);
    }
    for dir in dirs {
        git::ignore_directory(dir)?;
    }
    Ok(())
}

/// Open the state database named by `config` and apply the schema.
pub async fn open_storage(config: &Config) -> Result<Storage> {
    prepare_state_dirs(config)?;
    let storage = Storage::new(&config.db_path).await?;
    storage.migrate_embedded().await?;
    Ok(storage)
}

/// Record a proposal to drop `remove_paths` from a phase's scope. It takes
/// effect the next time the phase runs, once approved.
pub async fn propose_scope_reduction(
    storage: &Storage,
    run_id: &Id,
    phase_id: &Id,
    remove_paths: Vec<String>,
    rationale: String,
) -> Result<ScopeReductionProposal> {
    storage.get_phase(run_id, phase_id).await?;
    let proposal =
        ScopeReductionProposal::new(run_id.clone(), phase_id.clone(), remove_paths, rationale);
    storage.insert_scope_proposal(&proposal).await?;
    tracing::info!(
        run_id = %run_id,
        phase_id = %phase_id,
        proposal_id = %proposal.id,
        paths = proposal.remove_paths.len(),
        "scope reduction proposed, awaiting approval"
    );
    Ok(proposal)
}

/// Agents backed by the configured commands. The builder and auditor are
/// required; diagnostics are optional.
pub fn command_agents(config: &Config) -> Result<Agents> {
    let builder_cmd = config
        .builder_cmd
        .as_deref()
        .ok_or(ExecutorError::MissingCommand("builder_cmd"))?;
    let auditor_cmd = config
        .auditor_cmd
        .as_deref()
        .ok_or(ExecutorError::MissingCommand("auditor_cmd"))?;
    let agent_timeout = Duration::from_secs(config.builder_timeout_sec);

    let diagnostics = match config.doctor_cmd.as_deref() {
        Some(command) => Some(Arc::new(CommandDiagnostics::new(
            command,
            Duration::from_secs(config.doctor_timeout_sec),
        )?) as Arc<dyn agents::DiagnosticsBackend>),
        None => None,
    };

    Ok(Agents {
        builder: Arc::new(CommandBuilder::new(builder_cmd, agent_timeout)?),
        auditor: Arc::new(CommandAuditor::new(auditor_cmd, agent_timeout)?),
        diagnostics,
        approvals: Arc::new(LogApprovalChannel),
    })
}

/// Executes the runs of a manifest against one repository.
#[derive(Debug, Clone)]
pub struct Executor {
    repo: PathBuf,
    config: Config,
    storage: Storage,
    agents: Agents,
}

impl Executor {
    /// `config` paths are resolved against `repo` and state directories prepared.
    pub async fn new(repo: &Path, mut config: Config, agents: Agents) -> Result<Self> {
        config.resolve_paths(repo);
        let storage = open_storage(&config).await?;
        Ok(Self {
            repo: repo.to_path_buf(),
            config,
            storage,
            agents,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Record a run and its phases unless the run is already known, in which
    /// case it resumes from the stored state.
    pub async fn register(&self, spec: &RunSpec) -> Result<Id> {
        let run_id = Id::from_string(spec.run_id.clone());
        match self.storage.get_run(&run_id).await {
            Ok(run) => {
                tracing::info!(run_id = %run.id, state = run.state.as_str(), "resuming known run");
            }
            Err(StorageError::RunNotFound(_)) => {
                let (run, phases) = spec.to_records(self.config.max_attempts);
                self.storage.insert_run(&run).await?;
                self.storage.insert_phases(&phases).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(run_id)
    }

    /// Execute every run in `manifest`.
    ///
    /// A single run executes in the repository itself; several runs need an
    /// anchor authorizing parallelism and each gets its own worktree.
    pub async fn execute_manifest(
        &self,
        manifest: &RunManifest,
        anchor: Option<&IntentionAnchor>,
        cancel: CancellationToken,
    ) -> Result<AggregateResult> {
        manifest.validate()?;
        let mut run_ids = Vec::with_capacity(manifest.runs.len());
        for spec in &manifest.runs {
            run_ids.push(self.register(spec).await?.0);
        }

        let orchestrator = ParallelRunOrchestrator::new(&self.repo, &self.config);
        let storage = self.storage.clone();
        let agents = self.agents.clone();
        let config = self.config.clone();
        let executor = move |run_id: String, workspace: PathBuf| {
            let storage = storage.clone();
            let agents = agents.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            async move { execute_stored_run(&storage, agents, &config, &run_id, &workspace, cancel).await }
        };

        if let [run_id] = run_ids.as_slice() {
            let result = orchestrator.execute_single(run_id, executor).await;
            let all_successful = result.is_success();
            return Ok(AggregateResult {
                results: vec![result],
                all_successful,
            });
        }
        Ok(orchestrator
            .execute_parallel(&run_ids, executor, anchor)
            .await?)
    }
}

/// Load a run from storage and drive it to completion in `workspace`.
pub async fn execute_stored_run(
    storage: &Storage,
    agents: Agents,
    config: &Config,
    run_id: &str,
    workspace: &Path,
    cancel: CancellationToken,
) -> std::result::Result<RunState, EngineError> {
    let id = Id::from_string(run_id);
    let run = storage.get_run(&id).await?;
    let mut phases = storage.list_phases(&id).await?;
    let mut engine =
        PhaseExecutionEngine::new(run, workspace, agents, storage.clone(), config, cancel);
    engine.execute_run(&mut phases).await
}
