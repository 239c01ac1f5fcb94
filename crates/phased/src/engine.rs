//! Phase execution engine.
//!
//! Drives one phase through build, audit, retry, rollback and diagnostics
//! until it reaches a terminal status, and a run through its phases in
//! declared order. Attempts are strictly sequential.

use phase_core::config::Config;
use phase_core::events::{
    ApprovalRequestedPayload, AttemptFinishedPayload, DoctorInvokedPayload, EventPayload,
    FixExecutedPayload, PhaseFinishedPayload, PhaseStartedPayload, RollbackPayload,
    RunFinishedPayload, RunStartedPayload, ScopeReducedPayload,
};
use phase_core::policy::output_token_budget;
use phase_core::{
    next_attempt_state, scope, ApprovalRequest, AttemptContext, AttemptStatus, Phase, PhaseState,
    Run, RunState, TerminalStatus,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agents::{
    AgentError, ApprovalChannel, AuditRequest, AuditVerdict, Auditor, BuildRequest, Builder,
    DiagnosticsBackend,
};
use crate::doctor::{DoctorDirective, DoctorIntegration, DoctorLimits};
use crate::fix::ExecuteFixHandler;
use crate::rollback::{RollbackError, RollbackManager, RollbackOutcome, Savepoint};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("rollback error: {0}")]
    Rollback(#[from] RollbackError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The agents a run talks to.
#[derive(Clone)]
pub struct Agents {
    pub builder: Arc<dyn Builder>,
    pub auditor: Arc<dyn Auditor>,
    pub diagnostics: Option<Arc<dyn DiagnosticsBackend>>,
    pub approvals: Arc<dyn ApprovalChannel>,
}

impl std::fmt::Debug for Agents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agents")
            .field("has_diagnostics", &self.diagnostics.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of a single build-and-review attempt.
enum AttemptResult {
    Finished {
        status: AttemptStatus,
        summary: String,
        error: Option<String>,
    },
    Blocked(String),
    Canceled,
}

pub struct PhaseExecutionEngine {
    run: Run,
    workspace: PathBuf,
    agents: Agents,
    storage: Storage,
    doctor: DoctorIntegration,
    fixes: ExecuteFixHandler,
    rollback: RollbackManager,
    builder_timeout: Duration,
    base_output_tokens: u64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PhaseExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseExecutionEngine")
            .field("run_id", &self.run.id)
            .field("workspace", &self.workspace)
            .field("doctor", &self.doctor)
            .finish_non_exhaustive()
    }
}

impl PhaseExecutionEngine {
    pub fn new(
        run: Run,
        workspace: &Path,
        agents: Agents,
        storage: Storage,
        config: &Config,
        cancel: CancellationToken,
    ) -> Self {
        let doctor =
            DoctorIntegration::new(agents.diagnostics.clone(), DoctorLimits::from_config(config));
        let fixes = ExecuteFixHandler::new(
            config.execute_fix_max_per_phase,
            Duration::from_secs(config.fix_command_timeout_sec),
        );
        let rollback =
            RollbackManager::new(workspace, &run.id.0, config.protected_paths.clone());
        Self {
            run,
            workspace: workspace.to_path_buf(),
            agents,
            storage,
            doctor,
            fixes,
            rollback,
            builder_timeout: Duration::from_secs(config.builder_timeout_sec),
            base_output_tokens: config.base_output_tokens,
            cancel,
        }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn doctor(&self) -> &DoctorIntegration {
        &self.doctor
    }

    /// Execute every phase of the run in declared order.
    ///
    /// A phase whose dependencies did not complete is blocked. The run is
    /// COMPLETED only when every phase is COMPLETE.
    pub async fn execute_run(&mut self, phases: &mut [Phase]) -> Result<RunState> {
        self.doctor.reset();
        self.run.state = RunState::Running;
        self.storage.update_run(&self.run).await?;
        self.storage
            .record_event(
                &self.run.id,
                None,
                EventPayload::RunStarted(RunStartedPayload {
                    run_id: self.run.id.clone(),
                    run_type: self.run.run_type.as_str().to_string(),
                    phase_count: phases.len(),
                }),
            )
            .await;
        tracing::info!(run_id = %self.run.id, phases = phases.len(), "run started");

        let mut completed: HashSet<String> = HashSet::new();
        let mut canceled = false;
        for phase in phases.iter_mut() {
            if phase.state == PhaseState::Complete {
                completed.insert(phase.id.0.clone());
                continue;
            }
            if phase.state == PhaseState::Blocked && !self.approval_granted(phase).await? {
                tracing::info!(
                    run_id = %self.run.id,
                    phase_id = %phase.id,
                    "phase still awaiting human approval"
                );
                continue;
            }

            let unmet: Vec<&str> = phase
                .depends_on
                .iter()
                .filter(|dep| !completed.contains(*dep))
                .map(String::as_str)
                .collect();
            if !unmet.is_empty() {
                let reason = format!("unmet dependencies: {}", unmet.join(", "));
                self.finish(phase, TerminalStatus::Blocked, Some(reason)).await?;
                continue;
            }

            match self.execute_phase(phase).await? {
                TerminalStatus::Complete => {
                    completed.insert(phase.id.0.clone());
                }
                TerminalStatus::Canceled => {
                    canceled = true;
                    break;
                }
                TerminalStatus::Failed | TerminalStatus::Blocked | TerminalStatus::Skipped => {}
            }
        }

        let phases_complete = phases
            .iter()
            .filter(|phase| phase.state == PhaseState::Complete)
            .count();
        self.run.state = if canceled {
            RunState::Canceled
        } else if phases_complete == phases.len() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        if self.doctor.run_high_risk() {
            self.run.high_risk = true;
        }
        self.storage.update_run(&self.run).await?;

        if let Err(err) = self.rollback.cleanup() {
            tracing::warn!(run_id = %self.run.id, error = %err, "failed to remove savepoint tags");
        }

        self.storage
            .record_event(
                &self.run.id,
                None,
                EventPayload::RunFinished(RunFinishedPayload {
                    run_id: self.run.id.clone(),
                    state: self.run.state,
                    phases_complete,
                    phases_total: phases.len(),
                }),
            )
            .await;
        tracing::info!(
            run_id = %self.run.id,
            state = self.run.state.as_str(),
            phases_complete,
            phases_total = phases.len(),
            "run finished"
        );
        Ok(self.run.state)
    }

    /// Whether a BLOCKED phase may be resumed: its latest approval request,
    /// if any, must be approved and unexpired. Phases blocked for other
    /// reasons (dependencies, refused rollback) are retried.
    async fn approval_granted(&self, phase: &Phase) -> Result<bool> {
        let latest = self
            .storage
            .list_approvals(&self.run.id)
            .await?
            .into_iter()
            .rev()
            .find(|request| request.phase_id == phase.id);
        Ok(match latest {
            Some(request) => request.is_approved(chrono::Utc::now()),
            None => true,
        })
    }

    /// Narrow the phase scope with every applicable scope-reduction
    /// proposal. Proposals still awaiting approval are left alone.
    async fn apply_scope_reductions(&self, phase: &mut Phase) -> Result<()> {
        let now = chrono::Utc::now();
        let proposals = self.storage.list_scope_proposals(&self.run.id).await?;
        for proposal in proposals.iter().filter(|p| p.phase_id == phase.id) {
            let before = phase.scope.paths.clone();
            if let Err(violation) = proposal.apply(&mut phase.scope, now) {
                tracing::info!(
                    run_id = %self.run.id,
                    phase_id = %phase.id,
                    proposal_id = %proposal.id,
                    reason = %violation,
                    "scope reduction not applied"
                );
                continue;
            }
            let removed: Vec<String> = before
                .into_iter()
                .filter(|path| !phase.scope.paths.contains(path))
                .collect();
            if removed.is_empty() {
                continue;
            }
            tracing::info!(
                run_id = %self.run.id,
                phase_id = %phase.id,
                proposal_id = %proposal.id,
                removed = removed.len(),
                "scope reduced"
            );
            phase.updated_at = now;
            self.storage.update_phase(phase).await?;
            self.storage
                .record_event(
                    &self.run.id,
                    Some(&phase.id),
                    EventPayload::ScopeReduced(ScopeReducedPayload {
                        proposal_id: proposal.id.clone(),
                        phase_id: phase.id.clone(),
                        removed_paths: removed,
                    }),
                )
                .await;
        }
        Ok(())
    }

    /// Drive `phase` to a terminal status.
    pub async fn execute_phase(&mut self, phase: &mut Phase) -> Result<TerminalStatus> {
        self.apply_scope_reductions(phase).await?;
        phase.state = PhaseState::InProgress;
        phase.updated_at = chrono::Utc::now();
        self.storage.update_phase(phase).await?;
        self.storage
            .record_event(
                &self.run.id,
                Some(&phase.id),
                EventPayload::PhaseStarted(PhaseStartedPayload {
                    phase_id: phase.id.clone(),
                    retry_attempt: phase.retry_attempt,
                    max_attempts: phase.max_attempts,
                }),
            )
            .await;

        loop {
            let context = AttemptContext::new(
                phase.retry_attempt,
                i32::try_from(phase.max_attempts).unwrap_or(i32::MAX),
                phase.escalation_level,
            );
            if context.is_exhausted() {
                let reason = match &phase.last_failure_reason {
                    Some(last) => format!("max attempts exhausted: {last}"),
                    None => "max attempts exhausted".to_string(),
                };
                return self.finish(phase, TerminalStatus::Failed, Some(reason)).await;
            }
            if self.cancel.is_cancelled() {
                return self
                    .finish(phase, TerminalStatus::Canceled, Some("run canceled".to_string()))
                    .await;
            }
            if let Err(err) = scope::validate(phase, &phase.file_context, &phase.scope) {
                tracing::error!(run_id = %self.run.id, phase_id = %phase.id, error = %err, "scope violation");
                return self
                    .finish(phase, TerminalStatus::Failed, Some(err.to_string()))
                    .await;
            }

            let savepoint = self.rollback.create_savepoint(&phase.id.0)?;
            let attempt = phase.retry_attempt;
            let started = Instant::now();
            let result = self.attempt(phase).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (status, error) = match result {
                AttemptResult::Canceled => {
                    self.roll_back(phase, &savepoint, "attempt canceled").await?;
                    return self
                        .finish(phase, TerminalStatus::Canceled, Some("run canceled".to_string()))
                        .await;
                }
                AttemptResult::Blocked(reason) => {
                    return self.escalate_to_human(phase, reason).await;
                }
                AttemptResult::Finished {
                    status,
                    summary,
                    error,
                } => {
                    tracing::info!(
                        run_id = %self.run.id,
                        phase_id = %phase.id,
                        attempt,
                        status = status.as_str(),
                        duration_ms,
                        summary_len = summary.len(),
                        "attempt finished"
                    );
                    (status, error)
                }
            };
            self.storage
                .record_event(
                    &self.run.id,
                    Some(&phase.id),
                    EventPayload::AttemptFinished(AttemptFinishedPayload {
                        phase_id: phase.id.clone(),
                        attempt,
                        status,
                        duration_ms,
                    }),
                )
                .await;

            let decision = next_attempt_state(context, status);
            if let Some(next) = decision.next_retry_attempt {
                phase.retry_attempt = next;
            }
            if status == AttemptStatus::TokenEscalation {
                phase.token_escalations += 1;
            }
            if status.is_failure() {
                phase.last_failure_reason =
                    Some(error.clone().unwrap_or_else(|| status.as_str().to_string()));
            }
            phase.updated_at = chrono::Utc::now();
            self.storage.update_phase(phase).await?;

            if status == AttemptStatus::Complete {
                self.rollback.commit_phase(&phase.id.0)?;
                phase.builder_hint = None;
                return self.finish(phase, TerminalStatus::Complete, None).await;
            }

            if let RollbackOutcome::Refused {
                message,
                protected_paths,
            } = self.roll_back(phase, &savepoint, status.as_str()).await?
            {
                let reason = format!("{message}: {}", protected_paths.join(", "));
                return self
                    .finish(phase, TerminalStatus::Blocked, Some(reason))
                    .await;
            }

            if decision.terminal {
                let reason = format!(
                    "max attempts exhausted: {}",
                    phase.last_failure_reason.as_deref().unwrap_or(status.as_str())
                );
                return self.finish(phase, TerminalStatus::Failed, Some(reason)).await;
            }

            if decision.should_run_diagnostics
                && self
                    .doctor
                    .should_invoke_doctor(&phase.id.0, phase.retry_attempt, status)
            {
                if let Some(terminal) = self.diagnose(phase, status, error.as_deref()).await? {
                    return Ok(terminal);
                }
            }
        }
    }

    /// One build, and a review when the builder reports completion.
    async fn attempt(&self, phase: &Phase) -> AttemptResult {
        let request = BuildRequest {
            run_id: self.run.id.clone(),
            phase_id: phase.id.clone(),
            description: phase.description.clone(),
            attempt: phase.retry_attempt,
            max_attempts: phase.max_attempts,
            escalation_level: phase.escalation_level,
            max_output_tokens: output_token_budget(
                self.base_output_tokens,
                phase.token_escalations,
                self.run.token_cap,
            ),
            file_context: phase.file_context.clone(),
            hint: phase.builder_hint.clone(),
            disabled_providers: self.run.disabled_providers.clone(),
            workspace: self.workspace.clone(),
        };

        let build = self.agents.builder.build(&request, &self.cancel);
        let built = if self.builder_timeout.is_zero() {
            Ok(build.await)
        } else {
            tokio::time::timeout(self.builder_timeout, build).await
        };

        let outcome = match built {
            Err(_) => {
                return AttemptResult::Finished {
                    status: AttemptStatus::InfraError,
                    summary: String::new(),
                    error: Some(format!(
                        "builder timed out after {}s",
                        self.builder_timeout.as_secs()
                    )),
                }
            }
            Ok(Err(err)) => return agent_failure("builder", &err),
            Ok(Ok(outcome)) => outcome,
        };

        if outcome.status != AttemptStatus::Complete {
            return AttemptResult::Finished {
                status: outcome.status,
                summary: outcome.summary,
                error: outcome.error,
            };
        }

        let review = AuditRequest {
            run_id: self.run.id.clone(),
            phase_id: phase.id.clone(),
            description: phase.description.clone(),
            attempt: phase.retry_attempt,
            builder_summary: outcome.summary.clone(),
            workspace: self.workspace.clone(),
        };
        match self.agents.auditor.review(&review, &self.cancel).await {
            Ok(AuditVerdict::Approve) => AttemptResult::Finished {
                status: AttemptStatus::Complete,
                summary: outcome.summary,
                error: None,
            },
            Ok(AuditVerdict::Revise { feedback }) => AttemptResult::Finished {
                status: AttemptStatus::AuditRejected,
                summary: outcome.summary,
                error: Some(format!("auditor requested changes: {feedback}")),
            },
            Ok(AuditVerdict::Escalate { reason }) => AttemptResult::Blocked(reason),
            Err(err) => agent_failure("auditor", &err),
        }
    }

    /// Invoke diagnostics and apply its action. Returns a terminal status
    /// when the action ended the phase.
    async fn diagnose(
        &mut self,
        phase: &mut Phase,
        status: AttemptStatus,
        last_error: Option<&str>,
    ) -> Result<Option<TerminalStatus>> {
        let context = self.doctor.build_doctor_context(phase, status, last_error);
        let request = self
            .doctor
            .build_request(phase, status, context, &self.workspace);
        let response = self.doctor.invoke_doctor(request).await;

        self.storage
            .record_event(
                &self.run.id,
                Some(&phase.id),
                EventPayload::DoctorInvoked(DoctorInvokedPayload {
                    phase_id: phase.id.clone(),
                    attempt: phase.retry_attempt,
                    action: response.as_ref().map(|r| r.action.as_str().to_string()),
                    calls_this_phase: self.doctor.budget().phase_calls(&phase.id.0),
                    calls_this_run: self.doctor.budget().run_calls(),
                }),
            )
            .await;

        let Some(response) = response else {
            return Ok(None);
        };

        let directive = match self.doctor.handle_doctor_action(phase, &response) {
            Ok(directive) => directive,
            Err(err) => {
                tracing::warn!(phase_id = %phase.id, error = %err, "ignoring malformed diagnostics action");
                return Ok(None);
            }
        };

        let mut run_changed = false;
        if self.doctor.run_high_risk() && !self.run.high_risk {
            self.run.high_risk = true;
            run_changed = true;
        }
        for provider in self.doctor.disabled_providers() {
            if !self.run.disabled_providers.contains(provider) {
                self.run.disabled_providers.push(provider.clone());
                run_changed = true;
            }
        }
        if run_changed {
            self.run.disabled_providers.sort();
            self.storage.update_run(&self.run).await?;
        }

        match directive {
            DoctorDirective::Retry => {
                phase.updated_at = chrono::Utc::now();
                self.storage.update_phase(phase).await?;
                Ok(None)
            }
            DoctorDirective::Skip { reason } => {
                Ok(Some(self.finish(phase, TerminalStatus::Skipped, Some(reason)).await?))
            }
            DoctorDirective::EscalateHuman { reason } => {
                Ok(Some(self.escalate_to_human(phase, reason).await?))
            }
            DoctorDirective::ExecuteFix => {
                let outcome = self
                    .fixes
                    .execute_fix(&self.run, phase, &response, &self.rollback, &self.cancel)
                    .await;
                let fix = response.fix.as_ref();
                self.storage
                    .record_event(
                        &self.run.id,
                        Some(&phase.id),
                        EventPayload::FixExecuted(FixExecutedPayload {
                            phase_id: phase.id.clone(),
                            fix_type: fix.map_or("none", |f| f.fix_type.as_str()).to_string(),
                            command_count: fix.map_or(0, |f| f.commands.len()),
                            succeeded: outcome.should_continue_retry,
                            action_taken: outcome.action_taken.clone(),
                        }),
                    )
                    .await;
                if outcome.should_continue_retry {
                    self.storage.update_phase(phase).await?;
                    Ok(None)
                } else {
                    let reason = phase.last_failure_reason.clone();
                    Ok(Some(self.finish(phase, TerminalStatus::Failed, reason).await?))
                }
            }
        }
    }

    /// Roll back to `savepoint` with a safe clean and record the outcome.
    async fn roll_back(
        &self,
        phase: &Phase,
        savepoint: &Savepoint,
        reason: &str,
    ) -> Result<RollbackOutcome> {
        let outcome = self
            .rollback
            .rollback_to_savepoint(savepoint, reason, true)?;
        let payload = RollbackPayload {
            phase_id: phase.id.clone(),
            savepoint: savepoint.tag.clone(),
            reason: reason.to_string(),
            protected_paths: match &outcome {
                RollbackOutcome::Refused {
                    protected_paths, ..
                } => protected_paths.clone(),
                RollbackOutcome::RolledBack { .. } => Vec::new(),
            },
        };
        let event = if outcome.is_refused() {
            EventPayload::RollbackRefused(payload)
        } else {
            EventPayload::RollbackPerformed(payload)
        };
        self.storage
            .record_event(&self.run.id, Some(&phase.id), event)
            .await;
        Ok(outcome)
    }

    /// Raise an approval request and block the phase.
    async fn escalate_to_human(
        &mut self,
        phase: &mut Phase,
        reason: String,
    ) -> Result<TerminalStatus> {
        let mut request = ApprovalRequest::new(self.run.id.clone(), phase.id.clone(), &reason);
        match self.agents.approvals.request_approval(&request).await {
            Ok(status) => request.status = status,
            Err(err) => {
                tracing::warn!(approval_id = %request.id, error = %err, "approval channel failed");
            }
        }
        self.storage.insert_approval(&request).await?;
        self.storage
            .record_event(
                &self.run.id,
                Some(&phase.id),
                EventPayload::ApprovalRequested(ApprovalRequestedPayload {
                    approval_id: request.id.clone(),
                    phase_id: phase.id.clone(),
                    reason: reason.clone(),
                }),
            )
            .await;
        self.finish(
            phase,
            TerminalStatus::Blocked,
            Some(format!("awaiting human approval {}: {reason}", request.id)),
        )
        .await
    }

    /// Record the terminal state of `phase`.
    async fn finish(
        &self,
        phase: &mut Phase,
        status: TerminalStatus,
        reason: Option<String>,
    ) -> Result<TerminalStatus> {
        phase.state = status.phase_state();
        if reason.is_some() {
            phase.last_failure_reason.clone_from(&reason);
        }
        phase.updated_at = chrono::Utc::now();
        self.storage.update_phase(phase).await?;
        self.storage
            .record_event(
                &self.run.id,
                Some(&phase.id),
                EventPayload::PhaseFinished(PhaseFinishedPayload {
                    phase_id: phase.id.clone(),
                    status,
                    attempts: phase.retry_attempt,
                    reason: reason.clone(),
                }),
            )
            .await;

        match status {
            TerminalStatus::Complete => {
                tracing::info!(run_id = %self.run.id, phase_id = %phase.id, attempts = phase.retry_attempt, "phase complete");
            }
            _ => {
                tracing::warn!(
                    run_id = %self.run.id,
                    phase_id = %phase.id,
                    status = status.as_str(),
                    reason = reason.as_deref().unwrap_or(""),
                    "phase stopped"
                );
            }
        }
        Ok(status)
    }
}

/// Map an agent error to an attempt result. Cancellation is not a failure.
fn agent_failure(agent: &str, err: &AgentError) -> AttemptResult {
    if err.is_cancelled() {
        return AttemptResult::Canceled;
    }
    // Timeouts, missing binaries and I/O errors are infrastructure problems.
    let status = match err {
        AgentError::Failed { .. } if agent == "builder" => AttemptStatus::BuilderFailed,
        _ => AttemptStatus::InfraError,
    };
    AttemptResult::Finished {
        status,
        summary: String::new(),
        error: Some(format!("{agent} error: {err}")),
    }
}
