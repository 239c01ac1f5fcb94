//! Agent seams: builder, auditor, diagnostics backend and approval channel.
//!
//! The engine only talks to these traits. The `Command*` adapters drive
//! external agent CLIs through the subprocess runner.

use async_trait::async_trait;
use phase_core::completion::{detect_marker, BuilderSignal};
use phase_core::{ApprovalRequest, ApprovalStatus, AttemptStatus, Id};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::doctor::{DoctorRequest, DoctorResponse};
use crate::runner::{run_command, split_args, CommandSpec, RunnerError};

/// Bytes of agent output kept in failure reasons.
const ERROR_TAIL_BYTES: usize = 2000;

/// Comma-separated providers the builder CLI must not use.
pub const DISABLED_PROVIDERS_ENV: &str = "PHASED_DISABLED_PROVIDERS";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("invalid agent response: {0}")]
    InvalidResponse(String),
    #[error("agent exited with code {exit_code}: {message}")]
    Failed { exit_code: i32, message: String },
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Runner(RunnerError::Cancelled))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub run_id: Id,
    pub phase_id: Id,
    pub description: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub escalation_level: u32,
    pub max_output_tokens: u64,
    pub file_context: Vec<String>,
    /// Hint left by diagnostics after a previous failure.
    pub hint: Option<String>,
    /// Providers diagnostics disabled for this run.
    pub disabled_providers: Vec<String>,
    pub workspace: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub status: AttemptStatus,
    pub summary: String,
    pub error: Option<String>,
}

impl BuildOutcome {
    pub fn complete(summary: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::Complete,
            summary: summary.into(),
            error: None,
        }
    }

    pub fn failed(status: AttemptStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            summary: String::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditRequest {
    pub run_id: Id,
    pub phase_id: Id,
    pub description: String,
    pub attempt: u32,
    pub builder_summary: String,
    pub workspace: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditVerdict {
    Approve,
    Revise { feedback: String },
    Escalate { reason: String },
}

#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, request: &BuildRequest, cancel: &CancellationToken)
        -> Result<BuildOutcome>;
}

#[async_trait]
pub trait Auditor: Send + Sync {
    async fn review(&self, request: &AuditRequest, cancel: &CancellationToken)
        -> Result<AuditVerdict>;
}

#[async_trait]
pub trait DiagnosticsBackend: Send + Sync {
    async fn diagnose(&self, request: &DoctorRequest) -> Result<DoctorResponse>;
}

#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Deliver an approval request to a human. Returns the status known now.
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<ApprovalStatus>;
}

fn tail(text: &str, max_bytes: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max_bytes {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max_bytes;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

fn parse_command(command: &str) -> Result<Vec<String>> {
    Ok(split_args(command)?)
}

/// Render the builder prompt sent on stdin.
pub fn render_build_prompt(request: &BuildRequest) -> String {
    let mut prompt = format!(
        "# Phase {phase}\n\n{description}\n\n\
         Run: {run}\nAttempt: {attempt} of {max}\nEscalation level: {level}\n\
         Output token budget: {tokens}\n",
        phase = request.phase_id,
        description = request.description,
        run = request.run_id,
        attempt = request.attempt + 1,
        max = request.max_attempts,
        level = request.escalation_level,
        tokens = request.max_output_tokens,
    );
    if !request.file_context.is_empty() {
        prompt.push_str("\n## Files\n");
        for file in &request.file_context {
            prompt.push_str(&format!("- {file}\n"));
        }
    }
    if let Some(hint) = &request.hint {
        prompt.push_str(&format!("\n## Hint from the previous attempt\n{hint}\n"));
    }
    if !request.disabled_providers.is_empty() {
        prompt.push_str(&format!(
            "\nDisabled providers (do not use): {}\n",
            request.disabled_providers.join(", ")
        ));
    }
    prompt.push_str(
        "\nWhen the phase is done, end your output with <status>COMPLETE</status>.\n\
         If you ran out of output budget, end with <status>TOKEN_ESCALATION</status>.\n",
    );
    prompt
}

/// Builder backed by an agent CLI. The prompt goes to stdin; the trailing
/// status marker decides the outcome.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandBuilder {
    pub fn new(command: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            argv: parse_command(command)?,
            timeout,
        })
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let spec = CommandSpec::new(self.argv.clone(), &request.workspace, self.timeout)
            .with_stdin(render_build_prompt(request))
            .with_env(DISABLED_PROVIDERS_ENV, request.disabled_providers.join(","));
        let output = run_command(&spec, cancel).await?;

        if !output.success() {
            return Ok(BuildOutcome::failed(
                AttemptStatus::BuilderFailed,
                format!(
                    "builder exited with code {}: {}",
                    output.exit_code,
                    tail(&output.stderr, ERROR_TAIL_BYTES)
                ),
            ));
        }

        let marker = detect_marker(&output.stdout);
        if marker.is_malformed {
            tracing::warn!(phase_id = %request.phase_id, "builder status marker was not on the last line");
        }
        Ok(match marker.signal {
            BuilderSignal::Complete => BuildOutcome::complete(tail(&output.stdout, ERROR_TAIL_BYTES)),
            BuilderSignal::TokenEscalation => BuildOutcome::failed(
                AttemptStatus::TokenEscalation,
                "builder requested a larger output budget",
            ),
            BuilderSignal::None => BuildOutcome::failed(
                AttemptStatus::BuilderFailed,
                format!(
                    "builder finished without a status marker: {}",
                    tail(&output.stdout, ERROR_TAIL_BYTES)
                ),
            ),
        })
    }
}

/// Auditor backed by a CLI. The last non-empty output line decides the
/// verdict: `APPROVED`, `ESCALATE[: reason]`, anything else means revise.
#[derive(Debug, Clone)]
pub struct CommandAuditor {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandAuditor {
    pub fn new(command: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            argv: parse_command(command)?,
            timeout,
        })
    }
}

/// Parse auditor output into a verdict.
pub fn parse_audit_verdict(output: &str) -> AuditVerdict {
    let last = output
        .lines()
        .rfind(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim();

    if last == "APPROVED" {
        AuditVerdict::Approve
    } else if let Some(rest) = last.strip_prefix("ESCALATE") {
        let reason = rest.trim_start_matches(':').trim();
        AuditVerdict::Escalate {
            reason: if reason.is_empty() {
                "auditor requested human review".to_string()
            } else {
                reason.to_string()
            },
        }
    } else {
        AuditVerdict::Revise {
            feedback: tail(output, ERROR_TAIL_BYTES),
        }
    }
}

#[async_trait]
impl Auditor for CommandAuditor {
    async fn review(
        &self,
        request: &AuditRequest,
        cancel: &CancellationToken,
    ) -> Result<AuditVerdict> {
        let prompt = format!(
            "# Review phase {phase} (attempt {attempt})\n\n{description}\n\n\
             ## Builder summary\n{summary}\n\n\
             Reply APPROVED, ESCALATE: <reason>, or revision feedback.\n",
            phase = request.phase_id,
            attempt = request.attempt + 1,
            description = request.description,
            summary = request.builder_summary,
        );
        let spec =
            CommandSpec::new(self.argv.clone(), &request.workspace, self.timeout).with_stdin(prompt);
        let output = run_command(&spec, cancel).await?;
        if !output.success() {
            return Err(AgentError::Failed {
                exit_code: output.exit_code,
                message: tail(&output.stderr, ERROR_TAIL_BYTES),
            });
        }
        Ok(parse_audit_verdict(&output.stdout))
    }
}

/// Diagnostics backend speaking JSON over stdin/stdout, run in the
/// workspace of the failing phase.
#[derive(Debug, Clone)]
pub struct CommandDiagnostics {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandDiagnostics {
    pub fn new(command: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            argv: parse_command(command)?,
            timeout,
        })
    }
}

/// Parse a diagnostics response: the whole output, or failing that its last JSON line.
pub fn parse_doctor_response(output: &str) -> Result<DoctorResponse> {
    if let Ok(response) = serde_json::from_str(output.trim()) {
        return Ok(response);
    }
    output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
        .ok_or_else(|| {
            AgentError::InvalidResponse(format!(
                "no diagnostics JSON in output: {}",
                tail(output, 200)
            ))
        })
}

#[async_trait]
impl DiagnosticsBackend for CommandDiagnostics {
    async fn diagnose(&self, request: &DoctorRequest) -> Result<DoctorResponse> {
        let input = serde_json::to_string(request)
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))?;
        let spec =
            CommandSpec::new(self.argv.clone(), &request.workspace, self.timeout).with_stdin(input);
        // The doctor call is bounded by the integration's own timeout.
        let output = run_command(&spec, &CancellationToken::new()).await?;
        if !output.success() {
            return Err(AgentError::Failed {
                exit_code: output.exit_code,
                message: tail(&output.stderr, ERROR_TAIL_BYTES),
            });
        }
        parse_doctor_response(&output.stdout)
    }
}

/// Approval channel that only logs the request for an operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogApprovalChannel;

#[async_trait]
impl ApprovalChannel for LogApprovalChannel {
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<ApprovalStatus> {
        tracing::warn!(
            approval_id = %request.id,
            run_id = %request.run_id,
            phase_id = %request.phase_id,
            timeout_secs = request.timeout_secs,
            "human approval required: {}",
            request.reason
        );
        Ok(ApprovalStatus::Pending)
    }
}
