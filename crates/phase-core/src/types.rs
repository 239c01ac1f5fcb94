//! Core types for the phase execution engine.
//!
//! Runs own an ordered list of phases; phases are attempted by the builder,
//! reviewed by the auditor, and diagnosed by the doctor on failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scope::ScopeConfig;

/// Unique identifier for runs, phases, events, and approval requests.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Phase lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    #[default]
    Queued,
    InProgress,
    Complete,
    Failed,
    Blocked,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(Self::Queued),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETE" => Some(Self::Complete),
            "FAILED" => Some(Self::Failed),
            "BLOCKED" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }
}

/// Outcome of a single attempt at a phase.
///
/// `TokenEscalation` means "retry with a larger output budget" and is not a
/// defect; `InfraError` is the only infra-class status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Complete,
    TokenEscalation,
    BuilderFailed,
    PatchFailed,
    AuditRejected,
    CiFailed,
    InfraError,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::TokenEscalation => "TOKEN_ESCALATION",
            Self::BuilderFailed => "BUILDER_FAILED",
            Self::PatchFailed => "PATCH_FAILED",
            Self::AuditRejected => "AUDIT_REJECTED",
            Self::CiFailed => "CI_FAILED",
            Self::InfraError => "INFRA_ERROR",
        }
    }

    /// Error category used for loop detection in diagnostics context.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Complete => "none",
            Self::TokenEscalation => "token_budget",
            Self::BuilderFailed => "builder",
            Self::PatchFailed => "patch",
            Self::AuditRejected => "audit",
            Self::CiFailed => "ci",
            Self::InfraError => "infra",
        }
    }

    pub fn is_infra(&self) -> bool {
        matches!(self, Self::InfraError)
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Complete)
    }
}

/// Terminal result of `execute_phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Complete,
    Failed,
    Blocked,
    /// Permanently skipped on a diagnostics recommendation.
    Skipped,
    Canceled,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
            Self::Skipped => "SKIPPED",
            Self::Canceled => "CANCELED",
        }
    }

    /// The phase state recorded for this terminal status.
    pub fn phase_state(&self) -> PhaseState {
        match self {
            Self::Complete => PhaseState::Complete,
            Self::Failed | Self::Skipped | Self::Canceled => PhaseState::Failed,
            Self::Blocked => PhaseState::Blocked,
        }
    }
}

/// Kind of run; governs which automated fixes are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Building the target project; git-mutating fixes are never allowed.
    #[default]
    ProjectBuild,
    Maintenance,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectBuild => "project_build",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "project_build" => Some(Self::ProjectBuild),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

/// Safety profile for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyProfile {
    #[default]
    Normal,
    /// No automated fixes at all; diagnostics may only hint or escalate.
    Strict,
}

impl SafetyProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Strict => "strict",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(Self::Normal),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

// --- Core records ---

/// One end-to-end autonomous build execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub state: RunState,
    pub run_type: RunType,
    pub safety_profile: SafetyProfile,
    /// Free-form scope label (e.g. the feature being built).
    pub run_scope: String,
    /// Hard cap on output tokens a single builder call may request.
    pub token_cap: u64,
    /// Set when diagnostics raised the risk classification of this run.
    pub high_risk: bool,
    /// Providers diagnostics disabled for the rest of the run, sorted.
    #[serde(default)]
    pub disabled_providers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: Id, run_type: RunType) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: RunState::Pending,
            run_type,
            safety_profile: SafetyProfile::Normal,
            run_scope: String::new(),
            token_cap: 64_000,
            high_risk: false,
            disabled_providers: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One unit of autonomous work within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: Id,
    pub run_id: Id,
    /// Tier the phase was declared in (tiers are flattened in order).
    pub tier: u32,
    /// Declared position within the run.
    pub position: u32,
    pub description: String,
    pub state: PhaseState,
    /// Number of attempts already consumed (0-indexed counter).
    pub retry_attempt: u32,
    pub max_attempts: u32,
    pub scope: ScopeConfig,
    /// Files the builder context will load for this phase.
    pub file_context: Vec<String>,
    /// Phase ids that must be COMPLETE before this phase starts.
    pub depends_on: Vec<String>,
    pub last_failure_reason: Option<String>,
    pub escalation_level: u32,
    /// Number of token-budget escalations applied so far.
    pub token_escalations: u32,
    /// Hint stashed by diagnostics for the next builder attempt.
    pub builder_hint: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Phase {
    pub fn new(run_id: Id, phase_id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            id: Id::from_string(phase_id),
            run_id,
            tier: 0,
            position: 0,
            description: String::new(),
            state: PhaseState::Queued,
            retry_attempt: 0,
            max_attempts,
            scope: ScopeConfig::default(),
            file_context: Vec::new(),
            depends_on: Vec::new(),
            last_failure_reason: None,
            escalation_level: 0,
            token_escalations: 0,
            builder_hint: None,
            updated_at: Utc::now(),
        }
    }

    /// Set a terminal failure state with a human-readable reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = PhaseState::Failed;
        self.last_failure_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    pub fn mark_blocked(&mut self, reason: impl Into<String>) {
        self.state = PhaseState::Blocked;
        self.last_failure_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }
}
