//! Diagnostics ("doctor") integration.
//!
//! Decides when diagnostics may run, builds a bounded summary of the
//! failure, calls the backend under a timeout and turns its action into a
//! directive for the engine. Budgets are per run and fail closed.

use phase_core::config::Config;
use phase_core::{AttemptStatus, Id, Phase};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::agents::DiagnosticsBackend;
use crate::fix::FixSpec;

/// Hex characters of the SHA-256 error fingerprint sent to diagnostics.
const FINGERPRINT_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum DoctorError {
    #[error("diagnostics response for {action} is missing {field}")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },
}

/// Actions diagnostics may recommend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoctorAction {
    RetryWithFix,
    SkipPhase,
    ExecuteFix,
    EscalateModel,
    DisableProvider,
    RaiseRisk,
    EscalateHuman,
}

impl DoctorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryWithFix => "retry_with_fix",
            Self::SkipPhase => "skip_phase",
            Self::ExecuteFix => "execute_fix",
            Self::EscalateModel => "escalate_model",
            Self::DisableProvider => "disable_provider",
            Self::RaiseRisk => "raise_risk",
            Self::EscalateHuman => "escalate_human",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctorResponse {
    pub action: DoctorAction,
    #[serde(default)]
    pub rationale: String,
    /// Guidance for the next builder attempt.
    #[serde(default)]
    pub hint: Option<String>,
    /// Required for `execute_fix`.
    #[serde(default)]
    pub fix: Option<FixSpec>,
    /// Required for `disable_provider`.
    #[serde(default)]
    pub provider: Option<String>,
}

/// Bounded failure summary. Counts and a fingerprint only, never raw output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorContext {
    pub attempts: u32,
    pub max_attempts: u32,
    pub escalation_level: u32,
    pub error_category: String,
    pub distinct_categories: usize,
    pub category_repeats: u32,
    pub is_looping: bool,
    pub calls_remaining_phase: u32,
    pub calls_remaining_run: u32,
    /// SHA-256 prefix of the last error text.
    pub error_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorRequest {
    pub run_id: Id,
    pub phase_id: Id,
    pub status: AttemptStatus,
    /// Ask for the stronger diagnostics model.
    pub strong_model: bool,
    pub context: DoctorContext,
    /// Checkout the failing phase ran in; command backends run here.
    pub workspace: PathBuf,
}

/// What the engine should do after a diagnostics action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoctorDirective {
    /// Keep retrying the phase.
    Retry,
    /// Stop the phase permanently.
    Skip { reason: String },
    /// Hand the response to the execute-fix handler.
    ExecuteFix,
    /// Raise an approval request and block the phase.
    EscalateHuman { reason: String },
}

/// Diagnostics calls made during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoctorCallBudget {
    per_phase: HashMap<String, u32>,
    run_calls: u32,
    strong_calls: u32,
    infra_calls: u32,
}

impl DoctorCallBudget {
    pub fn phase_calls(&self, phase_id: &str) -> u32 {
        self.per_phase.get(phase_id).copied().unwrap_or(0)
    }

    pub fn run_calls(&self) -> u32 {
        self.run_calls
    }

    pub fn strong_calls(&self) -> u32 {
        self.strong_calls
    }

    pub fn infra_calls(&self) -> u32 {
        self.infra_calls
    }

    fn record(&mut self, phase_id: &str, infra: bool, strong: bool) {
        *self.per_phase.entry(phase_id.to_string()).or_insert(0) += 1;
        self.run_calls += 1;
        if infra {
            self.infra_calls += 1;
        }
        if strong {
            self.strong_calls += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoctorLimits {
    pub min_builder_attempts: u32,
    pub max_calls_per_phase: u32,
    pub max_calls_per_run: u32,
    pub max_strong_calls_per_run: u32,
    pub max_infra_calls_per_run: u32,
    pub timeout: Duration,
}

impl DoctorLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_builder_attempts: config.doctor_min_builder_attempts,
            max_calls_per_phase: config.doctor_max_calls_per_phase,
            max_calls_per_run: config.doctor_max_calls_per_run,
            max_strong_calls_per_run: config.doctor_max_strong_calls_per_run,
            max_infra_calls_per_run: config.doctor_max_infra_calls_per_run,
            timeout: Duration::from_secs(config.doctor_timeout_sec),
        }
    }
}

pub struct DoctorIntegration {
    backend: Option<Arc<dyn DiagnosticsBackend>>,
    limits: DoctorLimits,
    budget: DoctorCallBudget,
    /// Error categories seen per phase, in order.
    categories: HashMap<String, Vec<&'static str>>,
    disabled_providers: HashSet<String>,
    high_risk: bool,
}

impl std::fmt::Debug for DoctorIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoctorIntegration")
            .field("has_backend", &self.backend.is_some())
            .field("limits", &self.limits)
            .field("budget", &self.budget)
            .field("high_risk", &self.high_risk)
            .finish_non_exhaustive()
    }
}

impl DoctorIntegration {
    pub fn new(backend: Option<Arc<dyn DiagnosticsBackend>>, limits: DoctorLimits) -> Self {
        Self {
            backend,
            limits,
            budget: DoctorCallBudget::default(),
            categories: HashMap::new(),
            disabled_providers: HashSet::new(),
            high_risk: false,
        }
    }

    pub fn budget(&self) -> &DoctorCallBudget {
        &self.budget
    }

    pub fn limits(&self) -> &DoctorLimits {
        &self.limits
    }

    /// Set when diagnostics raised the run's risk classification.
    pub fn run_high_risk(&self) -> bool {
        self.high_risk
    }

    pub fn disabled_providers(&self) -> &HashSet<String> {
        &self.disabled_providers
    }

    /// Start a new run: budgets and loop tracking are per run.
    pub fn reset(&mut self) {
        self.budget = DoctorCallBudget::default();
        self.categories.clear();
        self.disabled_providers.clear();
        self.high_risk = false;
    }

    /// Whether diagnostics may be invoked for this failure.
    ///
    /// Infra errors skip the minimum-attempts gate but have their own budget.
    /// A zero limit denies.
    pub fn should_invoke_doctor(
        &self,
        phase_id: &str,
        builder_attempts: u32,
        status: AttemptStatus,
    ) -> bool {
        let limits = &self.limits;
        if !status.is_failure() || status == AttemptStatus::TokenEscalation {
            return false;
        }
        if limits.max_calls_per_phase == 0 || limits.max_calls_per_run == 0 {
            return false;
        }
        if self.budget.phase_calls(phase_id) >= limits.max_calls_per_phase
            || self.budget.run_calls() >= limits.max_calls_per_run
        {
            return false;
        }
        if status.is_infra() {
            return self.budget.infra_calls() < limits.max_infra_calls_per_run;
        }
        builder_attempts >= limits.min_builder_attempts.max(1)
    }

    /// Summarize the failure for diagnostics and record its category.
    pub fn build_doctor_context(
        &mut self,
        phase: &Phase,
        status: AttemptStatus,
        last_error: Option<&str>,
    ) -> DoctorContext {
        let category = status.category();
        let history = self.categories.entry(phase.id.0.clone()).or_default();
        history.push(category);

        let category_repeats = history.iter().filter(|c| **c == category).count() as u32;
        let distinct_categories = history.iter().collect::<HashSet<_>>().len();

        let error_fingerprint = last_error.filter(|e| !e.trim().is_empty()).map(|error| {
            let digest = Sha256::digest(error.trim().as_bytes());
            format!("{digest:x}").chars().take(FINGERPRINT_LEN).collect()
        });

        DoctorContext {
            attempts: phase.retry_attempt,
            max_attempts: phase.max_attempts,
            escalation_level: phase.escalation_level,
            error_category: category.to_string(),
            distinct_categories,
            category_repeats,
            is_looping: category_repeats >= 2,
            calls_remaining_phase: self
                .limits
                .max_calls_per_phase
                .saturating_sub(self.budget.phase_calls(&phase.id.0)),
            calls_remaining_run: self
                .limits
                .max_calls_per_run
                .saturating_sub(self.budget.run_calls()),
            error_fingerprint,
        }
    }

    /// Build a request; the strong model is asked for when the phase loops
    /// or was already escalated.
    pub fn build_request(
        &self,
        phase: &Phase,
        status: AttemptStatus,
        context: DoctorContext,
        workspace: &Path,
    ) -> DoctorRequest {
        DoctorRequest {
            run_id: phase.run_id.clone(),
            phase_id: phase.id.clone(),
            status,
            strong_model: context.is_looping || phase.escalation_level > 0,
            context,
            workspace: workspace.to_path_buf(),
        }
    }

    /// Call the backend. `None` when no backend is configured, the call
    /// failed, or it timed out; a failed call still uses budget.
    pub async fn invoke_doctor(&mut self, mut request: DoctorRequest) -> Option<DoctorResponse> {
        let backend = self.backend.clone()?;

        if request.strong_model && self.budget.strong_calls() >= self.limits.max_strong_calls_per_run
        {
            tracing::info!(phase_id = %request.phase_id, "strong diagnostics budget exhausted, downgrading");
            request.strong_model = false;
        }
        self.budget.record(
            &request.phase_id.0,
            request.status.is_infra(),
            request.strong_model,
        );

        let result = if self.limits.timeout.is_zero() {
            Ok(backend.diagnose(&request).await)
        } else {
            tokio::time::timeout(self.limits.timeout, backend.diagnose(&request)).await
        };

        match result {
            Ok(Ok(response)) => {
                tracing::info!(
                    run_id = %request.run_id,
                    phase_id = %request.phase_id,
                    action = response.action.as_str(),
                    "diagnostics responded"
                );
                Some(response)
            }
            Ok(Err(err)) => {
                tracing::warn!(phase_id = %request.phase_id, error = %err, "diagnostics call failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    phase_id = %request.phase_id,
                    timeout_sec = self.limits.timeout.as_secs(),
                    "diagnostics call timed out"
                );
                None
            }
        }
    }

    /// Apply a diagnostics action to the phase and tell the engine what to do.
    pub fn handle_doctor_action(
        &mut self,
        phase: &mut Phase,
        response: &DoctorResponse,
    ) -> Result<DoctorDirective, DoctorError> {
        let directive = match response.action {
            DoctorAction::RetryWithFix => {
                phase.builder_hint = response
                    .hint
                    .clone()
                    .or_else(|| (!response.rationale.is_empty()).then(|| response.rationale.clone()));
                DoctorDirective::Retry
            }
            DoctorAction::SkipPhase => DoctorDirective::Skip {
                reason: format!("skipped on diagnostics recommendation: {}", response.rationale),
            },
            DoctorAction::ExecuteFix => {
                if response.fix.is_none() {
                    return Err(DoctorError::MissingField {
                        action: "execute_fix",
                        field: "fix",
                    });
                }
                DoctorDirective::ExecuteFix
            }
            DoctorAction::EscalateModel => {
                phase.escalation_level += 1;
                if response.hint.is_some() {
                    phase.builder_hint.clone_from(&response.hint);
                }
                DoctorDirective::Retry
            }
            DoctorAction::DisableProvider => {
                let Some(provider) = &response.provider else {
                    return Err(DoctorError::MissingField {
                        action: "disable_provider",
                        field: "provider",
                    });
                };
                self.disabled_providers.insert(provider.clone());
                tracing::warn!(run_id = %phase.run_id, provider = %provider, "provider disabled for run");
                DoctorDirective::Retry
            }
            DoctorAction::RaiseRisk => {
                self.high_risk = true;
                tracing::warn!(run_id = %phase.run_id, phase_id = %phase.id, "run marked high risk");
                DoctorDirective::Retry
            }
            DoctorAction::EscalateHuman => DoctorDirective::EscalateHuman {
                reason: if response.rationale.is_empty() {
                    format!("diagnostics escalated phase {} to a human", phase.id)
                } else {
                    format!(
                        "diagnostics escalated phase {} to a human: {}",
                        phase.id, response.rationale
                    )
                },
            },
        };
        Ok(directive)
    }
}
