//! Retry and escalation policy.
//!
//! `next_attempt_state` is a pure function of its inputs: no I/O, no clock,
//! no shared state. Model-tier escalation is decided elsewhere; this policy
//! only advances the attempt counter and gates diagnostics.

use serde::{Deserialize, Serialize};

use crate::types::AttemptStatus;

/// Input to the policy. Never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptContext {
    /// Attempts already consumed (0-indexed).
    pub attempt_index: u32,
    /// Attempt ceiling; zero or negative means no attempts are allowed.
    pub max_attempts: i32,
    pub escalation_level: u32,
}

impl AttemptContext {
    pub fn new(attempt_index: u32, max_attempts: i32, escalation_level: u32) -> Self {
        Self {
            attempt_index,
            max_attempts,
            escalation_level,
        }
    }

    /// Whether no further attempt may be made from this context.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts <= 0 || i64::from(self.attempt_index) >= i64::from(self.max_attempts)
    }
}

/// Output of the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptDecision {
    /// New value for the phase's retry counter, `None` when unchanged.
    pub next_retry_attempt: Option<u32>,
    pub should_run_diagnostics: bool,
    /// Always false here; model-tier escalation is a separate policy.
    pub should_escalate_model: bool,
    pub terminal: bool,
}

impl AttemptDecision {
    /// Terminal without a counter change: the attempt completed, or nothing was left to try.
    pub fn is_success_or_exhausted(&self) -> bool {
        self.terminal && self.next_retry_attempt.is_none()
    }

    fn terminal_without_update() -> Self {
        Self {
            next_retry_attempt: None,
            should_run_diagnostics: false,
            should_escalate_model: false,
            terminal: true,
        }
    }
}

/// Decide what happens after an attempt finished with `status`.
pub fn next_attempt_state(context: AttemptContext, status: AttemptStatus) -> AttemptDecision {
    if context.is_exhausted() {
        return AttemptDecision::terminal_without_update();
    }

    if status == AttemptStatus::Complete {
        return AttemptDecision::terminal_without_update();
    }

    let advanced = context.attempt_index + 1;
    let reaches_limit = i64::from(advanced) >= i64::from(context.max_attempts);

    AttemptDecision {
        next_retry_attempt: Some(advanced),
        // Token escalation asks for a larger output budget; it is not a defect.
        should_run_diagnostics: status != AttemptStatus::TokenEscalation,
        should_escalate_model: false,
        terminal: reaches_limit,
    }
}

/// Output-token budget for the next builder call.
///
/// Doubles per token escalation and never exceeds the run's `token_cap`.
pub fn output_token_budget(base: u64, token_escalations: u32, token_cap: u64) -> u64 {
    let factor = 1u64.checked_shl(token_escalations.min(16)).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(token_cap)
}
