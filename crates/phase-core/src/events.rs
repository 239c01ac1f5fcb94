//! Event types for the execution audit log.

use crate::types::{AttemptStatus, Id, RunState, TerminalStatus};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    PhaseStarted,
    AttemptFinished,
    DoctorInvoked,
    FixExecuted,
    RollbackPerformed,
    RollbackRefused,
    ApprovalRequested,
    ScopeReduced,
    PhaseFinished,
    RunFinished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::PhaseStarted => "PHASE_STARTED",
            Self::AttemptFinished => "ATTEMPT_FINISHED",
            Self::DoctorInvoked => "DOCTOR_INVOKED",
            Self::FixExecuted => "FIX_EXECUTED",
            Self::RollbackPerformed => "ROLLBACK_PERFORMED",
            Self::RollbackRefused => "ROLLBACK_REFUSED",
            Self::ApprovalRequested => "APPROVAL_REQUESTED",
            Self::ScopeReduced => "SCOPE_REDUCED",
            Self::PhaseFinished => "PHASE_FINISHED",
            Self::RunFinished => "RUN_FINISHED",
        }
    }
}

/// Payload for RUN_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: Id,
    pub run_type: String,
    pub phase_count: usize,
}

/// Payload for PHASE_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStartedPayload {
    pub phase_id: Id,
    pub retry_attempt: u32,
    pub max_attempts: u32,
}

/// Payload for ATTEMPT_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFinishedPayload {
    pub phase_id: Id,
    pub attempt: u32,
    pub status: AttemptStatus,
    pub duration_ms: u64,
}

/// Payload for DOCTOR_INVOKED event. Carries counts only, never raw output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInvokedPayload {
    pub phase_id: Id,
    pub attempt: u32,
    /// Action returned by diagnostics, `None` when no response was obtained.
    pub action: Option<String>,
    pub calls_this_phase: u32,
    pub calls_this_run: u32,
}

/// Payload for FIX_EXECUTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixExecutedPayload {
    pub phase_id: Id,
    pub fix_type: String,
    pub command_count: usize,
    pub succeeded: bool,
    pub action_taken: String,
}

/// Payload for ROLLBACK_PERFORMED and ROLLBACK_REFUSED events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPayload {
    pub phase_id: Id,
    pub savepoint: String,
    pub reason: String,
    /// Protected paths that blocked the rollback, empty when it was performed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protected_paths: Vec<String>,
}

/// Payload for APPROVAL_REQUESTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestedPayload {
    pub approval_id: Id,
    pub phase_id: Id,
    pub reason: String,
}

/// Payload for SCOPE_REDUCED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeReducedPayload {
    pub proposal_id: Id,
    pub phase_id: Id,
    pub removed_paths: Vec<String>,
}

/// Payload for PHASE_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseFinishedPayload {
    pub phase_id: Id,
    pub status: TerminalStatus,
    pub attempts: u32,
    pub reason: Option<String>,
}

/// Payload for RUN_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    pub run_id: Id,
    pub state: RunState,
    pub phases_complete: usize,
    pub phases_total: usize,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    PhaseStarted(PhaseStartedPayload),
    AttemptFinished(AttemptFinishedPayload),
    DoctorInvoked(DoctorInvokedPayload),
    FixExecuted(FixExecutedPayload),
    RollbackPerformed(RollbackPayload),
    RollbackRefused(RollbackPayload),
    ApprovalRequested(ApprovalRequestedPayload),
    ScopeReduced(ScopeReducedPayload),
    PhaseFinished(PhaseFinishedPayload),
    RunFinished(RunFinishedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted(_) => EventType::RunStarted,
            Self::PhaseStarted(_) => EventType::PhaseStarted,
            Self::AttemptFinished(_) => EventType::AttemptFinished,
            Self::DoctorInvoked(_) => EventType::DoctorInvoked,
            Self::FixExecuted(_) => EventType::FixExecuted,
            Self::RollbackPerformed(_) => EventType::RollbackPerformed,
            Self::RollbackRefused(_) => EventType::RollbackRefused,
            Self::ApprovalRequested(_) => EventType::ApprovalRequested,
            Self::ScopeReduced(_) => EventType::ScopeReduced,
            Self::PhaseFinished(_) => EventType::PhaseFinished,
            Self::RunFinished(_) => EventType::RunFinished,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&EventType::PhaseStarted).unwrap(),
            "\"PHASE_STARTED\""
        );
        assert_eq!(EventType::RollbackRefused.as_str(), "ROLLBACK_REFUSED");
    }

    #[test]
    fn attempt_finished_payload_uses_status_names() {
        let payload = EventPayload::AttemptFinished(AttemptFinishedPayload {
            phase_id: Id::from_string("p1"),
            attempt: 2,
            status: AttemptStatus::CiFailed,
            duration_ms: 1500,
        });
        assert_eq!(payload.event_type(), EventType::AttemptFinished);
        let json = payload.to_json().unwrap();
        assert!(json.contains("CI_FAILED"));
        assert!(json.contains("\"attempt\":2"));
    }

    #[test]
    fn rollback_payload_omits_empty_protected_paths() {
        let performed = RollbackPayload {
            phase_id: Id::from_string("p1"),
            savepoint: "savepoint/r-0123456789ab/p1-20260101T000000Z".to_string(),
            reason: "attempt failed".to_string(),
            protected_paths: Vec::new(),
        };
        let json = serde_json::to_string(&performed).unwrap();
        assert!(!json.contains("protected_paths"));

        let refused = EventPayload::RollbackRefused(RollbackPayload {
            protected_paths: vec![".env".to_string()],
            ..performed
        });
        assert_eq!(refused.event_type(), EventType::RollbackRefused);
        assert!(refused.to_json().unwrap().contains(".env"));
    }
}
