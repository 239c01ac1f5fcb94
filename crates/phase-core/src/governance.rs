//! Governance artifacts and policy gates.
//!
//! Approval requests and scope-reduction proposals default to requiring
//! human approval and are never auto-applied without an explicit opt-in.
//! Parallel execution is denied unless an intention anchor authorizes it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::types::Id;

/// Default time a pending approval stays valid.
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error(
        "parallel execution of {run_count} runs requires an intention anchor with parallelism_isolation=true"
    )]
    ParallelismNotAuthorized { run_count: usize },
    #[error("intention anchor {anchor_id} does not authorize parallelism isolation")]
    AnchorDeniesParallelism { anchor_id: String },
    #[error("{kind} {id} requires approval (status: {status})")]
    ApprovalRequired {
        kind: &'static str,
        id: String,
        status: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("failed to read intention anchor: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse intention anchor: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Status of a governance artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A request for a human decision before the engine proceeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Id,
    pub run_id: Id,
    pub phase_id: Id,
    /// Actionable message shown to the operator.
    pub reason: String,
    pub status: ApprovalStatus,
    pub requires_approval: bool,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(run_id: Id, phase_id: Id, reason: impl Into<String>) -> Self {
        Self {
            id: Id::new(),
            run_id,
            phase_id,
            reason: reason.into(),
            status: ApprovalStatus::Pending,
            requires_approval: true,
            timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            created_at: Utc::now(),
        }
    }

    /// Effective status at `now`; a pending request past its timeout expires.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ApprovalStatus {
        let deadline = self.created_at
            + Duration::seconds(i64::try_from(self.timeout_secs).unwrap_or(i64::MAX / 1000));
        if self.status == ApprovalStatus::Pending && now >= deadline {
            ApprovalStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_approved(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == ApprovalStatus::Approved
    }
}

/// A proposal to narrow a phase's scope (e.g. drop files it cannot finish).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeReductionProposal {
    pub id: Id,
    pub run_id: Id,
    pub phase_id: Id,
    pub remove_paths: Vec<String>,
    pub rationale: String,
    pub status: ApprovalStatus,
    pub requires_approval: bool,
    /// Explicit opt-in to apply without a human; ignored while approval is required.
    pub auto_apply: bool,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl ScopeReductionProposal {
    pub fn new(run_id: Id, phase_id: Id, remove_paths: Vec<String>, rationale: String) -> Self {
        Self {
            id: Id::new(),
            run_id,
            phase_id,
            remove_paths,
            rationale,
            status: ApprovalStatus::Pending,
            requires_approval: true,
            auto_apply: false,
            timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            created_at: Utc::now(),
        }
    }

    /// Check whether the proposal may be applied now.
    pub fn ensure_applicable(&self, now: DateTime<Utc>) -> Result<(), PolicyViolation> {
        let deadline = self.created_at
            + Duration::seconds(i64::try_from(self.timeout_secs).unwrap_or(i64::MAX / 1000));
        let status = if self.status == ApprovalStatus::Pending && now >= deadline {
            ApprovalStatus::Expired
        } else {
            self.status
        };

        let opted_in = self.auto_apply && !self.requires_approval;
        if status == ApprovalStatus::Approved || (opted_in && status == ApprovalStatus::Pending) {
            Ok(())
        } else {
            Err(PolicyViolation::ApprovalRequired {
                kind: "scope reduction proposal",
                id: self.id.to_string(),
                status: status.as_str(),
            })
        }
    }

    /// Apply the reduction to a scope, refusing unless approved or opted in.
    pub fn apply(
        &self,
        scope: &mut crate::scope::ScopeConfig,
        now: DateTime<Utc>,
    ) -> Result<(), PolicyViolation> {
        self.ensure_applicable(now)?;
        let removed: Vec<String> = self
            .remove_paths
            .iter()
            .map(|p| crate::scope::normalize_path(p))
            .collect();
        scope
            .paths
            .retain(|p| !removed.contains(&crate::scope::normalize_path(p)));
        Ok(())
    }
}

/// Externally supplied authorization artifact for risky operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentionAnchor {
    pub anchor_id: String,
    pub parallelism_isolation: bool,
    pub approved_by: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
}

impl IntentionAnchor {
    /// Load an anchor from a YAML (or JSON) file.
    pub fn from_file(path: &Path) -> Result<Self, AnchorError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// Gate for concurrent run execution. Denied by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelismPolicyGate;

impl ParallelismPolicyGate {
    /// Check that `run_count` runs may execute concurrently.
    ///
    /// A single run is exempt; more than one requires an anchor whose
    /// `parallelism_isolation` field is true.
    pub fn check(
        &self,
        run_count: usize,
        anchor: Option<&IntentionAnchor>,
    ) -> Result<(), PolicyViolation> {
        if run_count <= 1 {
            return Ok(());
        }
        match anchor {
            None => Err(PolicyViolation::ParallelismNotAuthorized { run_count }),
            Some(anchor) if !anchor.parallelism_isolation => {
                Err(PolicyViolation::AnchorDeniesParallelism {
                    anchor_id: anchor.anchor_id.clone(),
                })
            }
            Some(_) => Ok(()),
        }
    }
}
