pub mod completion;
pub mod config;
pub mod events;
pub mod governance;
pub mod manifest;
pub mod policy;
pub mod scope;
pub mod types;

pub use config::Config;
pub use governance::{
    ApprovalRequest, ApprovalStatus, IntentionAnchor, ParallelismPolicyGate, PolicyViolation,
    ScopeReductionProposal,
};
pub use manifest::RunManifest;
pub use policy::{next_attempt_state, AttemptContext, AttemptDecision};
pub use scope::{ScopeConfig, ScopeError};
pub use types::*;
