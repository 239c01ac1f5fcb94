//! Run manifests: YAML documents declaring runs and their phases.
//!
//! ```yaml
//! runs:
//!   - run_id: feature-auth
//!     run_type: project_build
//!     phases:
//!       - phase_id: models
//!         scope: { paths: [src/models/] }
//!         file_context: [src/models/user.rs]
//!       - phase_id: handlers
//!         depends_on: [models]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

use crate::scope::ScopeConfig;
use crate::types::{Id, Phase, Run, RunType, SafetyProfile};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("manifest declares no runs")]
    Empty,
    #[error("run at index {0} has an empty run_id")]
    EmptyRunId(usize),
    #[error("duplicate run_id: {0}")]
    DuplicateRun(String),
    #[error("run {run_id}: phase at index {index} has an empty phase_id")]
    EmptyPhaseId { run_id: String, index: usize },
    #[error("run {run_id}: duplicate phase_id {phase_id}")]
    DuplicatePhase { run_id: String, phase_id: String },
    #[error("run {run_id}: phase {phase_id} depends on {dependency}, which is not declared earlier")]
    UnknownDependency {
        run_id: String,
        phase_id: String,
        dependency: String,
    },
    #[error("run {run_id}: phase {phase_id} (tier {tier}) depends on {dependency} in a later tier")]
    DependencyInLaterTier {
        run_id: String,
        phase_id: String,
        tier: u32,
        dependency: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunManifest {
    pub runs: Vec<RunSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub run_id: String,
    #[serde(default)]
    pub run_type: RunType,
    #[serde(default)]
    pub safety_profile: SafetyProfile,
    #[serde(default)]
    pub run_scope: String,
    #[serde(default)]
    pub token_cap: Option<u64>,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub phase_id: String,
    #[serde(default)]
    pub tier: u32,
    #[serde(default)]
    pub description: String,
    /// Overrides the configured `max_attempts` for this phase.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub file_context: Vec<String>,
}

impl RunManifest {
    /// Load and validate a manifest file.
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate manifest content.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_yaml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.runs.is_empty() {
            return Err(ManifestError::Empty);
        }

        let mut run_ids = HashSet::new();
        for (index, run) in self.runs.iter().enumerate() {
            if run.run_id.trim().is_empty() {
                return Err(ManifestError::EmptyRunId(index));
            }
            if !run_ids.insert(run.run_id.as_str()) {
                return Err(ManifestError::DuplicateRun(run.run_id.clone()));
            }
            run.validate()?;
        }
        Ok(())
    }
}

impl RunSpec {
    fn validate(&self) -> Result<(), ManifestError> {
        let mut seen: HashMap<&str, u32> = HashMap::new();
        for (index, phase) in self.phases.iter().enumerate() {
            if phase.phase_id.trim().is_empty() {
                return Err(ManifestError::EmptyPhaseId {
                    run_id: self.run_id.clone(),
                    index,
                });
            }
            // Dependencies may only point backwards, which also rules out cycles.
            if let Some(dependency) = phase
                .depends_on
                .iter()
                .find(|dep| !seen.contains_key(dep.as_str()))
            {
                return Err(ManifestError::UnknownDependency {
                    run_id: self.run_id.clone(),
                    phase_id: phase.phase_id.clone(),
                    dependency: dependency.clone(),
                });
            }
            if let Some(dependency) = phase
                .depends_on
                .iter()
                .find(|dep| seen.get(dep.as_str()).is_some_and(|tier| *tier > phase.tier))
            {
                return Err(ManifestError::DependencyInLaterTier {
                    run_id: self.run_id.clone(),
                    phase_id: phase.phase_id.clone(),
                    tier: phase.tier,
                    dependency: dependency.clone(),
                });
            }
            if seen.insert(phase.phase_id.as_str(), phase.tier).is_some() {
                return Err(ManifestError::DuplicatePhase {
                    run_id: self.run_id.clone(),
                    phase_id: phase.phase_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Build the run and its phases in declared order.
    ///
    /// Phases are ordered by tier first; declared order is kept within a tier.
    pub fn to_records(&self, default_max_attempts: u32) -> (Run, Vec<Phase>) {
        let mut run = Run::new(Id::from_string(&self.run_id), self.run_type);
        run.safety_profile = self.safety_profile;
        run.run_scope.clone_from(&self.run_scope);
        if let Some(cap) = self.token_cap {
            run.token_cap = cap;
        }

        let mut specs: Vec<&PhaseSpec> = self.phases.iter().collect();
        specs.sort_by_key(|spec| spec.tier);

        let phases = specs
            .into_iter()
            .enumerate()
            .map(|(position, spec)| {
                let mut phase = Phase::new(
                    run.id.clone(),
                    &spec.phase_id,
                    spec.max_attempts.unwrap_or(default_max_attempts),
                );
                phase.tier = spec.tier;
                phase.position = position as u32;
                phase.description.clone_from(&spec.description);
                phase.scope = spec.scope.clone();
                phase.file_context.clone_from(&spec.file_context);
                phase.depends_on.clone_from(&spec.depends_on);
                phase
            })
            .collect();

        (run, phases)
    }
}
