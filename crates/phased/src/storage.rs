//! SQLite persistence for runs, phases, events, approval requests and
//! scope-reduction proposals.
//!
//! Phase updates are transactional. Event writes are best-effort from the
//! engine's point of view: see [`Storage::record_event`].

use chrono::{DateTime, Utc};
use phase_core::events::EventPayload;
use phase_core::{
    ApprovalRequest, ApprovalStatus, Id, Phase, PhaseState, Run, RunState, RunType,
    SafetyProfile, ScopeReductionProposal,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

const RUNS_COLUMNS: &str = "id, state, run_type, safety_profile, run_scope, token_cap, \
    high_risk, disabled_providers_json, created_at, updated_at";

const PROPOSALS_COLUMNS: &str = "id, run_id, phase_id, remove_paths_json, rationale, status, \
    requires_approval, auto_apply, timeout_secs, created_at";

const PHASES_COLUMNS: &str = "run_id, id, tier, position, description, state, retry_attempt, \
    max_attempts, scope_json, file_context_json, depends_on_json, last_failure_reason, \
    escalation_level, token_escalations, builder_hint, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("phase not found: {run_id}/{phase_id}")]
    PhaseNotFound { run_id: String, phase_id: String },
    #[error("approval request not found: {0}")]
    ApprovalNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: Id,
    pub run_id: Id,
    pub phase_id: Option<Id>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload_json: String,
}

#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) the database at `db_path` in WAL mode.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migration_sql = include_str!("../../../migrations/0001_init.sql");
        let cleaned: String = migration_sql
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");

        for statement in cleaned.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    // --- Runs ---

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO runs (id, state, run_type, safety_profile, run_scope, token_cap,
                              high_risk, disabled_providers_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(run.id.as_ref())
        .bind(run.state.as_str())
        .bind(run.run_type.as_str())
        .bind(run.safety_profile.as_str())
        .bind(&run.run_scope)
        .bind(i64::try_from(run.token_cap).unwrap_or(i64::MAX))
        .bind(run.high_risk)
        .bind(serde_json::to_string(&run.disabled_providers)?)
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        row.into_run()
    }

    /// Persist the mutable run fields (state, risk flag, disabled providers).
    pub async fn update_run(&self, run: &Run) -> Result<()> {
        let result = sqlx::query(
            "UPDATE runs SET state = ?1, high_risk = ?2, disabled_providers_json = ?3, updated_at = ?4 \
             WHERE id = ?5",
        )
        .bind(run.state.as_str())
        .bind(run.high_risk)
        .bind(serde_json::to_string(&run.disabled_providers)?)
        .bind(Utc::now().timestamp_millis())
        .bind(run.id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run.id.to_string()));
        }
        Ok(())
    }

    // --- Phases ---

    /// Insert all phases of a run in one transaction.
    pub async fn insert_phases(&self, phases: &[Phase]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for phase in phases {
            sqlx::query(
                r"
                INSERT INTO phases (run_id, id, tier, position, description, state, retry_attempt,
                                    max_attempts, scope_json, file_context_json, depends_on_json,
                                    last_failure_reason, escalation_level, token_escalations,
                                    builder_hint, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                ",
            )
            .bind(phase.run_id.as_ref())
            .bind(phase.id.as_ref())
            .bind(phase.tier)
            .bind(phase.position)
            .bind(&phase.description)
            .bind(phase.state.as_str())
            .bind(phase.retry_attempt)
            .bind(phase.max_attempts)
            .bind(serde_json::to_string(&phase.scope)?)
            .bind(serde_json::to_string(&phase.file_context)?)
            .bind(serde_json::to_string(&phase.depends_on)?)
            .bind(phase.last_failure_reason.as_deref())
            .bind(phase.escalation_level)
            .bind(phase.token_escalations)
            .bind(phase.builder_hint.as_deref())
            .bind(phase.updated_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Persist a phase's mutable fields, including a narrowed scope. The
    /// transaction rolls back on drop if the phase row is missing.
    pub async fn update_phase(&self, phase: &Phase) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r"
            UPDATE phases SET state = ?1, retry_attempt = ?2, last_failure_reason = ?3,
                              escalation_level = ?4, token_escalations = ?5, builder_hint = ?6,
                              updated_at = ?7, scope_json = ?8
            WHERE run_id = ?9 AND id = ?10
            ",
        )
        .bind(phase.state.as_str())
        .bind(phase.retry_attempt)
        .bind(phase.last_failure_reason.as_deref())
        .bind(phase.escalation_level)
        .bind(phase.token_escalations)
        .bind(phase.builder_hint.as_deref())
        .bind(phase.updated_at.timestamp_millis())
        .bind(serde_json::to_string(&phase.scope)?)
        .bind(phase.run_id.as_ref())
        .bind(phase.id.as_ref())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::PhaseNotFound {
                run_id: phase.run_id.to_string(),
                phase_id: phase.id.to_string(),
            });
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_phase(&self, run_id: &Id, phase_id: &Id) -> Result<Phase> {
        let query = format!("SELECT {PHASES_COLUMNS} FROM phases WHERE run_id = ?1 AND id = ?2");
        let row = sqlx::query_as::<_, PhaseRow>(&query)
            .bind(run_id.as_ref())
            .bind(phase_id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::PhaseNotFound {
                run_id: run_id.to_string(),
                phase_id: phase_id.to_string(),
            })?;
        row.into_phase()
    }

    /// Phases of a run in declared order.
    pub async fn list_phases(&self, run_id: &Id) -> Result<Vec<Phase>> {
        let query =
            format!("SELECT {PHASES_COLUMNS} FROM phases WHERE run_id = ?1 ORDER BY position ASC");
        let rows = sqlx::query_as::<_, PhaseRow>(&query)
            .bind(run_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PhaseRow::into_phase).collect()
    }

    // --- Events ---

    pub async fn append_event(
        &self,
        run_id: &Id,
        phase_id: Option<&Id>,
        payload: &EventPayload,
    ) -> Result<EventRecord> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO events (id, run_id, phase_id, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.as_ref())
        .bind(run_id.as_ref())
        .bind(phase_id.map(AsRef::as_ref))
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(EventRecord {
            id,
            run_id: run_id.clone(),
            phase_id: phase_id.cloned(),
            event_type,
            timestamp: now,
            payload_json,
        })
    }

    /// Append an event, logging instead of failing when the write fails.
    pub async fn record_event(&self, run_id: &Id, phase_id: Option<&Id>, payload: EventPayload) {
        if let Err(err) = self.append_event(run_id, phase_id, &payload).await {
            tracing::warn!(
                run_id = %run_id,
                event_type = payload.event_type().as_str(),
                error = %err,
                "failed to record event"
            );
        }
    }

    pub async fn list_events(&self, run_id: &Id) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, run_id, phase_id, type, ts, payload_json FROM events WHERE run_id = ?1 ORDER BY ts ASC, id ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    // --- Approval requests ---

    pub async fn insert_approval(&self, request: &ApprovalRequest) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO approval_requests (id, run_id, phase_id, reason, status, requires_approval,
                                           timeout_secs, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(request.id.as_ref())
        .bind(request.run_id.as_ref())
        .bind(request.phase_id.as_ref())
        .bind(&request.reason)
        .bind(request.status.as_str())
        .bind(request.requires_approval)
        .bind(i64::try_from(request.timeout_secs).unwrap_or(i64::MAX))
        .bind(request.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_approval_status(&self, id: &Id, status: ApprovalStatus) -> Result<()> {
        let result = sqlx::query("UPDATE approval_requests SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ApprovalNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn list_approvals(&self, run_id: &Id) -> Result<Vec<ApprovalRequest>> {
        let rows = sqlx::query_as::<_, ApprovalRow>(
            "SELECT id, run_id, phase_id, reason, status, requires_approval, timeout_secs, created_at \
             FROM approval_requests WHERE run_id = ?1 ORDER BY created_at ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApprovalRow::into_request).collect())
    }

    // --- Scope reduction proposals ---

    pub async fn insert_scope_proposal(&self, proposal: &ScopeReductionProposal) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO scope_reduction_proposals (id, run_id, phase_id, remove_paths_json,
                                                   rationale, status, requires_approval,
                                                   auto_apply, timeout_secs, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(proposal.id.as_ref())
        .bind(proposal.run_id.as_ref())
        .bind(proposal.phase_id.as_ref())
        .bind(serde_json::to_string(&proposal.remove_paths)?)
        .bind(&proposal.rationale)
        .bind(proposal.status.as_str())
        .bind(proposal.requires_approval)
        .bind(proposal.auto_apply)
        .bind(i64::try_from(proposal.timeout_secs).unwrap_or(i64::MAX))
        .bind(proposal.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_scope_proposal_status(&self, id: &Id, status: ApprovalStatus) -> Result<()> {
        let result = sqlx::query("UPDATE scope_reduction_proposals SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ApprovalNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Proposals for a run, oldest first.
    pub async fn list_scope_proposals(&self, run_id: &Id) -> Result<Vec<ScopeReductionProposal>> {
        let query = format!(
            "SELECT {PROPOSALS_COLUMNS} FROM scope_reduction_proposals WHERE run_id = ?1 \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, ProposalRow>(&query)
            .bind(run_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ProposalRow::into_proposal).collect()
    }

    /// Record a human decision on an approval request or a scope-reduction
    /// proposal, whichever `id` names.
    pub async fn resolve_approval(&self, id: &Id, status: ApprovalStatus) -> Result<()> {
        match self.update_approval_status(id, status).await {
            Err(StorageError::ApprovalNotFound(_)) => {
                self.update_scope_proposal_status(id, status).await
            }
            other => other,
        }
    }
}

// --- Row types for SQLx ---

fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    state: String,
    run_type: String,
    safety_profile: String,
    run_scope: String,
    token_cap: i64,
    high_risk: bool,
    disabled_providers_json: String,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: Id::from_string(self.id),
            state: RunState::parse(&self.state).unwrap_or(RunState::Failed),
            run_type: RunType::parse(&self.run_type).unwrap_or_default(),
            safety_profile: SafetyProfile::parse(&self.safety_profile)
                .unwrap_or(SafetyProfile::Strict),
            run_scope: self.run_scope,
            token_cap: u64::try_from(self.token_cap).unwrap_or(0),
            high_risk: self.high_risk,
            disabled_providers: serde_json::from_str(&self.disabled_providers_json)?,
            created_at: timestamp(self.created_at),
            updated_at: timestamp(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct PhaseRow {
    run_id: String,
    id: String,
    tier: i64,
    position: i64,
    description: String,
    state: String,
    retry_attempt: i64,
    max_attempts: i64,
    scope_json: String,
    file_context_json: String,
    depends_on_json: String,
    last_failure_reason: Option<String>,
    escalation_level: i64,
    token_escalations: i64,
    builder_hint: Option<String>,
    updated_at: i64,
}

impl PhaseRow {
    fn into_phase(self) -> Result<Phase> {
        Ok(Phase {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            tier: self.tier as u32,
            position: self.position as u32,
            description: self.description,
            state: PhaseState::parse(&self.state).unwrap_or(PhaseState::Failed),
            retry_attempt: self.retry_attempt as u32,
            max_attempts: self.max_attempts as u32,
            scope: serde_json::from_str(&self.scope_json)?,
            file_context: serde_json::from_str(&self.file_context_json)?,
            depends_on: serde_json::from_str(&self.depends_on_json)?,
            last_failure_reason: self.last_failure_reason,
            escalation_level: self.escalation_level as u32,
            token_escalations: self.token_escalations as u32,
            builder_hint: self.builder_hint,
            updated_at: timestamp(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    run_id: String,
    phase_id: Option<String>,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> EventRecord {
        EventRecord {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            phase_id: self.phase_id.map(Id::from_string),
            event_type: self.event_type,
            timestamp: timestamp(self.ts),
            payload_json: self.payload_json,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: String,
    run_id: String,
    phase_id: String,
    reason: String,
    status: String,
    requires_approval: bool,
    timeout_secs: i64,
    created_at: i64,
}

impl ApprovalRow {
    fn into_request(self) -> ApprovalRequest {
        ApprovalRequest {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            phase_id: Id::from_string(self.phase_id),
            reason: self.reason,
            status: ApprovalStatus::parse(&self.status).unwrap_or(ApprovalStatus::Pending),
            requires_approval: self.requires_approval,
            timeout_secs: u64::try_from(self.timeout_secs).unwrap_or(0),
            created_at: timestamp(self.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProposalRow {
    id: String,
    run_id: String,
    phase_id: String,
    remove_paths_json: String,
    rationale: String,
    status: String,
    requires_approval: bool,
    auto_apply: bool,
    timeout_secs: i64,
    created_at: i64,
}

impl ProposalRow {
    fn into_proposal(self) -> Result<ScopeReductionProposal> {
        Ok(ScopeReductionProposal {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            phase_id: Id::from_string(self.phase_id),
            remove_paths: serde_json::from_str(&self.remove_paths_json)?,
            rationale: self.rationale,
            status: ApprovalStatus::parse(&self.status).unwrap_or(ApprovalStatus::Pending),
            requires_approval: self.requires_approval,
            auto_apply: self.auto_apply,
            timeout_secs: u64::try_from(self.timeout_secs).unwrap_or(0),
            created_at: timestamp(self.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phase_core::events::{PhaseStartedPayload, RunStartedPayload};
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir,
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn create_test_run() -> (Run, Vec<Phase>) {
        let run = Run::new(Id::new(), RunType::Maintenance);
        let mut first = Phase::new(run.id.clone(), "models", 3);
        first.scope.paths = vec!["src/models/".to_string()];
        first.file_context = vec!["src/models/user.rs".to_string()];
        let mut second = Phase::new(run.id.clone(), "handlers", 3);
        second.position = 1;
        second.depends_on = vec!["models".to_string()];
        (run, vec![first, second])
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();
    }

    #[tokio::test]
    async fn insert_and_get_run() {
        let ts = create_test_storage().await;
        let (mut run, _) = create_test_run();
        ts.storage.insert_run(&run).await.unwrap();

        let loaded = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.state, RunState::Pending);
        assert_eq!(loaded.run_type, RunType::Maintenance);
        assert_eq!(loaded.token_cap, run.token_cap);

        run.state = RunState::Completed;
        run.high_risk = true;
        run.disabled_providers = vec!["openai".to_string()];
        ts.storage.update_run(&run).await.unwrap();
        let loaded = ts.storage.get_run(&run.id).await.unwrap();
        assert_eq!(loaded.state, RunState::Completed);
        assert!(loaded.high_risk);
        assert_eq!(loaded.disabled_providers, vec!["openai"]);
    }

    #[tokio::test]
    async fn missing_run_is_reported() {
        let ts = create_test_storage().await;
        assert!(matches!(
            ts.storage.get_run(&Id::new()).await,
            Err(StorageError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn phases_roundtrip_in_order() {
        let ts = create_test_storage().await;
        let (run, phases) = create_test_run();
        ts.storage.insert_run(&run).await.unwrap();
        ts.storage.insert_phases(&phases).await.unwrap();

        let loaded = ts.storage.list_phases(&run.id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id.0, "models");
        assert_eq!(loaded[0].scope, phases[0].scope);
        assert_eq!(loaded[0].file_context, phases[0].file_context);
        assert_eq!(loaded[1].depends_on, vec!["models"]);
    }

    #[tokio::test]
    async fn update_phase_persists_progress() {
        let ts = create_test_storage().await;
        let (run, mut phases) = create_test_run();
        ts.storage.insert_run(&run).await.unwrap();
        ts.storage.insert_phases(&phases).await.unwrap();

        let phase = &mut phases[0];
        phase.retry_attempt = 2;
        phase.token_escalations = 1;
        phase.builder_hint = Some("check imports".to_string());
        phase.scope.paths.push("src/schema.rs".to_string());
        phase.mark_failed("max attempts exhausted");
        ts.storage.update_phase(phase).await.unwrap();

        let loaded = ts.storage.get_phase(&run.id, &phase.id).await.unwrap();
        assert_eq!(loaded.state, PhaseState::Failed);
        assert_eq!(loaded.retry_attempt, 2);
        assert_eq!(loaded.token_escalations, 1);
        assert_eq!(loaded.builder_hint.as_deref(), Some("check imports"));
        assert_eq!(loaded.scope.paths, vec!["src/models/", "src/schema.rs"]);
        assert_eq!(
            loaded.last_failure_reason.as_deref(),
            Some("max attempts exhausted")
        );

        let ghost = Phase::new(run.id.clone(), "ghost", 3);
        assert!(matches!(
            ts.storage.update_phase(&ghost).await,
            Err(StorageError::PhaseNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn events_are_appended_in_order() {
        let ts = create_test_storage().await;
        let (run, phases) = create_test_run();
        ts.storage.insert_run(&run).await.unwrap();

        ts.storage
            .record_event(
                &run.id,
                None,
                EventPayload::RunStarted(RunStartedPayload {
                    run_id: run.id.clone(),
                    run_type: "maintenance".to_string(),
                    phase_count: 2,
                }),
            )
            .await;
        ts.storage
            .append_event(
                &run.id,
                Some(&phases[0].id),
                &EventPayload::PhaseStarted(PhaseStartedPayload {
                    phase_id: phases[0].id.clone(),
                    retry_attempt: 0,
                    max_attempts: 3,
                }),
            )
            .await
            .unwrap();

        let events = ts.storage.list_events(&run.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "RUN_STARTED");
        assert_eq!(events[1].event_type, "PHASE_STARTED");
        assert_eq!(events[1].phase_id.as_ref(), Some(&phases[0].id));
    }

    #[tokio::test]
    async fn approvals_roundtrip() {
        let ts = create_test_storage().await;
        let (run, phases) = create_test_run();
        ts.storage.insert_run(&run).await.unwrap();

        let request = ApprovalRequest::new(run.id.clone(), phases[0].id.clone(), "touches billing");
        ts.storage.insert_approval(&request).await.unwrap();
        ts.storage
            .update_approval_status(&request.id, ApprovalStatus::Approved)
            .await
            .unwrap();

        let approvals = ts.storage.list_approvals(&run.id).await.unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].status, ApprovalStatus::Approved);
        assert!(approvals[0].requires_approval);
        assert_eq!(approvals[0].reason, "touches billing");
    }

    #[tokio::test]
    async fn resolving_an_id_reaches_approvals_and_proposals() {
        let ts = create_test_storage().await;
        let (run, phases) = create_test_run();
        ts.storage.insert_run(&run).await.unwrap();

        let request = ApprovalRequest::new(run.id.clone(), phases[0].id.clone(), "touches billing");
        ts.storage.insert_approval(&request).await.unwrap();
        let proposal = ScopeReductionProposal::new(
            run.id.clone(),
            phases[0].id.clone(),
            vec!["src/models/legacy.rs".to_string()],
            "cannot migrate the legacy model".to_string(),
        );
        ts.storage.insert_scope_proposal(&proposal).await.unwrap();

        ts.storage
            .resolve_approval(&request.id, ApprovalStatus::Rejected)
            .await
            .unwrap();
        ts.storage
            .resolve_approval(&proposal.id, ApprovalStatus::Approved)
            .await
            .unwrap();

        let approvals = ts.storage.list_approvals(&run.id).await.unwrap();
        assert_eq!(approvals[0].status, ApprovalStatus::Rejected);
        let proposals = ts.storage.list_scope_proposals(&run.id).await.unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].status, ApprovalStatus::Approved);
        assert_eq!(proposals[0].remove_paths, vec!["src/models/legacy.rs"]);
        assert!(!proposals[0].auto_apply);

        assert!(matches!(
            ts.storage.resolve_approval(&Id::new(), ApprovalStatus::Approved).await,
            Err(StorageError::ApprovalNotFound(_))
        ));
    }
}
