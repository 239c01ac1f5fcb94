//! Execute-fix handler.
//!
//! Runs a small, validated set of commands recommended by diagnostics.
//! Commands are split into argument vectors and executed without a shell;
//! anything that looks like shell syntax, privilege escalation or a
//! destructive git operation is rejected before execution.

use phase_core::{Phase, Run, RunType, SafetyProfile};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::doctor::DoctorResponse;
use crate::rollback::{RollbackError, RollbackManager};
use crate::runner::{run_command, split_args, CommandSpec, RunnerError};

/// Shell metacharacters that are never allowed in a fix command.
const BANNED_METACHARACTERS: &[&str] = &[";", "|", "&", "`", "$(", "${", ">", "<", "\n", "\r"];

/// Command prefixes that are never allowed.
const BANNED_PREFIXES: &[&str] = &[
    "sudo",
    "su",
    "doas",
    "pkexec",
    "chmod 777",
    "chown",
    "rm -rf /",
    "mkfs",
    "dd",
    "shutdown",
    "reboot",
];

/// Git subcommands (with required flags) a git fix may run.
const GIT_ALLOWLIST: &[&[&str]] = &[
    &["status"],
    &["checkout"],
    &["reset", "--hard"],
    &["stash"],
    &["restore"],
    &["diff"],
    &["clean", "-fd"],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    #[default]
    Command,
    Git,
}

impl FixType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Git => "git",
        }
    }
}

/// A fix proposed by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixSpec {
    #[serde(default)]
    pub fix_type: FixType,
    pub commands: Vec<String>,
    /// Run after the fix; a non-zero exit fails the fix.
    #[serde(default)]
    pub verify_command: Option<String>,
}

#[derive(Debug, Error)]
pub enum FixError {
    #[error("diagnostics response carries no fix")]
    MissingFix,
    #[error("fix has no commands")]
    NoCommands,
    #[error("automated fixes are disabled by the strict safety profile")]
    StrictProfile,
    #[error("execute-fix limit of {limit} reached for phase {phase_id}")]
    LimitExceeded { phase_id: String, limit: u32 },
    #[error("command contains banned metacharacter {token:?}: {command}")]
    BannedMetacharacter { command: String, token: &'static str },
    #[error("command uses banned prefix {prefix:?}: {command}")]
    BannedPrefix { command: String, prefix: &'static str },
    #[error("git subcommand not allowed: {0}")]
    GitNotAllowed(String),
    #[error("git fixes are not allowed for project_build runs: {0}")]
    GitBlockedForProjectBuild(String),
    #[error("git fix must only run git commands: {0}")]
    NotGitCommand(String),
    #[error("could not parse command: {0}")]
    Parse(#[source] RunnerError),
    #[error("command {command} failed: {source}")]
    Execution {
        command: String,
        #[source]
        source: RunnerError,
    },
    #[error("command {command} exited with code {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },
    #[error("verification {command} exited with code {exit_code}")]
    VerifyFailed { command: String, exit_code: i32 },
    #[error("savepoint before fix failed: {0}")]
    Savepoint(#[from] RollbackError),
}

pub type Result<T> = std::result::Result<T, FixError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixOutcome {
    /// Human-readable description of what happened.
    pub action_taken: String,
    pub should_continue_retry: bool,
}

/// Reject shell syntax and banned prefixes. Returns the argument vector.
pub fn validate_command(command: &str) -> Result<Vec<String>> {
    if let Some(token) = BANNED_METACHARACTERS
        .iter()
        .copied()
        .find(|token| command.contains(token))
    {
        return Err(FixError::BannedMetacharacter {
            command: command.to_string(),
            token,
        });
    }

    let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");
    let lowered = normalized.to_lowercase();
    if let Some(prefix) = BANNED_PREFIXES
        .iter()
        .copied()
        .find(|prefix| has_prefix(&lowered, prefix))
    {
        return Err(FixError::BannedPrefix {
            command: command.to_string(),
            prefix,
        });
    }

    split_args(command).map_err(FixError::Parse)
}

/// `prefix` at the start of `command`, ending on a word boundary unless the
/// prefix itself ends in `/`.
fn has_prefix(command: &str, prefix: &str) -> bool {
    let Some(rest) = command.strip_prefix(prefix) else {
        return false;
    };
    prefix.ends_with('/') || !rest.starts_with(|c: char| c.is_ascii_alphanumeric())
}

/// Check a git command against the allowlist and the run type.
pub fn validate_git_command(argv: &[String], run_type: RunType) -> Result<()> {
    let command = argv.join(" ");
    if argv.first().map(String::as_str) != Some("git") {
        return Err(FixError::NotGitCommand(command));
    }
    if run_type == RunType::ProjectBuild {
        return Err(FixError::GitBlockedForProjectBuild(command));
    }
    let args = &argv[1..];
    let allowed = GIT_ALLOWLIST.iter().any(|allowed| {
        args.len() >= allowed.len() && allowed.iter().zip(args).all(|(want, got)| want == got)
    });
    if allowed {
        Ok(())
    } else {
        Err(FixError::GitNotAllowed(command))
    }
}

/// Validate every command of a fix, returning their argument vectors.
pub fn validate_fix(fix: &FixSpec, run_type: RunType) -> Result<Vec<Vec<String>>> {
    if fix.commands.is_empty() {
        return Err(FixError::NoCommands);
    }
    let mut validated = Vec::with_capacity(fix.commands.len() + 1);
    for command in fix.commands.iter().chain(fix.verify_command.iter()) {
        let argv = validate_command(command)?;
        // A git invocation is held to the git rules whatever the declared type.
        if fix.fix_type == FixType::Git || argv[0] == "git" {
            validate_git_command(&argv, run_type)?;
        }
        validated.push(argv);
    }
    Ok(validated)
}

#[derive(Debug)]
pub struct ExecuteFixHandler {
    max_per_phase: u32,
    command_timeout: Duration,
    executions: HashMap<String, u32>,
}

impl ExecuteFixHandler {
    pub fn new(max_per_phase: u32, command_timeout: Duration) -> Self {
        Self {
            max_per_phase,
            command_timeout,
            executions: HashMap::new(),
        }
    }

    pub fn executions(&self, phase_id: &str) -> u32 {
        self.executions.get(phase_id).copied().unwrap_or(0)
    }

    /// Validate and run the fix in `response`.
    ///
    /// Any failure marks the phase FAILED with the reason and stops retries.
    pub async fn execute_fix(
        &mut self,
        run: &Run,
        phase: &mut Phase,
        response: &DoctorResponse,
        rollback: &RollbackManager,
        cancel: &CancellationToken,
    ) -> FixOutcome {
        match self.try_execute(run, phase, response, rollback, cancel).await {
            Ok(count) => {
                let action_taken = format!("executed {count} fix command(s)");
                tracing::info!(run_id = %run.id, phase_id = %phase.id, count, "fix applied");
                FixOutcome {
                    action_taken,
                    should_continue_retry: true,
                }
            }
            Err(err) => {
                let reason = format!("execute_fix failed: {err}");
                tracing::warn!(run_id = %run.id, phase_id = %phase.id, error = %err, "fix rejected or failed");
                phase.mark_failed(&reason);
                FixOutcome {
                    action_taken: reason,
                    should_continue_retry: false,
                }
            }
        }
    }

    async fn try_execute(
        &mut self,
        run: &Run,
        phase: &Phase,
        response: &DoctorResponse,
        rollback: &RollbackManager,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if run.safety_profile == SafetyProfile::Strict {
            return Err(FixError::StrictProfile);
        }
        let fix = response.fix.as_ref().ok_or(FixError::MissingFix)?;

        let used = self.executions.entry(phase.id.0.clone()).or_insert(0);
        if *used >= self.max_per_phase {
            return Err(FixError::LimitExceeded {
                phase_id: phase.id.to_string(),
                limit: self.max_per_phase,
            });
        }
        *used += 1;

        let mut commands = validate_fix(fix, run.run_type)?;
        let verify = fix.verify_command.as_ref().and_then(|_| commands.pop());

        rollback.create_savepoint(&format!("{}-fix", phase.id))?;

        let workspace = rollback.workspace();
        for argv in &commands {
            let output = self.run(argv, workspace, cancel).await?;
            if !output.success() {
                return Err(FixError::CommandFailed {
                    command: argv.join(" "),
                    exit_code: output.exit_code,
                });
            }
        }

        if let Some(argv) = verify {
            let output = self.run(&argv, workspace, cancel).await?;
            if !output.success() {
                return Err(FixError::VerifyFailed {
                    command: argv.join(" "),
                    exit_code: output.exit_code,
                });
            }
        }
        Ok(commands.len())
    }

    async fn run(
        &self,
        argv: &[String],
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<crate::runner::CommandOutput> {
        let spec = CommandSpec::new(argv.to_vec(), workspace, self.command_timeout);
        tracing::debug!(command = %spec.display(), "running fix command");
        run_command(&spec, cancel)
            .await
            .map_err(|source| FixError::Execution {
                command: spec.display(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctor::DoctorAction;
    use crate::git::tests::setup_test_repo;
    use phase_core::{Id, PhaseState};

    fn command_fix(commands: &[&str]) -> FixSpec {
        FixSpec {
            fix_type: FixType::Command,
            commands: commands.iter().map(ToString::to_string).collect(),
            verify_command: None,
        }
    }

    fn response(fix: FixSpec) -> DoctorResponse {
        DoctorResponse {
            action: DoctorAction::ExecuteFix,
            rationale: "stale build output".to_string(),
            hint: None,
            fix: Some(fix),
            provider: None,
        }
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for command in [
            "rm a; rm b",
            "cat x | sh",
            "make && make install",
            "echo `id`",
            "echo $(id)",
            "echo ${HOME}",
            "echo x > out",
            "sort < in",
            "echo a\necho b",
        ] {
            assert!(
                matches!(validate_command(command), Err(FixError::BannedMetacharacter { .. })),
                "{command}"
            );
        }
    }

    #[test]
    fn rejects_banned_prefixes() {
        for command in [
            "sudo rm x",
            "su root",
            "doas ls",
            "pkexec ls",
            "chmod 777 file",
            "chown me file",
            "rm -rf /",
            "rm  -rf /usr",
            "mkfs.ext4 /dev/sda",
            "dd if=/dev/zero of=x",
            "SHUTDOWN now",
            "reboot",
        ] {
            assert!(
                matches!(validate_command(command), Err(FixError::BannedPrefix { .. })),
                "{command}"
            );
        }
        assert!(validate_command("rm -rf build").is_ok());
        assert!(validate_command("summary --all").is_ok());
        assert!(validate_command("cargo clean").is_ok());
        assert!(validate_command("ddtrace-run pytest").is_ok());
    }

    #[test]
    fn git_allowlist() {
        let check = |command: &str| {
            validate_git_command(&split_args(command).unwrap(), RunType::Maintenance)
        };
        assert!(check("git status").is_ok());
        assert!(check("git checkout -- src/lib.rs").is_ok());
        assert!(check("git reset --hard HEAD").is_ok());
        assert!(check("git clean -fd").is_ok());
        assert!(matches!(check("git reset --soft HEAD~1"), Err(FixError::GitNotAllowed(_))));
        assert!(matches!(check("git push --force"), Err(FixError::GitNotAllowed(_))));
        assert!(matches!(check("git rebase main"), Err(FixError::GitNotAllowed(_))));
        assert!(matches!(check("git commit -m x"), Err(FixError::GitNotAllowed(_))));
        assert!(matches!(check("ls"), Err(FixError::NotGitCommand(_))));
    }

    #[test]
    fn git_fixes_are_blocked_for_project_builds() {
        let fix = FixSpec {
            fix_type: FixType::Git,
            commands: vec!["git status".to_string()],
            verify_command: None,
        };
        assert!(matches!(
            validate_fix(&fix, RunType::ProjectBuild),
            Err(FixError::GitBlockedForProjectBuild(_))
        ));
        assert!(validate_fix(&fix, RunType::Maintenance).is_ok());

        // Declaring a git command as a plain command does not bypass the block.
        let sneaky = command_fix(&["git checkout main"]);
        assert!(matches!(
            validate_fix(&sneaky, RunType::ProjectBuild),
            Err(FixError::GitBlockedForProjectBuild(_))
        ));
    }

    #[tokio::test]
    async fn executes_valid_fix_once_per_phase() {
        let repo = setup_test_repo();
        let rollback = RollbackManager::new(repo.path(), "run-1", Vec::new());
        let run = Run::new(Id::from_string("run-1"), RunType::ProjectBuild);
        let mut phase = Phase::new(run.id.clone(), "p1", 3);
        let mut handler = ExecuteFixHandler::new(1, Duration::from_secs(10));

        let mut fix = command_fix(&["touch fixed.txt"]);
        fix.verify_command = Some("test -f fixed.txt".to_string());
        let outcome = handler
            .execute_fix(&run, &mut phase, &response(fix.clone()), &rollback, &CancellationToken::new())
            .await;
        assert!(outcome.should_continue_retry, "{}", outcome.action_taken);
        assert!(repo.path().join("fixed.txt").exists());
        assert_eq!(handler.executions("p1"), 1);

        let outcome = handler
            .execute_fix(&run, &mut phase, &response(fix), &rollback, &CancellationToken::new())
            .await;
        assert!(!outcome.should_continue_retry);
        assert_eq!(phase.state, PhaseState::Failed);
        assert!(phase.last_failure_reason.unwrap().contains("limit"));
    }

    #[tokio::test]
    async fn failed_command_fails_phase() {
        let repo = setup_test_repo();
        let rollback = RollbackManager::new(repo.path(), "run-1", Vec::new());
        let run = Run::new(Id::from_string("run-1"), RunType::Maintenance);
        let mut phase = Phase::new(run.id.clone(), "p1", 3);
        let mut handler = ExecuteFixHandler::new(1, Duration::from_secs(10));

        let outcome = handler
            .execute_fix(&run, &mut phase, &response(command_fix(&["false"])), &rollback, &CancellationToken::new())
            .await;
        assert!(!outcome.should_continue_retry);
        assert_eq!(phase.state, PhaseState::Failed);
    }

    #[tokio::test]
    async fn strict_profile_disables_fixes() {
        let repo = setup_test_repo();
        let rollback = RollbackManager::new(repo.path(), "run-1", Vec::new());
        let mut run = Run::new(Id::from_string("run-1"), RunType::Maintenance);
        run.safety_profile = SafetyProfile::Strict;
        let mut phase = Phase::new(run.id.clone(), "p1", 3);
        let mut handler = ExecuteFixHandler::new(1, Duration::from_secs(10));

        let outcome = handler
            .execute_fix(&run, &mut phase, &response(command_fix(&["touch x"])), &rollback, &CancellationToken::new())
            .await;
        assert!(!outcome.should_continue_retry);
        assert!(!repo.path().join("x").exists());
        assert!(phase.last_failure_reason.unwrap().contains("strict"));
    }
}
