//! Configuration parsing for the phase executor.
//!
//! Uses the key=value format of `.phased/config`.
//! Precedence: CLI flags > `--config` file > `.phased/config` > defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Default location of the per-workspace config file.
pub const DEFAULT_CONFIG_PATH: &str = ".phased/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Attempts and timeouts
    pub max_attempts: u32,
    pub builder_timeout_sec: u64,
    pub doctor_timeout_sec: u64,
    pub fix_command_timeout_sec: u64,
    /// Output-token budget of the first builder call; doubled per token escalation.
    pub base_output_tokens: u64,

    // Diagnostics budgets
    /// Builder attempts a non-infra failure needs before diagnostics may run.
    pub doctor_min_builder_attempts: u32,
    pub doctor_max_calls_per_phase: u32,
    pub doctor_max_calls_per_run: u32,
    pub doctor_max_strong_calls_per_run: u32,
    pub doctor_max_infra_calls_per_run: u32,
    pub execute_fix_max_per_phase: u32,

    // Isolation
    pub parallel_max_workers: usize,
    pub lock_dir: PathBuf,
    pub worktree_root: PathBuf,
    pub run_branch_prefix: String,
    pub base_branch: Option<String>,
    /// Remove the run worktree after a parallel run finishes.
    pub worktree_cleanup: bool,
    /// Glob-like patterns a safe rollback must never delete.
    pub protected_paths: Vec<String>,

    // Agent commands
    pub builder_cmd: Option<String>,
    pub auditor_cmd: Option<String>,
    pub doctor_cmd: Option<String>,

    // Storage
    pub db_path: PathBuf,
}

/// Protected patterns used when `protected_paths` is not configured.
pub fn default_protected_paths() -> Vec<String> {
    [
        ".env",
        ".env.*",
        "*.pem",
        "*.key",
        "credentials*",
        "*.db",
        "*.sqlite",
        "*.sqlite3",
        ".phased/",
        "logs/",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            builder_timeout_sec: 900,
            doctor_timeout_sec: 120,
            fix_command_timeout_sec: 120,
            base_output_tokens: 8_000,
            doctor_min_builder_attempts: 1,
            doctor_max_calls_per_phase: 2,
            doctor_max_calls_per_run: 10,
            doctor_max_strong_calls_per_run: 5,
            doctor_max_infra_calls_per_run: 3,
            execute_fix_max_per_phase: 1,
            parallel_max_workers: 4,
            lock_dir: PathBuf::from(".phased/locks"),
            worktree_root: PathBuf::from(".phased/worktrees"),
            run_branch_prefix: "run/".to_string(),
            base_branch: None,
            worktree_cleanup: true,
            protected_paths: default_protected_paths(),
            builder_cmd: None,
            auditor_cmd: None,
            doctor_cmd: None,
            db_path: PathBuf::from(".phased/phased.db"),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_attempts" => self.max_attempts = Self::parse_int(key, value)?,
            "builder_timeout_sec" => self.builder_timeout_sec = Self::parse_int(key, value)?,
            "doctor_timeout_sec" => self.doctor_timeout_sec = Self::parse_int(key, value)?,
            "fix_command_timeout_sec" => {
                self.fix_command_timeout_sec = Self::parse_int(key, value)?;
            }
            "base_output_tokens" => self.base_output_tokens = Self::parse_int(key, value)?,
            "doctor_min_builder_attempts" => {
                self.doctor_min_builder_attempts = Self::parse_int(key, value)?;
            }
            "doctor_max_calls_per_phase" => {
                self.doctor_max_calls_per_phase = Self::parse_int(key, value)?;
            }
            "doctor_max_calls_per_run" => {
                self.doctor_max_calls_per_run = Self::parse_int(key, value)?;
            }
            "doctor_max_strong_calls_per_run" => {
                self.doctor_max_strong_calls_per_run = Self::parse_int(key, value)?;
            }
            "doctor_max_infra_calls_per_run" => {
                self.doctor_max_infra_calls_per_run = Self::parse_int(key, value)?;
            }
            "execute_fix_max_per_phase" => {
                self.execute_fix_max_per_phase = Self::parse_int(key, value)?;
            }
            "parallel_max_workers" => self.parallel_max_workers = Self::parse_int(key, value)?,
            "lock_dir" => self.lock_dir = PathBuf::from(value),
            "worktree_root" => self.worktree_root = PathBuf::from(value),
            "run_branch_prefix" => self.run_branch_prefix = value.to_string(),
            "base_branch" => self.base_branch = Self::optional(value),
            "worktree_cleanup" => self.worktree_cleanup = Self::parse_bool(key, value)?,
            "protected_paths" => {
                self.protected_paths = value.split_whitespace().map(ToString::to_string).collect();
            }
            "builder_cmd" => self.builder_cmd = Self::optional(value),
            "auditor_cmd" => self.auditor_cmd = Self::optional(value),
            "doctor_cmd" => self.doctor_cmd = Self::optional(value),
            "db_path" => self.db_path = PathBuf::from(value),
            _ => {
                // Warn but don't fail for unknown keys
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn optional(value: &str) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.lock_dir.is_relative() {
            self.lock_dir = workspace_root.join(&self.lock_dir);
        }
        if self.worktree_root.is_relative() {
            self.worktree_root = workspace_root.join(&self.worktree_root);
        }
        if self.db_path.is_relative() {
            self.db_path = workspace_root.join(&self.db_path);
        }
    }
}
