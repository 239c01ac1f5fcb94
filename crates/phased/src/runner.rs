//! Subprocess runner with timeout, cancellation and bounded output.
//!
//! Commands are argument vectors executed directly, never through a shell.
//! A process that outlives its timeout or is cancelled is killed and reaped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout for capturing stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured from each of stdout and stderr.
pub const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("empty command")]
    EmptyCommand,
    #[error("unterminated quote in command: {0}")]
    UnterminatedQuote(String),
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout after {0} seconds")]
    Timeout(u64),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// A command to execute.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub stdin: Option<String>,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    /// Zero disables the timeout.
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            argv,
            cwd: cwd.into(),
            stdin: None,
            env: Vec::new(),
            timeout,
        }
    }

    /// Build from a command line split with [`split_args`].
    pub fn parse(command: &str, cwd: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        Ok(Self::new(split_args(command)?, cwd, timeout))
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Split a command line into arguments.
///
/// Single quotes are literal, double quotes allow `\"` and `\\`, and a
/// backslash outside quotes escapes the next character.
pub fn split_args(command: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(RunnerError::UnterminatedQuote(command.to_string())),
                    }
                }
            }
            '"' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => {
                                return Err(RunnerError::UnterminatedQuote(command.to_string()))
                            }
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(RunnerError::UnterminatedQuote(command.to_string())),
                    }
                }
            }
            '\\' => {
                in_arg = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }
    if in_arg {
        args.push(current);
    }

    if args.is_empty() {
        return Err(RunnerError::EmptyCommand);
    }
    Ok(args)
}

/// Read from an async reader with a maximum byte limit, draining the rest.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

async fn collect(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Run a command to completion, its timeout, or cancellation.
pub async fn run_command(spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err(RunnerError::EmptyCommand);
    };
    if cancel.is_cancelled() {
        return Err(RunnerError::Cancelled);
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %spec.display(), cwd = %spec.cwd.display(), "spawning process");

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RunnerError::NotFound(program.clone())
        } else {
            RunnerError::Io(e)
        }
    })?;

    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            // The child may exit without reading its input.
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let stdout_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

    let started = Instant::now();
    let deadline = if spec.timeout.is_zero() {
        None
    } else {
        Some(tokio::time::Instant::now() + spec.timeout)
    };

    let outcome = tokio::select! {
        result = child.wait() => ProcessOutcome::Completed(result?),
        () = cancel.cancelled() => ProcessOutcome::Cancelled,
        () = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        } => ProcessOutcome::TimedOut,
    };

    if !matches!(outcome, ProcessOutcome::Completed(_)) {
        if let Err(err) = child.kill().await {
            warn!(command = %spec.display(), error = %err, "failed to kill process");
        }
        let _ = child.wait().await;
    }

    let stdout = collect(stdout_task, "stdout").await;
    let stderr = collect(stderr_task, "stderr").await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        ProcessOutcome::TimedOut => {
            info!(command = %spec.display(), duration_ms, "process timed out and was killed");
            Err(RunnerError::Timeout(spec.timeout.as_secs()))
        }
        ProcessOutcome::Cancelled => {
            info!(command = %spec.display(), duration_ms, "process cancelled");
            Err(RunnerError::Cancelled)
        }
        ProcessOutcome::Completed(status) => {
            let exit_code = status.code().unwrap_or(-1);
            debug!(command = %spec.display(), exit_code, duration_ms, "process finished");
            Ok(CommandOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                duration_ms,
            })
        }
    }
}
