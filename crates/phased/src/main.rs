//! phased - phase execution engine
//!
//! Runs the phases of a manifest through builder, auditor and diagnostics
//! agents, records human decisions on approval requests and scope
//! reductions, or clears stale locks left by a crashed executor.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use eyre::{bail, WrapErr};
use phase_core::{ApprovalStatus, Config, Id, IntentionAnchor, RunManifest};
use phased::executor_lock::ExecutorLockManager;
use phased::lease::WorkspaceLease;
use phased::{command_agents, open_storage, propose_scope_reduction, Executor};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "phased", about = "Phase execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the runs described by a manifest
    Run(RunArgs),
    /// Approve or reject a pending approval request or scope reduction
    Approve(ApproveArgs),
    /// Propose removing paths from a phase's scope (applies once approved)
    ReduceScope(ReduceScopeArgs),
    /// Force-release an executor lock or workspace lease
    Unlock(UnlockArgs),
}

#[derive(Args)]
struct RepoArgs {
    /// Repository the runs operate on
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Config file (defaults to <repo>/.phased/config when present)
    #[arg(long, env = "PHASED_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    repo: RepoArgs,

    /// Run manifest (YAML)
    #[arg(long)]
    manifest: PathBuf,

    /// Intention anchor authorizing parallel runs (YAML)
    #[arg(long)]
    anchor: Option<PathBuf>,
}

#[derive(Args)]
struct ApproveArgs {
    #[command(flatten)]
    repo: RepoArgs,

    /// Id of the approval request or scope-reduction proposal
    #[arg(long)]
    id: String,

    /// Reject instead of approve
    #[arg(long)]
    reject: bool,
}

#[derive(Args)]
struct ReduceScopeArgs {
    #[command(flatten)]
    repo: RepoArgs,

    #[arg(long)]
    run: String,

    #[arg(long)]
    phase: String,

    /// Scope path to remove (repeatable)
    #[arg(long = "remove", required = true)]
    remove: Vec<String>,

    #[arg(long, default_value = "")]
    rationale: String,
}

#[derive(Args)]
struct UnlockArgs {
    #[command(flatten)]
    repo: RepoArgs,

    /// Run id whose executor lock should be released
    #[arg(long, conflicts_with = "workspace", required_unless_present = "workspace")]
    run: Option<String>,

    /// Workspace whose lease should be released
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Command::Run(args) => {
            let success = runtime()?.block_on(run(args))?;
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Approve(args) => runtime()?.block_on(approve(&args)),
        Command::ReduceScope(args) => runtime()?.block_on(reduce_scope(args)),
        Command::Unlock(args) => unlock(&args),
    }
}

fn runtime() -> eyre::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")
}

async fn run(args: RunArgs) -> eyre::Result<bool> {
    let repo = resolve_repo(&args.repo.repo)?;
    let config = load_config(&repo, args.repo.config.as_deref())?;

    let manifest_path = expand_home(&args.manifest);
    let manifest = RunManifest::from_file(&manifest_path)
        .wrap_err_with(|| format!("failed to load manifest {}", manifest_path.display()))?;
    let anchor = match &args.anchor {
        Some(path) => {
            let path = expand_home(path);
            Some(
                IntentionAnchor::from_file(&path)
                    .wrap_err_with(|| format!("failed to load anchor {}", path.display()))?,
            )
        }
        None => None,
    };

    let agents = command_agents(&config)?;
    let executor = Executor::new(&repo, config, agents).await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown requested, canceling active phases");
        signal_cancel.cancel();
    });

    let aggregate = executor
        .execute_manifest(&manifest, anchor.as_ref(), cancel)
        .await?;

    for result in &aggregate.results {
        let state = result.state.as_ref().map_or("not_started", |state| state.as_str());
        match &result.error {
            None => info!(run_id = %result.run_id, state, "run finished"),
            Some(err) => error!(run_id = %result.run_id, state, error = %err, "run failed"),
        }
    }
    Ok(aggregate.all_successful)
}

async fn approve(args: &ApproveArgs) -> eyre::Result<()> {
    let repo = resolve_repo(&args.repo.repo)?;
    let config = load_config(&repo, args.repo.config.as_deref())?;
    let storage = open_storage(&config).await?;

    let status = if args.reject {
        ApprovalStatus::Rejected
    } else {
        ApprovalStatus::Approved
    };
    storage
        .resolve_approval(&Id::from_string(args.id.as_str()), status)
        .await
        .wrap_err_with(|| format!("failed to record decision for {}", args.id))?;
    info!(id = %args.id, status = status.as_str(), "decision recorded");
    Ok(())
}

async fn reduce_scope(args: ReduceScopeArgs) -> eyre::Result<()> {
    let repo = resolve_repo(&args.repo.repo)?;
    let config = load_config(&repo, args.repo.config.as_deref())?;
    let storage = open_storage(&config).await?;

    let proposal = propose_scope_reduction(
        &storage,
        &Id::from_string(args.run),
        &Id::from_string(args.phase),
        args.remove,
        args.rationale,
    )
    .await?;
    info!(id = %proposal.id, "approve with: phased approve --id {}", proposal.id);
    Ok(())
}

fn unlock(args: &UnlockArgs) -> eyre::Result<()> {
    let repo = resolve_repo(&args.repo.repo)?;
    let config = load_config(&repo, args.repo.config.as_deref())?;

    let released = match (&args.run, &args.workspace) {
        (Some(run_id), _) => ExecutorLockManager::new(&config.lock_dir).force_unlock(run_id)?,
        (None, Some(workspace)) => {
            WorkspaceLease::new(&config.lock_dir, &expand_home(workspace)).force_unlock()?
        }
        (None, None) => bail!("either --run or --workspace is required"),
    };
    if released {
        info!("lock released");
    } else {
        warn!("no lock was held");
    }
    Ok(())
}

fn resolve_repo(repo: &Path) -> eyre::Result<PathBuf> {
    let repo = expand_home(repo);
    repo.canonicalize()
        .wrap_err_with(|| format!("repository {} does not exist", repo.display()))
}

/// Load the config file and resolve its paths against `repo`.
fn load_config(repo: &Path, explicit: Option<&Path>) -> eyre::Result<Config> {
    let mut config = Config::default();
    match explicit {
        Some(path) => {
            let path = expand_home(path);
            config
                .load_file(&path)
                .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
        }
        None => {
            let default_path = repo.join(".phased").join("config");
            if default_path.exists() {
                config.load_file(&default_path)?;
            }
        }
    }
    config.resolve_paths(repo);
    Ok(config)
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        warn!("failed to register signal handlers");
        return std::future::pending().await;
    };
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
