//! CLI/RPC Surface (C12): the command tree of spec §6.1.
//!
//! Generalizes the teacher's `Cli`/`Commands` split (top-level `clap::Parser`
//! delegating to one module per subcommand) but the command tree itself is
//! new: the teacher has a flat handful of devcontainer verbs, while this one
//! needs the branch-prefixed dispatch (`<branch> up`, `<branch> exec ...`)
//! that spec §6.1 calls "Runtime passthrough". That shape is modeled as a
//! clap `external_subcommand` catch-all, parsed by hand in `branch.rs`.

use std::path::PathBuf;

use bollard::Docker;
use clap::{Parser, Subcommand};
use jiff::Timestamp;
use serde_json::json;

use crate::config::ProjectConfig;
use crate::error::{DockertreeError, Result};
use crate::orchestrator::{BranchLocks, Orchestrator};
use crate::paths::{self, ResolvedContext};

pub mod completion;
pub mod droplet;
pub mod packages;
pub mod volumes;

pub mod branch;
pub mod create;
pub mod list;
pub mod prune;
pub mod proxy;
pub mod remove;
pub mod setup;

const ABOUT: &str = "Isolated, per-branch development environments over git worktrees, Docker Compose, and Caddy";

#[derive(Debug, Parser)]
#[command(name = "dockertree", version, about = ABOUT, flatten_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit a structured `{success, operation, data, error, timestamp}`
    /// record on stdout instead of human-oriented text.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Initialize `.dockertree/` in the current project.
    Setup(setup::Setup),

    /// Start the global Caddy reverse-proxy container.
    #[command(name = "start-proxy", visible_alias = "start")]
    StartProxy,

    /// Stop the global Caddy reverse-proxy container.
    #[command(name = "stop-proxy", visible_alias = "stop")]
    StopProxy,

    /// Create a new worktree for `branch` (Absent -> Created).
    Create(create::Create),

    /// Remove one or more worktrees, branch kept. Accepts glob patterns.
    #[command(visible_alias = "-r")]
    Remove(remove::Remove),

    /// Remove one or more worktrees and delete their branch. Accepts globs.
    #[command(visible_alias = "-D")]
    Delete(remove::Delete),

    /// Remove every worktree (branches kept).
    #[command(name = "remove-all")]
    RemoveAll(remove::RemoveAll),

    /// Remove every worktree and delete its branch.
    #[command(name = "delete-all")]
    DeleteAll(remove::DeleteAll),

    /// List all worktrees and their container state.
    List(list::List),

    /// Prune worktrees whose git metadata is stale.
    Prune(prune::Prune),

    /// Remove legacy worktrees lacking an allocated port triple.
    #[command(name = "clean-legacy")]
    CleanLegacy,

    /// Named-volume inspection and maintenance.
    Volumes(volumes::Volumes),

    /// Export/import/list/validate `.dockertree-package.tar.gz` bundles.
    Packages(packages::Packages),

    /// Remote droplet provisioning and push/deploy.
    Droplet(droplet::Droplet),

    /// Shell completion management.
    Completion(completion::Completion),

    /// Run the programmatic (RPC) surface of spec §6.5 as an HTTP server.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 4270)]
        port: u16,
    },

    /// Internal: completion candidate sources for the shell wrapper.
    #[command(name = "_completion", hide = true)]
    InternalCompletion(completion::InternalCompletion),

    /// `<branch> <action> ...` — worktree lifecycle and runtime passthrough.
    #[command(external_subcommand)]
    Branch(Vec<String>),
}

/// Everything a command needs once `.dockertree/config.yml` has been
/// resolved: the docker client, the discovered project context, its
/// config, and the branch-lock registry shared across this process
/// invocation (spec §5's "in-process lock on BranchName").
pub struct CliContext {
    pub docker: Docker,
    pub ctx: ResolvedContext,
    pub config: ProjectConfig,
    pub locks: BranchLocks,
}

impl CliContext {
    pub async fn discover() -> Result<Self> {
        let start = working_dir();
        let ctx = paths::resolve_nearest(&start)?;
        let config = ProjectConfig::load(&ctx.config_path)?;
        let docker = crate::docker::client()?;
        Ok(Self {
            docker,
            ctx,
            config,
            locks: BranchLocks::new(),
        })
    }

    pub fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator {
            docker: &self.docker,
            repo_path: &self.ctx.project_root,
            ctx: &self.ctx,
            config: &self.config,
            locks: &self.locks,
        }
    }
}

tokio::task_local! {
    /// Per-request `working_directory` set by the RPC surface (`rpc.rs`).
    /// Scoped to the handling task rather than the process environment so
    /// concurrent requests for different projects never race each other.
    static WORKING_DIR_OVERRIDE: PathBuf;
}

/// Runs `fut` with `working_dir()` resolving to `dir` for its whole task,
/// regardless of how many `.await` points or command modules it passes
/// through. Used by the RPC surface to scope a request's mandatory
/// `working_directory` field without touching the process environment.
pub async fn with_working_dir<F: std::future::Future>(dir: PathBuf, fut: F) -> F::Output {
    WORKING_DIR_OVERRIDE.scope(dir, fut).await
}

/// CWD for path resolution: an RPC-scoped override (see
/// [`with_working_dir`]) if one is active for this task, else
/// `DOCKERTREE_WORKING_DIR` (spec §6.4), else the process's own CWD.
pub fn working_dir() -> PathBuf {
    if let Ok(dir) = WORKING_DIR_OVERRIDE.try_with(|d| d.clone()) {
        return dir;
    }
    std::env::var("DOCKERTREE_WORKING_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// The `{success, operation, data, error, timestamp}` envelope every
/// command produces under `--json` (spec §6.1).
pub fn envelope(operation: &str, result: &Result<serde_json::Value>) -> serde_json::Value {
    let timestamp = Timestamp::now().to_string();
    match result {
        Ok(data) => json!({
            "success": true,
            "operation": operation,
            "data": data,
            "error": null,
            "timestamp": timestamp,
        }),
        Err(e) => json!({
            "success": false,
            "operation": operation,
            "data": null,
            "error": e.to_json(),
            "timestamp": timestamp,
        }),
    }
}

impl Cli {
    /// Dispatches to the matched subcommand, returning the operation name
    /// (for the JSON envelope / human banner) and its structured result.
    pub async fn run(self) -> (String, Result<serde_json::Value>) {
        match self.command {
            Commands::Setup(cmd) => ("setup".to_string(), cmd.run().await),
            Commands::StartProxy => ("start-proxy".to_string(), proxy::start().await),
            Commands::StopProxy => ("stop-proxy".to_string(), proxy::stop().await),
            Commands::Create(cmd) => ("create".to_string(), cmd.run().await),
            Commands::Remove(cmd) => ("remove".to_string(), cmd.run().await),
            Commands::Delete(cmd) => ("delete".to_string(), cmd.run().await),
            Commands::RemoveAll(cmd) => ("remove-all".to_string(), cmd.run().await),
            Commands::DeleteAll(cmd) => ("delete-all".to_string(), cmd.run().await),
            Commands::List(cmd) => ("list".to_string(), cmd.run().await),
            Commands::Prune(cmd) => ("prune".to_string(), cmd.run().await),
            Commands::CleanLegacy => ("clean-legacy".to_string(), prune::clean_legacy().await),
            Commands::Volumes(cmd) => (format!("volumes {}", cmd.operation()), cmd.run().await),
            Commands::Packages(cmd) => (format!("packages {}", cmd.operation()), cmd.run().await),
            Commands::Droplet(cmd) => (format!("droplet {}", cmd.operation()), cmd.run().await),
            Commands::Completion(cmd) => (format!("completion {}", cmd.operation()), cmd.run()),
            Commands::Serve { bind, port } => {
                let result = crate::rpc::run_server(&bind, port)
                    .await
                    .map(|()| serde_json::json!({"stopped": true}))
                    .map_err(DockertreeError::Other);
                ("serve".to_string(), result)
            }
            Commands::InternalCompletion(cmd) => ("_completion".to_string(), cmd.run().await),
            Commands::Branch(args) => {
                let op = args.first().cloned().unwrap_or_default();
                (format!("branch {op}"), branch::run(args).await)
            }
        }
    }
}

pub(crate) fn validation(message: impl Into<String>) -> DockertreeError {
    DockertreeError::validation(message)
}

/// Process exit code for a bulk operation's `Ok` data (`remove.rs`'s
/// `bulk_report`): 1 if any per-branch result landed in `data.failed`,
/// matching the same-shaped single-branch `DockertreeError::exit_code()`
/// convention (spec §9) even though the command itself never errors.
pub fn bulk_exit_code(data: &serde_json::Value) -> i32 {
    let any_failed = data
        .get("failed")
        .and_then(|f| f.as_array())
        .is_some_and(|a| !a.is_empty());
    if any_failed { 1 } else { 0 }
}

/// Entry point for the RPC surface's `<branch> <action> [args...]` route
/// (`rpc.rs`), reusing the same dispatch `branch::run` gives the CLI's
/// `external_subcommand` catch-all.
pub async fn branch_dispatch(args: Vec<String>) -> Result<serde_json::Value> {
    branch::run(args).await
}
