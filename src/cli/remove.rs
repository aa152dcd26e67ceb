//! `remove`/`delete` and their `-all` counterparts, both accepting a glob
//! pattern over branch names for bulk operation (spec §4.4, §9).

use clap::Args;
use serde::Deserialize;
use serde_json::json;

use crate::cli::CliContext;
use crate::error::{DockertreeError, Result};

/// Removes one or more worktrees (branch kept). `target` may be a literal
/// branch name or a glob pattern (`feature-*`).
#[derive(Debug, Args, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Remove {
    pub target: String,
}

impl Remove {
    pub async fn run(self) -> Result<serde_json::Value> {
        let ctx = CliContext::discover().await?;
        let orch = ctx.orchestrator();
        let branches = orch.matching(&self.target).await?;
        if branches.is_empty() {
            return Err(DockertreeError::not_found(format!(
                "no worktree matches '{}'",
                self.target
            )));
        }
        bulk_report(branches, |b| async move { orch.remove(&b).await }).await
    }
}

/// Removes one or more worktrees and deletes their branch.
#[derive(Debug, Args, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Delete {
    pub target: String,

    /// Delete even a protected branch, or one with unmerged commits.
    #[arg(long)]
    #[serde(default)]
    pub force: bool,
}

impl Delete {
    pub async fn run(self) -> Result<serde_json::Value> {
        let ctx = CliContext::discover().await?;
        let orch = ctx.orchestrator();
        let branches = orch.matching(&self.target).await?;
        if branches.is_empty() {
            return Err(DockertreeError::not_found(format!(
                "no worktree matches '{}'",
                self.target
            )));
        }
        let force = self.force;
        bulk_report(branches, |b| async move { orch.delete(&b, force).await }).await
    }
}

/// Removes every worktree, branches kept.
#[derive(Debug, Args, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RemoveAll {}

impl RemoveAll {
    pub async fn run(self) -> Result<serde_json::Value> {
        let ctx = CliContext::discover().await?;
        let orch = ctx.orchestrator();
        let branches = orch.matching("*").await?;
        bulk_report(branches, |b| async move { orch.remove(&b).await }).await
    }
}

/// Removes every worktree and deletes its branch.
#[derive(Debug, Args, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeleteAll {
    #[arg(long)]
    #[serde(default)]
    pub force: bool,
}

impl DeleteAll {
    pub async fn run(self) -> Result<serde_json::Value> {
        let ctx = CliContext::discover().await?;
        let orch = ctx.orchestrator();
        let branches = orch.matching("*").await?;
        let force = self.force;
        bulk_report(branches, |b| async move { orch.delete(&b, force).await }).await
    }
}

/// Runs `op` over every branch in `branches`, reporting per-branch
/// success/failure rather than aborting on the first error — bulk
/// operations are best-effort (spec §9). Always `Ok`: the per-branch
/// results are the payload, even when some branches failed. The process
/// exit code is derived from `data.failed` by `cli::bulk_exit_code`.
async fn bulk_report<F, Fut>(branches: Vec<String>, op: F) -> Result<serde_json::Value>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for branch in branches {
        match op(branch.clone()).await {
            Ok(()) => succeeded.push(branch),
            Err(e) => failed.push(json!({"branch": branch, "error": e.to_json()})),
        }
    }
    Ok(json!({"succeeded": succeeded, "failed": failed}))
}
