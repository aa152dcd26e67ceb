//! `prune` (stale git worktree metadata) and `clean-legacy` (worktrees
//! without an allocated host-port triple, predating env-file generation).

use clap::Args;
use serde::Deserialize;
use serde_json::json;

use crate::cli::CliContext;
use crate::env_file;
use crate::error::Result;
use crate::vcs;

#[derive(Debug, Args, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Prune {}

impl Prune {
    pub async fn run(self) -> Result<serde_json::Value> {
        let ctx = CliContext::discover().await?;
        vcs::worktree_prune(&ctx.ctx.project_root).await?;
        Ok(json!({"pruned": true}))
    }
}

pub async fn clean_legacy() -> Result<serde_json::Value> {
    let ctx = CliContext::discover().await?;
    let orch = ctx.orchestrator();
    let worktrees = orch.list().await?;

    let mut removed = Vec::new();
    for w in worktrees {
        let env_path = env_file::env_path_for(&w.path);
        let has_ports = env_file::read_values(&env_path)
            .map(|v| v.contains_key("DOCKERTREE_DB_HOST_PORT"))
            .unwrap_or(false);
        if !has_ports {
            orch.remove(&w.branch).await?;
            removed.push(w.branch);
        }
    }
    Ok(json!({"removed": removed}))
}
