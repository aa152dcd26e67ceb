//! `<branch> <action> ...` dispatch: the worktree lifecycle shortcuts
//! (`up`/`down`) and runtime passthrough (`exec`/`logs`/`ps`/`run`/`build`/
//! `restart`/anything else `docker compose` understands), per spec §6.1's
//! "Runtime passthrough" row. Parsed out of clap's `external_subcommand`
//! catch-all since branch names aren't known subcommand names up front.

use serde_json::json;

use crate::cli::{validation, CliContext};
use crate::docker;
use crate::env_file;
use crate::error::Result;

pub async fn run(args: Vec<String>) -> Result<serde_json::Value> {
    let mut iter = args.into_iter();
    let branch = iter
        .next()
        .ok_or_else(|| validation("expected '<branch> <action> [args...]'"))?;
    let action = iter
        .next()
        .ok_or_else(|| validation(format!("expected an action after branch '{branch}'")))?;
    let rest: Vec<String> = iter.collect();

    let ctx = CliContext::discover().await?;
    let orch = ctx.orchestrator();

    match action.as_str() {
        "up" => {
            let detach = rest.iter().any(|a| a == "-d" || a == "--detach");
            orch.start(&branch, detach).await?;
            Ok(json!({"branch": branch, "state": "running"}))
        }
        "down" => {
            orch.stop(&branch).await?;
            Ok(json!({"branch": branch, "state": "stopped"}))
        }
        _ => {
            let branch_name = orch.branch_name(&branch)?;
            let worktree_path = orch.worktree_path(&branch_name);
            crate::orchestrator::require_exists(&worktree_path, &branch_name)?;
            let stack_name = orch.stack_name(&branch_name)?;
            let stack_files = orch.stack_files(&worktree_path)?;
            let env_path = env_file::env_path_for(&worktree_path);

            let mut extra_args = vec![action.clone()];
            extra_args.extend(rest);
            let status = docker::stack_passthrough(&stack_files, stack_name.as_str(), &env_path, &extra_args, &worktree_path).await?;
            Ok(json!({"branch": branch, "action": action, "exit_code": status.code()}))
        }
    }
}
