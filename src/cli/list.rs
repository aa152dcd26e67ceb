use clap::Args;
use serde::Deserialize;
use serde_json::json;

use crate::cli::CliContext;
use crate::error::Result;

/// Lists every worktree and its container state.
#[derive(Debug, Args, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct List {}

impl List {
    pub async fn run(self) -> Result<serde_json::Value> {
        let ctx = CliContext::discover().await?;
        let worktrees = ctx.orchestrator().list().await?;
        Ok(json!({"worktrees": worktrees}))
    }
}
