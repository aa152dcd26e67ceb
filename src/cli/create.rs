use clap::Args;
use serde::Deserialize;
use serde_json::json;

use crate::cli::CliContext;
use crate::error::Result;
use crate::orchestrator::CancelToken;

/// Creates a new worktree for `branch` (Absent -> Created).
#[derive(Debug, Args, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Create {
    pub branch: String,
}

impl Create {
    pub async fn run(self) -> Result<serde_json::Value> {
        let ctx = CliContext::discover().await?;
        let worktree = ctx.orchestrator().create(&self.branch, &CancelToken::new()).await?;
        Ok(json!(worktree))
    }
}
