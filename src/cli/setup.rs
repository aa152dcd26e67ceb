use clap::Args;
use serde::Deserialize;
use serde_json::json;

use crate::cli::working_dir;
use crate::error::Result;
use crate::setup::{self, SetupOptions};

/// Initializes `.dockertree/` beside the project's compose file.
#[derive(Debug, Args, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Setup {
    /// Override the derived project name.
    #[arg(long)]
    pub project_name: Option<String>,

    /// Patch `.gitignore` to exclude generated worktree state.
    #[arg(long)]
    #[serde(default)]
    pub monkey_patch: bool,

    /// Overwrite an existing `config.yml`.
    #[arg(long)]
    #[serde(default)]
    pub force: bool,
}

impl Setup {
    pub async fn run(self) -> Result<serde_json::Value> {
        let project_root = working_dir();
        let report = setup::run(
            &project_root,
            SetupOptions {
                project_name: self.project_name,
                monkey_patch: self.monkey_patch,
                force: self.force,
            },
        )
        .await?;
        Ok(json!(report))
    }
}
