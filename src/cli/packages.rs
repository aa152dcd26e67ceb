//! `packages {export,import,list,validate}` — portable bundles of a
//! worktree's environment/volumes/code, per spec §4.9/§6.2.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use serde_json::json;

use crate::cli::{working_dir, CliContext};
use crate::error::Result;
use crate::package::{self, ExportOptions, ImportMode, ImportOptions};

#[derive(Debug, Args)]
pub struct Packages {
    #[command(subcommand)]
    pub command: PackagesCommand,
}

#[derive(Debug, Subcommand)]
pub enum PackagesCommand {
    /// Export a branch's environment (and optionally data/code) to a bundle.
    Export {
        branch: String,
        #[arg(long)]
        include_code: bool,
        #[arg(long)]
        no_data: bool,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        no_compress: bool,
    },
    /// Import a bundle, creating a new worktree (or extracting standalone).
    Import {
        archive: PathBuf,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        no_restore_data: bool,
        #[arg(long)]
        standalone: bool,
        #[arg(long)]
        target_dir: Option<PathBuf>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        ip: Option<String>,
    },
    /// List `.dockertree-package.tar.gz` bundles in a directory.
    List {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Validate a bundle's checksums without importing it.
    Validate { archive: PathBuf },
}

impl Packages {
    pub fn operation(&self) -> &'static str {
        match self.command {
            PackagesCommand::Export { .. } => "export",
            PackagesCommand::Import { .. } => "import",
            PackagesCommand::List { .. } => "list",
            PackagesCommand::Validate { .. } => "validate",
        }
    }

    pub async fn run(self) -> Result<serde_json::Value> {
        match self.command {
            PackagesCommand::Export { branch, include_code, no_data, output_dir, no_compress } => {
                let ctx = CliContext::discover().await?;
                let orch = ctx.orchestrator();
                let now = jiff::Timestamp::now().to_string();
                let opts = ExportOptions {
                    include_code,
                    include_data: !no_data,
                    output_dir: output_dir.unwrap_or_else(working_dir),
                    compress: !no_compress,
                };
                let path = package::export(&ctx.docker, &ctx.ctx.project_root, &orch, &ctx.config, &branch, opts, &now).await?;
                Ok(json!({"archive": path}))
            }
            PackagesCommand::Import { archive, branch, no_restore_data, standalone, target_dir, domain, ip } => {
                let ctx = CliContext::discover().await.ok();
                let repo_path = ctx.as_ref().map(|c| c.ctx.project_root.clone()).unwrap_or_else(working_dir);
                let orch = ctx.as_ref().map(|c| c.orchestrator());
                let opts = ImportOptions {
                    target_branch: branch,
                    restore_data: !no_restore_data,
                    mode: if standalone { Some(ImportMode::Standalone) } else { None },
                    target_dir,
                    domain,
                    ip,
                };
                let docker = crate::docker::client()?;
                let report = package::import(&docker, &repo_path, orch.as_ref(), &archive, opts).await?;
                Ok(json!({"branch": report.branch, "worktree_path": report.worktree_path, "mode": format!("{:?}", report.mode)}))
            }
            PackagesCommand::List { dir } => {
                let mut bundles = Vec::new();
                let entries = std::fs::read_dir(&dir).map_err(|e| crate::error::DockertreeError::Other(eyre::eyre!(e)))?;
                for entry in entries {
                    let entry = entry.map_err(|e| crate::error::DockertreeError::Other(eyre::eyre!(e)))?;
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("gz") {
                        continue;
                    }
                    if let Ok(metadata) = package::peek_metadata(&path) {
                        bundles.push(json!({
                            "path": path,
                            "branch": metadata.branch_name,
                            "project": metadata.project_name,
                            "created_at": metadata.created_at,
                            "include_code": metadata.include_code,
                        }));
                    }
                }
                Ok(json!({"packages": bundles}))
            }
            PackagesCommand::Validate { archive } => {
                let metadata = package::validate(&archive)?;
                Ok(json!({"valid": true, "metadata": metadata}))
            }
        }
    }
}
