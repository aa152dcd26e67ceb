//! `volumes {list,size,backup,restore,clean}` — named-volume inspection and
//! maintenance, independent of the package export/import bundle format.

use clap::{Args, Subcommand};
use serde_json::json;

use crate::cli::CliContext;
use crate::docker;
use crate::error::Result;

const ALPINE_IMAGE: &str = "docker.io/library/alpine:latest";

#[derive(Debug, Args)]
pub struct Volumes {
    #[command(subcommand)]
    pub command: VolumesCommand,
}

#[derive(Debug, Subcommand)]
pub enum VolumesCommand {
    /// List every volume belonging to this project's worktrees.
    List,
    /// Report on-disk size per volume.
    Size,
    /// Back up a branch's declared volumes to `.tar.gz` files.
    Backup { branch: String, #[arg(long)] output_dir: Option<std::path::PathBuf> },
    /// Restore a single volume from a `.tar.gz` produced by `backup`.
    Restore { branch: String, volume: String, archive: std::path::PathBuf },
    /// Remove every declared volume for a branch (data loss, no rollback).
    Clean { branch: String },
}

impl Volumes {
    pub fn operation(&self) -> &'static str {
        match self.command {
            VolumesCommand::List => "list",
            VolumesCommand::Size => "size",
            VolumesCommand::Backup { .. } => "backup",
            VolumesCommand::Restore { .. } => "restore",
            VolumesCommand::Clean { .. } => "clean",
        }
    }

    pub async fn run(self) -> Result<serde_json::Value> {
        let ctx = CliContext::discover().await?;
        let project_prefix = ctx.config.project_name.clone();
        match self.command {
            VolumesCommand::List => {
                let volumes = docker::volume_list(&ctx.docker, &format!("{project_prefix}-")).await?;
                Ok(json!({"volumes": volumes}))
            }
            VolumesCommand::Size => {
                let volumes = docker::volume_list(&ctx.docker, &format!("{project_prefix}-")).await?;
                let mut sizes = Vec::new();
                for v in volumes {
                    let out = docker::run_throwaway_capture(
                        &ctx.docker,
                        ALPINE_IMAGE,
                        vec!["du".to_string(), "-sh".to_string(), "/vol".to_string()],
                        vec![format!("{v}:/vol:ro")],
                    )
                    .await
                    .unwrap_or_default();
                    let size = out.split_whitespace().next().unwrap_or("unknown").to_string();
                    sizes.push(json!({"volume": v, "size": size}));
                }
                Ok(json!({"volumes": sizes}))
            }
            VolumesCommand::Backup { branch, output_dir } => {
                let orch = ctx.orchestrator();
                let branch_name = orch.branch_name(&branch)?;
                let stack_name = orch.stack_name(&branch_name)?;
                let output_dir = output_dir.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
                std::fs::create_dir_all(&output_dir).map_err(|e| crate::error::DockertreeError::Other(eyre::eyre!(e)))?;
                let mut backed_up = Vec::new();
                for declared in &ctx.config.volumes {
                    let volume_name = stack_name.volume_name(declared);
                    if !docker::volume_exists(&ctx.docker, &volume_name).await? {
                        continue;
                    }
                    let dest = output_dir.join(format!("{declared}.tar.gz"));
                    docker::run_throwaway_public(
                        &ctx.docker,
                        ALPINE_IMAGE,
                        vec!["sh".to_string(), "-c".to_string(), format!("tar czf /out/{declared}.tar.gz -C /from .")],
                        vec![format!("{volume_name}:/from:ro"), format!("{}:/out", output_dir.display())],
                    )
                    .await?;
                    backed_up.push(dest.display().to_string());
                }
                Ok(json!({"branch": branch, "archives": backed_up}))
            }
            VolumesCommand::Restore { branch, volume, archive } => {
                let orch = ctx.orchestrator();
                let branch_name = orch.branch_name(&branch)?;
                let stack_name = orch.stack_name(&branch_name)?;
                let volume_name = stack_name.volume_name(&volume);
                docker::volume_create(&ctx.docker, &volume_name).await?;
                let parent = archive.parent().unwrap_or(std::path::Path::new("."));
                let file_name = archive.file_name().and_then(|n| n.to_str()).unwrap_or("backup.tar.gz");
                docker::run_throwaway_public(
                    &ctx.docker,
                    ALPINE_IMAGE,
                    vec!["tar".to_string(), "xzf".to_string(), format!("/in/{file_name}"), "-C".to_string(), "/to".to_string()],
                    vec![format!("{}:/in:ro", parent.display()), format!("{volume_name}:/to")],
                )
                .await?;
                Ok(json!({"branch": branch, "volume": volume_name}))
            }
            VolumesCommand::Clean { branch } => {
                let orch = ctx.orchestrator();
                let branch_name = orch.branch_name(&branch)?;
                let stack_name = orch.stack_name(&branch_name)?;
                let removed = docker::volume_list(&ctx.docker, &format!("{stack_name}_")).await?;
                for v in &removed {
                    docker::volume_remove(&ctx.docker, v).await?;
                }
                Ok(json!({"branch": branch, "removed": removed}))
            }
        }
    }
}
