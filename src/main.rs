#![forbid(unsafe_code)]

use clap::Parser;
use color_eyre::config::HookBuilder;
use dc::cli::{self, Cli};
use dc::orchestrator::Worktree;
use dc::{preflight, subscriber, table};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    HookBuilder::default().display_env_section(false).install()?;

    subscriber::init_subscriber();

    let cli_args = Cli::parse();
    let json_output = cli_args.json;

    preflight::check().await?;

    let (operation, result) = cli_args.run().await;

    let exit_code = match &result {
        Ok(data) => cli::bulk_exit_code(data),
        Err(e) => e.exit_code(),
    };

    if json_output {
        println!("{}", cli::envelope(&operation, &result));
    } else {
        render_human(&operation, &result);
    }

    std::process::exit(exit_code);
}

fn render_human(operation: &str, result: &dc::error::Result<serde_json::Value>) {
    match result {
        Ok(data) => render_success(operation, data),
        Err(e) => eprintln!("error: {e}"),
    }
}

fn render_success(operation: &str, data: &serde_json::Value) {
    match operation {
        "list" => {
            if let Some(worktrees) = data.get("worktrees") {
                if let Ok(worktrees) = serde_json::from_value::<Vec<Worktree>>(worktrees.clone()) {
                    print!("{}", table::worktrees(&worktrees));
                    return;
                }
            }
        }
        "volumes size" => {
            if let Some(rows) = data.get("volumes").and_then(|v| v.as_array()) {
                let rows: Vec<(String, String)> = rows
                    .iter()
                    .filter_map(|r| {
                        Some((
                            r.get("volume")?.as_str()?.to_string(),
                            r.get("size")?.as_str()?.to_string(),
                        ))
                    })
                    .collect();
                print!("{}", table::volume_sizes(&rows));
                return;
            }
        }
        "packages list" => {
            if let Some(rows) = data.get("packages").and_then(|v| v.as_array()) {
                let rows: Vec<(String, String, String)> = rows
                    .iter()
                    .map(|r| {
                        (
                            r.get("path").and_then(|v| v.as_str()).unwrap_or("-").to_string(),
                            r.get("branch").and_then(|v| v.as_str()).unwrap_or("-").to_string(),
                            r.get("created_at").and_then(|v| v.as_str()).unwrap_or("-").to_string(),
                        )
                    })
                    .collect();
                print!("{}", table::packages(&rows));
                return;
            }
        }
        _ => {}
    }
    match serde_json::to_string_pretty(data) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{data}"),
    }
}
