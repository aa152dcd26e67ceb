//! `droplet {create,push,list,info,destroy,regions}` — remote provisioning
//! and the push/deploy pipeline of spec §4.10.

use clap::{Args, Subcommand};
use serde_json::json;

use crate::cli::{working_dir, CliContext};
use crate::config::GlobalConfig;
use crate::env_file;
use crate::error::{DockertreeError, Result};
use crate::push::{self, DigitalOcean, DropletSpec};

#[derive(Debug, Args)]
pub struct Droplet {
    #[command(subcommand)]
    pub command: DropletCommand,
}

#[derive(Debug, Subcommand)]
pub enum DropletCommand {
    /// Provision a new droplet and point DNS at it.
    Create {
        name: String,
        #[arg(long, default_value = "nyc3")]
        region: String,
        #[arg(long, default_value = "s-1vcpu-1gb")]
        size: String,
        #[arg(long, default_value = "ubuntu-22-04-x64")]
        image: String,
        #[arg(long)]
        ssh_key: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Export `branch` and ship it to a remote target over SCP/SSH.
    Push {
        branch: String,
        target: String,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// List droplets under the account.
    List {
        #[arg(long)]
        token: Option<String>,
    },
    /// Show one droplet's details.
    Info {
        id: u64,
        #[arg(long)]
        token: Option<String>,
    },
    /// Destroy one or more droplets by id.
    Destroy {
        #[arg(value_delimiter = ',')]
        ids: Vec<u64>,
        #[arg(long)]
        token: Option<String>,
    },
    /// List available regions.
    Regions {
        #[arg(long)]
        token: Option<String>,
    },
}

impl Droplet {
    pub fn operation(&self) -> &'static str {
        match self.command {
            DropletCommand::Create { .. } => "create",
            DropletCommand::Push { .. } => "push",
            DropletCommand::List { .. } => "list",
            DropletCommand::Info { .. } => "info",
            DropletCommand::Destroy { .. } => "destroy",
            DropletCommand::Regions { .. } => "regions",
        }
    }

    pub async fn run(self) -> Result<serde_json::Value> {
        match self.command {
            DropletCommand::Create { name, region, size, image, ssh_key, token } => {
                let client = resolve_client(token.as_deref()).await?;
                let spec = DropletSpec {
                    name,
                    region,
                    size,
                    image,
                    ssh_keys: ssh_key.into_iter().collect(),
                };
                let droplet = client.create_droplet(&spec).await?;
                let ready = client.wait_until_ready(droplet.id).await?;
                Ok(json!({"id": ready.id, "status": ready.status, "public_ip": ready.public_ip()}))
            }
            DropletCommand::Push { branch, target, domain, ip, token } => run_push(branch, target, domain, ip, token).await,
            DropletCommand::List { token } => {
                let client = resolve_client(token.as_deref()).await?;
                let droplets = client.list_droplets().await?;
                Ok(json!({"droplets": droplets.into_iter().map(|d| json!({
                    "id": d.id, "name": d.name, "status": d.status, "public_ip": d.public_ip(),
                })).collect::<Vec<_>>()}))
            }
            DropletCommand::Info { id, token } => {
                let client = resolve_client(token.as_deref()).await?;
                let droplet = client.get_droplet(id).await?;
                Ok(json!({"id": droplet.id, "name": droplet.name, "status": droplet.status, "public_ip": droplet.public_ip(), "private_ip": droplet.private_ip()}))
            }
            DropletCommand::Destroy { ids, token } => {
                let client = resolve_client(token.as_deref()).await?;
                let mut destroyed = Vec::new();
                let mut failed = Vec::new();
                for id in ids {
                    match client.destroy_droplet(id).await {
                        Ok(()) => destroyed.push(id),
                        Err(e) => failed.push(json!({"id": id, "error": e.to_json()})),
                    }
                }
                if failed.is_empty() {
                    Ok(json!({"destroyed": destroyed}))
                } else {
                    Err(DockertreeError::Runtime {
                        tool: "droplet destroy".to_string(),
                        exit_code: 1,
                        stderr_tail: serde_json::to_string(&json!({"destroyed": destroyed, "failed": failed})).unwrap_or_default(),
                    })
                }
            }
            DropletCommand::Regions { token } => {
                let client = resolve_client(token.as_deref()).await?;
                Ok(json!({"regions": client.list_regions().await?}))
            }
        }
    }
}

async fn resolve_client(cli_flag: Option<&str>) -> Result<DigitalOcean> {
    let global = GlobalConfig::load()?;
    let project_dotenv = CliContext::discover()
        .await
        .ok()
        .map(|ctx| env_file::read_values(&ctx.ctx.config_dir.join(env_file::ENV_FILE_NAME)).unwrap_or_default())
        .unwrap_or_default();
    let token = push::resolve_token(cli_flag, &project_dotenv, &global)
        .ok_or_else(|| DockertreeError::validation("no DigitalOcean API token found (flag, env var, project .env, or global config)"))?;
    Ok(DigitalOcean::new(token))
}

async fn run_push(branch: String, target: String, domain: Option<String>, ip: Option<String>, token: Option<String>) -> Result<serde_json::Value> {
    let ctx = CliContext::discover().await?;
    let orch = ctx.orchestrator();
    let client = resolve_client(token.as_deref()).await;

    let now = jiff::Timestamp::now().to_string();
    let archive = crate::package::export(
        &ctx.docker,
        &ctx.ctx.project_root,
        &orch,
        &ctx.config,
        &branch,
        crate::package::ExportOptions {
            include_code: true,
            include_data: true,
            output_dir: std::env::temp_dir(),
            compress: true,
        },
        &now,
    )
    .await?;

    let resolve_host = |host: String| async move {
        if let Ok(addrs) = tokio::net::lookup_host((host.as_str(), 22)).await {
            if let Some(addr) = addrs.into_iter().next() {
                return Ok(addr.ip().to_string());
            }
        }
        if let Ok(client) = resolve_client(None).await {
            let droplets = client.list_droplets().await?;
            if let Some(d) = droplets.into_iter().find(|d| d.name == host) {
                if let Some(ip) = d.public_ip() {
                    return Ok(ip.to_string());
                }
            }
        }
        Err(DockertreeError::not_found(format!("could not resolve push target '{host}'")))
    };
    let scp_target = push::resolve_target(&target, resolve_host).await?;

    push::scp_transfer(&archive, &scp_target).await?;
    let package_file = format!("{}/{}", scp_target.path, archive.file_name().and_then(|n| n.to_str()).unwrap_or("package.tar.gz"));
    let script = push::remote_import_script(&package_file, domain.as_deref(), ip.as_deref());
    push::ssh_exec(&scp_target, &script).await?;

    if let (Ok(client), Some(domain)) = (&client, domain.as_deref()) {
        let (sub, root) = push::split_domain(domain);
        if let Some(public_ip) = scp_target.host.parse::<std::net::IpAddr>().ok().map(|ip| ip.to_string()) {
            client.upsert_a_record(&root, &sub, &public_ip).await.ok();
        }
    }

    let env_path = orch
        .branch_name(&branch)
        .map(|b| env_file::env_path_for(&orch.worktree_path(&b)))
        .ok();
    if let Some(env_path) = env_path.filter(|p| p.exists()) {
        if let Ok(mut values) = env_file::read_values(&env_path) {
            env_file::record_push_target(&mut values, &scp_target.to_string(), &branch, domain.as_deref(), ip.as_deref());
            env_file::write_values(&env_path, &values)?;
        }
    }

    Ok(json!({"branch": branch, "target": scp_target.to_string(), "archive": archive}))
}
