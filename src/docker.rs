//! Runtime Adapter (C3): the only component that invokes external
//! executables for container/volume/network/stack operations. Extends the
//! teacher's `docker::client()` (`bollard::Docker::connect_with_local_defaults`)
//! with the typed operations the orchestrator needs.
//!
//! `docker compose` itself has no stable bollard API, so stack-level
//! operations shell out to the `docker` CLI exactly as the teacher's
//! `cli/up.rs`/`cli/destroy.rs` do; volume/network/container primitives go
//! through `bollard` directly, following the teacher's `cli/copy.rs`
//! throwaway-container pattern.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bollard::Docker;
use bollard::models::{ContainerCreateBody, EndpointSettings, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, RemoveVolumeOptions, StopContainerOptions,
};
use bollard::volume::CreateVolumeOptions;
use futures::StreamExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{DockertreeError, Result};

const ALPINE_IMAGE: &str = "docker.io/library/alpine:latest";

pub fn client() -> Result<Docker> {
    Docker::connect_with_local_defaults().map_err(|e| DockertreeError::Other(eyre::eyre!(e)))
}

fn tool_error(tool: &str, status: std::process::ExitStatus, stderr: &[u8]) -> DockertreeError {
    let text = String::from_utf8_lossy(stderr);
    let stderr_tail = text.lines().rev().take(20).collect::<Vec<_>>().join("\n");
    DockertreeError::Runtime {
        tool: tool.to_string(),
        exit_code: status.code().unwrap_or(-1),
        stderr_tail,
    }
}

pub async fn ensure_network(docker: &Docker, name: &str) -> Result<()> {
    timeout(Duration::from_secs(10), async {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let existing = docker
            .list_networks(Some(bollard::query_parameters::ListNetworksOptions {
                filters: Some(filters),
            }))
            .await
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        if existing.iter().any(|n| n.name.as_deref() == Some(name)) {
            return Ok(());
        }
        docker
            .create_network(bollard::query_parameters::CreateNetworkOptionsBuilder::default()
                .name(name)
                .build())
            .await
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        Ok(())
    })
    .await
    .map_err(|_| DockertreeError::Timeout {
        operation: format!("ensure_network({name})"),
        elapsed_secs: 10,
    })?
}

pub async fn volume_create(docker: &Docker, name: &str) -> Result<()> {
    docker
        .create_volume(CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        })
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(())
}

pub async fn volume_remove(docker: &Docker, name: &str) -> Result<()> {
    match docker
        .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
        .await
    {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(e) => Err(DockertreeError::Other(eyre::eyre!(e))),
    }
}

pub async fn volume_list(docker: &Docker, prefix: &str) -> Result<Vec<String>> {
    let resp = docker
        .list_volumes(None::<bollard::query_parameters::ListVolumesOptions>)
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(resp
        .volumes
        .unwrap_or_default()
        .into_iter()
        .filter(|v| v.name.starts_with(prefix))
        .map(|v| v.name)
        .collect())
}

pub async fn volume_exists(docker: &Docker, name: &str) -> Result<bool> {
    match docker.inspect_volume(name).await {
        Ok(_) => Ok(true),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
        Err(e) => Err(DockertreeError::Other(eyre::eyre!(e))),
    }
}

pub async fn containers_using_volume(docker: &Docker, volume: &str) -> Result<Vec<String>> {
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            ..Default::default()
        }))
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    let mut matching = Vec::new();
    for c in containers {
        let Some(id) = c.id.clone() else { continue };
        let Ok(details) = docker
            .inspect_container(&id, None::<InspectContainerOptions>)
            .await
        else {
            continue;
        };
        let mounts = details.mounts.unwrap_or_default();
        if mounts.iter().any(|m| m.name.as_deref() == Some(volume)) {
            matching.push(id);
        }
    }
    Ok(matching)
}

pub async fn containers_are_running(docker: &Docker, ids: &[String]) -> Result<bool> {
    for id in ids {
        let details = docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        if !details.state.and_then(|s| s.running).unwrap_or(false) {
            return Ok(false);
        }
    }
    Ok(!ids.is_empty())
}

/// A running container discovered by label, as returned by
/// [`list_labeled_containers`]. Used by the proxy watcher to build routing
/// config without depending on bollard types outside this module.
#[derive(Debug, Clone)]
pub struct LabeledContainer {
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Containers whose label set includes at least one key starting with
/// `label_prefix` (e.g. `"caddy.proxy"`).
pub async fn list_labeled_containers(docker: &Docker, label_prefix: &str) -> Result<Vec<LabeledContainer>> {
    let containers = docker
        .list_containers(Some(ListContainersOptions {
            all: false,
            ..Default::default()
        }))
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    Ok(containers
        .into_iter()
        .filter_map(|c| {
            let labels = c.labels.unwrap_or_default();
            if !labels.keys().any(|k| k.starts_with(label_prefix)) {
                return None;
            }
            let name = c
                .names
                .and_then(|mut n| n.pop())
                .map(|n| n.trim_start_matches('/').to_string())
                .or(c.id)?;
            Some(LabeledContainer { name, labels })
        })
        .collect())
}

/// Idempotent start of a long-lived, named container (the global proxy):
/// create it if absent, start it if stopped, no-op if already running.
pub async fn ensure_running_container(
    docker: &Docker,
    name: &str,
    image: &str,
    port_bindings: HashMap<String, Vec<PortBinding>>,
    networks: &[String],
    labels: HashMap<String, String>,
) -> Result<()> {
    ensure_image(docker, image).await?;

    if let Ok(existing) = docker.inspect_container(name, None::<InspectContainerOptions>).await {
        if existing.state.and_then(|s| s.running).unwrap_or(false) {
            return Ok(());
        }
        docker
            .start_container(name, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        return Ok(());
    }

    let mut endpoints = HashMap::new();
    for network in networks {
        endpoints.insert(network.clone(), EndpointSettings::default());
    }

    docker
        .create_container(
            Some(CreateContainerOptions {
                name: Some(name.to_string()),
                ..Default::default()
            }),
            ContainerCreateBody {
                image: Some(image.to_string()),
                labels: Some(labels),
                host_config: Some(HostConfig {
                    port_bindings: Some(port_bindings),
                    network_mode: networks.first().cloned(),
                    ..Default::default()
                }),
                networking_config: Some(bollard::models::NetworkingConfig {
                    endpoints_config: Some(endpoints),
                }),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    docker
        .start_container(name, None::<bollard::query_parameters::StartContainerOptions>)
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(())
}

/// Stop and remove a named long-lived container, no-op if absent.
pub async fn stop_named_container(docker: &Docker, name: &str) -> Result<()> {
    match docker.stop_container(name, None::<StopContainerOptions>).await {
        Ok(()) => {}
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => return Ok(()),
        Err(e) => return Err(DockertreeError::Other(eyre::eyre!(e))),
    }
    docker
        .remove_container(name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(())
}

async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }
    docker
        .create_image(
            Some(CreateImageOptionsBuilder::new().from_image(image).build()),
            None,
            None,
        )
        .collect::<Vec<_>>()
        .await;
    Ok(())
}

/// A currently-running container found to be using a given volume, plus the
/// network and hostname another container can use to reach it. Used by the
/// Volume Cloner's LiveSnapshot path (`volume.rs`) to dump a live database
/// over the network rather than ever touching its volume's files directly.
#[derive(Debug, Clone)]
pub struct LiveContainer {
    pub id: String,
    pub network: String,
    pub alias: String,
}

/// Finds a running container using `volume` and the first user-defined
/// network it is attached to. Returns `None` if no running container uses
/// the volume (the `FastCopy` case never reaches this).
pub async fn find_live_container(docker: &Docker, volume: &str) -> Result<Option<LiveContainer>> {
    for id in containers_using_volume(docker, volume).await? {
        let details = docker
            .inspect_container(&id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        let running = details
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            continue;
        }
        let alias = details
            .name
            .clone()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.clone());
        let network = details
            .network_settings
            .and_then(|ns| ns.networks)
            .and_then(|nets| nets.keys().next().cloned())
            .ok_or_else(|| DockertreeError::VolumeCopyFailed {
                message: format!("container '{alias}' using volume '{volume}' has no attached network"),
                details: Vec::new(),
            })?;
        return Ok(Some(LiveContainer { id, network, alias }));
    }
    Ok(None)
}

/// Runs a throwaway container whose entrypoint is overridden to `/bin/sh -c
/// <script>`, bypassing the image's own entrypoint (e.g. the postgres image
/// would otherwise treat a non-`postgres` command as something to `exec`
/// rather than a multi-step shell script). Optionally joins `network` so it
/// can reach another container there by name — used by the Volume Cloner's
/// LiveSnapshot path to run a dump client against the live database's
/// network, and a replay instance with no network at all.
pub async fn run_db_container(
    docker: &Docker,
    image: &str,
    script: &str,
    binds: Vec<String>,
    env: Vec<String>,
    network: Option<&str>,
) -> Result<()> {
    ensure_image(docker, image).await?;

    let mut host_config = HostConfig {
        binds: Some(binds),
        ..Default::default()
    };
    if let Some(network) = network {
        host_config.network_mode = Some(network.to_string());
    }

    let container = docker
        .create_container(
            Some(CreateContainerOptions::default()),
            ContainerCreateBody {
                image: Some(image.to_string()),
                entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                cmd: Some(vec![script.to_string()]),
                env: Some(env),
                host_config: Some(host_config),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    let id = container.id;
    let result = async {
        docker
            .start_container(&id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        let mut stream = docker.wait_container(&id, None::<bollard::query_parameters::WaitContainerOptions>);
        let resp = stream
            .next()
            .await
            .ok_or_else(|| DockertreeError::Other(eyre::eyre!("wait_container stream ended early")))?
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        if resp.status_code != 0 {
            return Err(DockertreeError::Other(eyre::eyre!(
                "live snapshot container exited with status {}",
                resp.status_code
            )));
        }
        Ok(())
    }
    .await;

    let _ = docker
        .remove_container(&id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
        .await;

    result
}

/// A minimal throwaway-container copy, as used by the teacher's
/// `cli/copy.rs`: bind-mount `src` read-only and `dst` read-write, `cp -a`.
pub async fn fastcopy_volume(docker: &Docker, src: &str, dst: &str) -> Result<()> {
    ensure_image(docker, ALPINE_IMAGE).await?;
    run_throwaway(
        docker,
        ALPINE_IMAGE,
        vec!["sh".to_string(), "-c".to_string(), "cp -a /from/. /to/".to_string()],
        vec![format!("{src}:/from:ro"), format!("{dst}:/to")],
    )
    .await
    .map_err(|e| DockertreeError::VolumeCopyFailed {
        message: e.to_string(),
        details: Vec::new(),
    })
}

/// Public entry point for other components (e.g. the Volume Cloner's
/// LiveSnapshot path) that need a throwaway-container run with arbitrary
/// image/command/binds, not just the alpine `cp -a` case.
pub async fn run_throwaway_public(
    docker: &Docker,
    image: &str,
    cmd: Vec<String>,
    binds: Vec<String>,
) -> Result<()> {
    ensure_image(docker, image).await?;
    run_throwaway(docker, image, cmd, binds).await
}

/// Like [`run_throwaway_public`], but captures the container's combined
/// stdout/stderr instead of just the exit status. Used by `volumes size`,
/// which has no API equivalent of `du -sh` over a bollard volume handle.
pub async fn run_throwaway_capture(
    docker: &Docker,
    image: &str,
    cmd: Vec<String>,
    binds: Vec<String>,
) -> Result<String> {
    ensure_image(docker, image).await?;
    let container = docker
        .create_container(
            Some(CreateContainerOptions::default()),
            ContainerCreateBody {
                image: Some(image.to_string()),
                cmd: Some(cmd),
                host_config: Some(HostConfig {
                    binds: Some(binds),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    let id = container.id;
    let result = async {
        docker
            .start_container(&id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        let mut stream = docker.wait_container(&id, None::<bollard::query_parameters::WaitContainerOptions>);
        stream
            .next()
            .await
            .ok_or_else(|| DockertreeError::Other(eyre::eyre!("wait_container stream ended early")))?
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

        let mut logs = docker.logs(
            &id,
            Some(bollard::query_parameters::LogsOptionsBuilder::default().stdout(true).stderr(true).build()),
        );
        let mut out = String::new();
        while let Some(chunk) = logs.next().await {
            if let Ok(chunk) = chunk {
                out.push_str(&chunk.to_string());
            }
        }
        Ok(out)
    }
    .await;

    let _ = docker
        .remove_container(&id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
        .await;

    result
}

async fn run_throwaway(
    docker: &Docker,
    image: &str,
    cmd: Vec<String>,
    binds: Vec<String>,
) -> Result<()> {
    let container = docker
        .create_container(
            Some(CreateContainerOptions::default()),
            ContainerCreateBody {
                image: Some(image.to_string()),
                cmd: Some(cmd),
                host_config: Some(HostConfig {
                    binds: Some(binds),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    let id = container.id;
    let result = async {
        docker
            .start_container(&id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        let mut stream = docker.wait_container(&id, None::<bollard::query_parameters::WaitContainerOptions>);
        let resp = stream
            .next()
            .await
            .ok_or_else(|| DockertreeError::Other(eyre::eyre!("wait_container stream ended early")))?
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        if resp.status_code != 0 {
            return Err(DockertreeError::Other(eyre::eyre!(
                "throwaway container exited with status {}",
                resp.status_code
            )));
        }
        Ok(())
    }
    .await;

    let _ = docker
        .remove_container(&id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
        .await;

    result
}

fn tool_output_error(out: &std::process::Output, tool: &str) -> DockertreeError {
    tool_error(tool, out.status, &out.stderr)
}

/// `stack_up(stack_files, stack_name, env_file, detach)`.
pub async fn stack_up(
    stack_files: &[impl AsRef<Path>],
    stack_name: &str,
    env_file: &Path,
    detach: bool,
    cwd: &Path,
) -> Result<()> {
    let mut args = compose_base_args(stack_files, stack_name, env_file);
    args.push("up".to_string());
    if detach {
        args.push("-d".to_string());
    }
    args.push("--build".to_string());
    run_docker(&args, cwd, "docker compose up", 300).await
}

pub async fn stack_down(
    stack_files: &[impl AsRef<Path>],
    stack_name: &str,
    env_file: &Path,
    remove_volumes: bool,
    cwd: &Path,
) -> Result<()> {
    let mut args = compose_base_args(stack_files, stack_name, env_file);
    args.push("down".to_string());
    args.push("--remove-orphans".to_string());
    if remove_volumes {
        args.push("-v".to_string());
    }
    run_docker(&args, cwd, "docker compose down", 300).await
}

/// Generic passthrough for `exec`/`logs`/`ps`/`run`/`build`/`restart`/any
/// other declarative-stack subcommand.
pub async fn stack_passthrough(
    stack_files: &[impl AsRef<Path>],
    stack_name: &str,
    env_file: &Path,
    extra_args: &[String],
    cwd: &Path,
) -> Result<std::process::ExitStatus> {
    let mut args = compose_base_args(stack_files, stack_name, env_file);
    args.extend(extra_args.iter().cloned());

    let status = Command::new("docker")
        .args(&args)
        .current_dir(cwd)
        .status()
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(status)
}

fn compose_base_args(stack_files: &[impl AsRef<Path>], stack_name: &str, env_file: &Path) -> Vec<String> {
    let mut args = vec!["compose".to_string(), "-p".to_string(), stack_name.to_string()];
    for f in stack_files {
        args.push("-f".to_string());
        args.push(f.as_ref().to_string_lossy().into_owned());
    }
    args.push("--env-file".to_string());
    args.push(env_file.to_string_lossy().into_owned());
    args
}

async fn run_docker(args: &[String], cwd: &Path, tool: &str, timeout_secs: u64) -> Result<()> {
    let fut = Command::new("docker")
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .output();

    let out = timeout(Duration::from_secs(timeout_secs), fut)
        .await
        .map_err(|_| DockertreeError::Timeout {
            operation: tool.to_string(),
            elapsed_secs: timeout_secs,
        })?
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    if !out.status.success() {
        return Err(tool_output_error(&out, tool));
    }
    Ok(())
}

/// `proxy_admin_post(json_config)` — push configuration to the live-config
/// admin endpoint. Single-writer by contract (§5); callers are responsible
/// for serializing writes across commands.
pub async fn proxy_admin_post(admin_url: &str, config: &serde_json::Value) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client
        .post(admin_url)
        .json(config)
        .send()
        .await
        .map_err(|e| DockertreeError::Network {
            message: format!("proxy admin request failed: {e}"),
            details: Vec::new(),
        })?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(DockertreeError::Network {
            message: format!("proxy admin rejected config: {status}"),
            details: vec![body],
        });
    }
    Ok(())
}
