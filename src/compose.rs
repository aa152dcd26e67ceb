//! Compose Transformer (C5): rewrites the project's own
//! `docker-compose.yml` into a sibling `.dockertree/docker-compose.worktree.yml`,
//! applying the seven ordered rules below. The original file is never
//! mutated (§3 Invariants).
//!
//! Has no teacher counterpart (the teacher transforms *devcontainer.json*,
//! never a compose file). Grounded on the pack instead: `docker-compose-types`
//! (`indexmap` feature), as used by `LeakIX-catapulta`'s `compose` module,
//! gives a typed compose AST to parse-and-rewrite rather than hand-rolling
//! YAML edits — matching `Rick-Phoenix-sketch`'s bespoke compose schema,
//! which reaches for the same kind of typed model for the same reason.

use std::path::{Path, PathBuf};

use docker_compose_types::{
    AdvancedNetworkSettings, AdvancedNetworks, Compose, ComposeNetwork, ComposeNetworks,
    ComposeVolume, Labels, MapOrEmpty, Networks, Ports, Service, Services, SingleValue,
    TopLevelVolumes, Volumes as ServiceVolumes,
};
use indexmap::IndexMap;

use crate::error::{DockertreeError, Result};

/// Source file candidates, preferred in order (`.yml` over `.yaml`).
pub const SOURCE_CANDIDATES: &[&str] = &["docker-compose.yml", "docker-compose.yaml", "compose.yml", "compose.yaml"];

pub const WEB_CLASS_MARKERS: &[&str] = &["web", "app", "frontend", "api"];
const WELL_KNOWN_SERVICES: &[&str] = &["db", "cache", "web"];

pub fn find_source(project_root: &Path) -> Result<PathBuf> {
    for candidate in SOURCE_CANDIDATES {
        let path = project_root.join(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(DockertreeError::Transform {
        message: "no docker-compose.yml/yaml found in project root".to_string(),
        details: Vec::new(),
    })
}

pub struct TransformOptions<'a> {
    pub caddy_network: &'a str,
    pub web_class_markers: &'a [String],
}

/// Parses `source`, applies the transformation rules, and returns the
/// rewritten document plus the set of named volumes it declared (used by
/// the orchestrator to drive per-branch volume cloning) and any warnings
/// (undeclared-volume mismatches, per the Open Question resolution).
pub struct TransformOutput {
    pub compose: Compose,
    pub declared_volumes: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn transform(source_yaml: &str, opts: &TransformOptions) -> Result<TransformOutput> {
    let mut compose: Compose = serde_yaml::from_str(source_yaml).map_err(|e| DockertreeError::Transform {
        message: format!("failed to parse compose file: {e}"),
        details: Vec::new(),
    })?;

    if compose.services.0.is_empty() {
        return Err(DockertreeError::Transform {
            message: "compose file has no 'services:' root".to_string(),
            details: Vec::new(),
        });
    }

    let web_markers: Vec<String> = if opts.web_class_markers.is_empty() {
        WEB_CLASS_MARKERS.iter().map(|s| s.to_string()).collect()
    } else {
        opts.web_class_markers.to_vec()
    };

    let mut warnings = Vec::new();
    let declared_volume_names: Vec<String> = compose
        .volumes
        .0
        .keys()
        .cloned()
        .collect();

    let service_names: Vec<String> = compose.services.0.keys().cloned().collect();

    for name in &service_names {
        let Some(Some(service)) = compose.services.0.get_mut(name) else {
            continue;
        };

        rewrite_identity(service, name);
        let published_ports = rewrite_ports(service, name);
        if is_web_class(name, &web_markers) {
            add_proxy_labels(service, name, &published_ports);
            attach_caddy_network(service, opts.caddy_network);
        }
        rewrite_volumes(service, &declared_volume_names, &mut warnings);
        apply_build_mode(service);
    }

    rewrite_top_level_volumes(&mut compose.volumes);
    ensure_caddy_network_declared(&mut compose.networks, opts.caddy_network);

    Ok(TransformOutput {
        compose,
        declared_volumes: declared_volume_names,
        warnings,
    })
}

/// Rule 1: `container_name` -> `${COMPOSE_PROJECT_NAME}-<service>`. Services
/// without one already inherit the stack tool's own default naming, which
/// already includes the project name, so they are left untouched.
fn rewrite_identity(service: &mut Service, name: &str) {
    if service.container_name.is_some() {
        service.container_name = Some(format!("${{COMPOSE_PROJECT_NAME}}-{name}"));
    }
}

/// Rule 2: published host ports become `expose` entries, plus for the three
/// well-known services a templated re-publish honoring the worktree's
/// allocated host port. Returns the container-side ports that were
/// published, for use by rule 3's health-check/reverse-proxy target.
fn rewrite_ports(service: &mut Service, name: &str) -> Vec<String> {
    let mut container_ports = Vec::new();

    let short_entries: Vec<String> = match std::mem::take(&mut service.ports) {
        Ports::Short(entries) => entries,
        Ports::Long(entries) => entries
            .into_iter()
            .map(|p| {
                let published = p
                    .published
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                if published.is_empty() {
                    p.target.to_string()
                } else {
                    format!("{published}:{}", p.target)
                }
            })
            .collect(),
    };

    for entry in short_entries {
        let container_port = strip_host_ip_and_get_container_port(&entry);
        container_ports.push(container_port.clone());

        if !service.expose.iter().any(|e| matches_single(e, &container_port)) {
            service.expose.push(SingleValue::String(container_port.clone()));
        }

        if WELL_KNOWN_SERVICES.contains(&name) {
            let var = format!("DOCKERTREE_{}_HOST_PORT", name.to_uppercase());
            service.ports = match std::mem::take(&mut service.ports) {
                Ports::Short(mut v) => {
                    v.push(format!("${{{var}:-0}}:{container_port}"));
                    Ports::Short(v)
                }
                other => other,
            };
        }
    }

    // Services already using `expose` only (no `ports:`) are untouched by
    // the loop above; their declared exposes double as the proxy target.
    if container_ports.is_empty() {
        container_ports = service
            .expose
            .iter()
            .map(|v| single_value_to_string(v))
            .collect();
    }

    container_ports
}

fn matches_single(value: &SingleValue, s: &str) -> bool {
    single_value_to_string(value) == s
}

fn single_value_to_string(value: &SingleValue) -> String {
    match value {
        SingleValue::String(s) => s.clone(),
        SingleValue::Unsigned(n) => n.to_string(),
        SingleValue::Bool(b) => b.to_string(),
    }
}

/// Resolves the Open Question on host-IP-prefixed port mappings
/// (`127.0.0.1:5432:5432`): strip the host IP segment, then apply the
/// standard `host:container` -> `container` rule.
fn strip_host_ip_and_get_container_port(entry: &str) -> String {
    let parts: Vec<&str> = entry.split(':').collect();
    match parts.len() {
        1 => parts[0].to_string(),
        2 => parts[1].to_string(),
        3 => parts[2].to_string(),
        _ => entry.to_string(),
    }
}

fn is_web_class(name: &str, markers: &[String]) -> bool {
    let lower = name.to_lowercase();
    markers.iter().any(|m| lower.contains(&m.to_lowercase()))
}

/// Rule 3: proxy labels for web-class services.
fn add_proxy_labels(service: &mut Service, name: &str, container_ports: &[String]) {
    let port = container_ports.first().cloned().unwrap_or_default();
    let mut labels = match std::mem::take(&mut service.labels) {
        Labels::List(list) => list,
        Labels::Map(map) => map.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
    };

    let proxy_label = "caddy.proxy=${COMPOSE_PROJECT_NAME}.localhost".to_string();
    let reverse_proxy_label = format!("caddy.proxy.reverse_proxy=${{COMPOSE_PROJECT_NAME}}-{name}:{port}");

    labels.retain(|l| !l.starts_with("caddy.proxy=") && !l.starts_with("caddy.proxy.reverse_proxy="));
    labels.push(proxy_label);
    labels.push(reverse_proxy_label);

    labels.retain(|l| !l.starts_with("caddy.proxy.health_check="));
    if let Some(health) = service.healthcheck.as_ref().and_then(|h| h.test.clone()) {
        labels.push(format!("caddy.proxy.health_check={}", health_test_to_string(&health)));
    }

    service.labels = Labels::List(labels);
}

fn health_test_to_string(test: &docker_compose_types::HealthcheckTest) -> String {
    match test {
        docker_compose_types::HealthcheckTest::Single(s) => s.clone(),
        docker_compose_types::HealthcheckTest::Multiple(v) => v.join(" "),
    }
}

/// Rule 5: web-class services join the external proxy network; db/cache
/// services are left on whatever internal networks they already declared.
fn attach_caddy_network(service: &mut Service, caddy_network: &str) {
    let mut map = match std::mem::take(&mut service.networks) {
        Networks::Simple(names) => names
            .into_iter()
            .map(|n| (n, MapOrEmpty::Empty))
            .collect::<IndexMap<_, _>>(),
        Networks::Advanced(AdvancedNetworks(map)) => map,
    };
    map.entry(caddy_network.to_string()).or_insert(MapOrEmpty::Empty);
    service.networks = Networks::Advanced(AdvancedNetworks(map));
}

/// Rule 4: named volume references get `${COMPOSE_PROJECT_NAME}_<volume>`.
fn rewrite_volumes(service: &mut Service, declared: &[String], warnings: &mut Vec<String>) {
    for vol in service.volumes.iter_mut() {
        let ServiceVolumes::Simple(spec) = vol else { continue };
        let Some((source, rest)) = spec.split_once(':') else { continue };
        if source.starts_with('.') || source.starts_with('/') || source.is_empty() {
            continue; // bind mount, not a named volume
        }
        if source.starts_with("${COMPOSE_PROJECT_NAME}_") {
            continue; // already rewritten by a prior transform pass
        }
        if !declared.contains(&source.to_string()) {
            warnings.push(format!(
                "service volume '{source}' is not declared in config.yml's volumes list"
            ));
        }
        *spec = format!("${{COMPOSE_PROJECT_NAME}}_{source}:{rest}");
    }
}

fn rewrite_top_level_volumes(volumes: &mut TopLevelVolumes) {
    for (name, entry) in volumes.0.iter_mut() {
        let vol = match entry {
            MapOrEmpty::Map(v) => v,
            MapOrEmpty::Empty => {
                *entry = MapOrEmpty::Map(ComposeVolume::default());
                let MapOrEmpty::Map(v) = entry else { unreachable!() };
                v
            }
        };
        vol.name = Some(format!("${{COMPOSE_PROJECT_NAME}}_{name}"));
    }
}

fn ensure_caddy_network_declared(networks: &mut ComposeNetworks, caddy_network: &str) {
    networks.0.entry(caddy_network.to_string()).or_insert(MapOrEmpty::Map(ComposeNetwork {
        external: Some(docker_compose_types::ComposeNetworkExternal::Bool(true)),
        ..Default::default()
    }));
}

/// Rule 6: build stage selector, where a build section exists.
fn apply_build_mode(service: &mut Service) {
    if let Some(build) = service.build_.as_mut() {
        if build.target.is_none() {
            build.target = Some("${BUILD_MODE:-dev}".to_string());
        }
    }
}

pub fn serialize(compose: &Compose) -> Result<String> {
    serde_yaml::to_string(compose).map_err(|e| DockertreeError::Transform {
        message: format!("failed to serialize transformed compose file: {e}"),
        details: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
services:
  web:
    image: myapp/web:latest
    container_name: myapp-web
    ports:
      - "8000:8000"
    volumes:
      - app_data:/data
    labels:
      - "traefik.enable=true"
  db:
    image: postgres:16
    ports:
      - "127.0.0.1:5432:5432"
    volumes:
      - db_data:/var/lib/postgresql/data
volumes:
  app_data: {}
  db_data: {}
"#;

    fn opts() -> TransformOptions<'static> {
        TransformOptions {
            caddy_network: "dockertree_caddy_proxy",
            web_class_markers: &[],
        }
    }

    #[test]
    fn rewrites_container_names() {
        let out = transform(SAMPLE, &opts()).unwrap();
        let web = out.compose.services.0.get("web").unwrap().as_ref().unwrap();
        assert_eq!(web.container_name.as_deref(), Some("${COMPOSE_PROJECT_NAME}-web"));
    }

    #[test]
    fn converts_published_ports_to_expose() {
        let out = transform(SAMPLE, &opts()).unwrap();
        let db = out.compose.services.0.get("db").unwrap().as_ref().unwrap();
        match &db.ports {
            Ports::Short(entries) => {
                assert!(entries.iter().any(|e| e.contains("DOCKERTREE_DB_HOST_PORT")));
            }
            _ => panic!("expected short ports"),
        }
    }

    #[test]
    fn adds_proxy_labels_only_to_web_class() {
        let out = transform(SAMPLE, &opts()).unwrap();
        let web = out.compose.services.0.get("web").unwrap().as_ref().unwrap();
        let db = out.compose.services.0.get("db").unwrap().as_ref().unwrap();
        let web_labels = match &web.labels {
            Labels::List(l) => l.clone(),
            Labels::Map(m) => m.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
        };
        assert!(web_labels.iter().any(|l| l.starts_with("caddy.proxy=")));
        let db_labels = match &db.labels {
            Labels::List(l) => l.clone(),
            Labels::Map(_) => Vec::new(),
        };
        assert!(!db_labels.iter().any(|l| l.starts_with("caddy.proxy=")));
    }

    #[test]
    fn missing_services_root_is_transform_error() {
        let err = transform("volumes: {}\n", &opts()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Transform);
    }

    #[test]
    fn is_idempotent_on_its_own_output() {
        let first = transform(SAMPLE, &opts()).unwrap();
        let rendered = serialize(&first.compose).unwrap();
        let second = transform(&rendered, &opts()).unwrap();
        let rendered_again = serialize(&second.compose).unwrap();
        assert_eq!(rendered, rendered_again);
    }
}
