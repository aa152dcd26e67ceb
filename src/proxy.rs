//! Proxy Coordinator (C9): global reverse-proxy container plus the
//! label-discovery watcher that pushes routing configuration to it.
//!
//! No teacher equivalent. Grounded in the pack's `Caddy` builder for the
//! shape of a typed reverse-proxy config, adapted to push JSON straight to
//! the admin API (`POST /load`) via `reqwest` rather than rendering a
//! `Caddyfile`. Container discovery by label reuses
//! `bollard::Docker::list_containers` the same way the teacher's sidecar
//! cleanup paths already do.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use bollard::Docker;
use bollard::models::PortBinding;
use serde_json::json;

use crate::docker;
use crate::error::Result;

pub const PROXY_CONTAINER_NAME: &str = "dockertree_caddy_proxy";
const CADDY_IMAGE: &str = "docker.io/library/caddy:2";
pub const ADMIN_PORT: u16 = 2019;
const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

const PROXY_LABEL_HOST: &str = "caddy.proxy";
const PROXY_LABEL_UPSTREAM: &str = "caddy.proxy.reverse_proxy";
const PROXY_LABEL_HEALTH: &str = "caddy.proxy.health_check";

const ACME_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
const ACME_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

pub fn admin_url() -> String {
    format!("http://127.0.0.1:{ADMIN_PORT}/load")
}

fn port_binding(host_port: u16) -> Vec<PortBinding> {
    vec![PortBinding {
        host_ip: None,
        host_port: Some(host_port.to_string()),
    }]
}

/// Start (or confirm already running) the global proxy container, joined to
/// the shared external network so it can reach every worktree's web-class
/// services by container name.
pub async fn start(docker: &Docker, caddy_network: &str) -> Result<()> {
    docker::ensure_network(docker, caddy_network).await?;

    let mut bindings = HashMap::new();
    bindings.insert(format!("{HTTP_PORT}/tcp"), port_binding(HTTP_PORT));
    bindings.insert(format!("{HTTPS_PORT}/tcp"), port_binding(HTTPS_PORT));
    bindings.insert(format!("{ADMIN_PORT}/tcp"), port_binding(ADMIN_PORT));

    let mut labels = HashMap::new();
    labels.insert("dockertree.managed".to_string(), "proxy".to_string());

    docker::ensure_running_container(
        docker,
        PROXY_CONTAINER_NAME,
        CADDY_IMAGE,
        bindings,
        &[caddy_network.to_string()],
        labels,
    )
    .await
}

pub async fn stop(docker: &Docker) -> Result<()> {
    docker::stop_named_container(docker, PROXY_CONTAINER_NAME).await
}

/// A single reverse-proxy route, discovered from one labeled container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: String,
    pub upstream: String,
    pub health_check: Option<String>,
}

fn is_domain_host(host: &str) -> bool {
    let bare = host.split(':').next().unwrap_or(host);
    bare.contains('.') && bare.parse::<IpAddr>().is_err()
}

/// Parses the `caddy.proxy*` labels of every container bollard reports with
/// at least one such label into routes. A container missing the upstream
/// label is skipped (host-only label with no target is meaningless).
pub fn routes_from_containers(containers: &[docker::LabeledContainer]) -> Vec<Route> {
    containers
        .iter()
        .filter_map(|c| {
            let host = c.labels.get(PROXY_LABEL_HOST)?.clone();
            let upstream = c.labels.get(PROXY_LABEL_UPSTREAM)?.clone();
            let health_check = c.labels.get(PROXY_LABEL_HEALTH).cloned();
            Some(Route { host, upstream, health_check })
        })
        .collect()
}

/// Renders Caddy's native JSON admin-config object for the given routes.
/// `staging_hosts` names domain hosts that should use the ACME staging
/// issuer instead of production (the rate-limit fallback, §4.8).
pub fn render_config(routes: &[Route], staging_hosts: &HashSet<String>) -> serde_json::Value {
    let route_objs: Vec<serde_json::Value> = routes
        .iter()
        .map(|r| {
            let mut handler = json!({
                "handler": "reverse_proxy",
                "upstreams": [{"dial": r.upstream}],
            });
            if let Some(health) = &r.health_check {
                handler["health_checks"] = json!({"active": {"uri": health}});
            }
            json!({
                "match": [{"host": [bare_host(&r.host)]}],
                "handle": [handler],
            })
        })
        .collect();

    let automation_policies: Vec<serde_json::Value> = routes
        .iter()
        .map(|r| bare_host(&r.host))
        .filter(|h| is_domain_host(h))
        .map(|h| {
            let issuer_url = if staging_hosts.contains(&h) { ACME_STAGING } else { ACME_PRODUCTION };
            json!({
                "subjects": [h],
                "issuers": [{"module": "acme", "ca": issuer_url}],
            })
        })
        .collect();

    json!({
        "apps": {
            "http": {
                "servers": {
                    "dockertree": {
                        "listen": [format!(":{HTTP_PORT}"), format!(":{HTTPS_PORT}")],
                        "routes": route_objs,
                        "automatic_https": {
                            "disable": false,
                        },
                    }
                }
            },
            "tls": {
                "automation": {
                    "policies": automation_policies,
                }
            }
        }
    })
}

fn bare_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_string()
}

/// `static_template()` — the reference config written to
/// `.dockertree/caddy.template.json` by `setup`, documenting the shape the
/// watcher produces at runtime. Never pushed directly.
pub fn static_template() -> serde_json::Value {
    render_config(&[], &HashSet::new())
}

/// One reconciliation pass: discover labeled containers, render config,
/// push it. On a rate-limit response from the certificate authority, retry
/// once with the affected hosts pinned to the staging issuer and report the
/// fallback via `ReconcileReport::staged`.
pub struct ReconcileReport {
    pub routes: usize,
    pub staged: Vec<String>,
}

pub async fn reconcile(docker: &Docker) -> Result<ReconcileReport> {
    let labeled = docker::list_labeled_containers(docker, PROXY_LABEL_HOST).await?;
    let routes = routes_from_containers(&labeled);
    let staging_hosts = HashSet::new();

    let config = render_config(&routes, &staging_hosts);
    match docker::proxy_admin_post(&admin_url(), &config).await {
        Ok(()) => Ok(ReconcileReport { routes: routes.len(), staged: Vec::new() }),
        Err(e) if is_rate_limited(&e) => {
            let domain_hosts: HashSet<String> = routes
                .iter()
                .map(|r| bare_host(&r.host))
                .filter(|h| is_domain_host(h))
                .collect();
            let retried = render_config(&routes, &domain_hosts);
            docker::proxy_admin_post(&admin_url(), &retried).await?;
            Ok(ReconcileReport { routes: routes.len(), staged: domain_hosts.into_iter().collect() })
        }
        Err(e) => Err(e),
    }
}

fn is_rate_limited(err: &crate::error::DockertreeError) -> bool {
    matches!(err, crate::error::DockertreeError::Network { message, .. } if message.to_lowercase().contains("rate limit"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(host: &str, upstream: &str) -> Route {
        Route { host: host.to_string(), upstream: upstream.to_string(), health_check: None }
    }

    #[test]
    fn domain_hosts_get_automation_policy() {
        let routes = vec![route("app.example.com", "myapp-web:8000")];
        let config = render_config(&routes, &HashSet::new());
        let policies = config["apps"]["tls"]["automation"]["policies"].as_array().unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0]["subjects"][0], "app.example.com");
    }

    #[test]
    fn ip_hosts_produce_no_automation_policy() {
        let routes = vec![route("203.0.113.10", "myapp-web:8000")];
        let config = render_config(&routes, &HashSet::new());
        let policies = config["apps"]["tls"]["automation"]["policies"].as_array().unwrap();
        assert!(policies.is_empty());
    }

    #[test]
    fn staging_hosts_use_staging_issuer() {
        let routes = vec![route("app.example.com", "myapp-web:8000")];
        let mut staging = HashSet::new();
        staging.insert("app.example.com".to_string());
        let config = render_config(&routes, &staging);
        let ca = config["apps"]["tls"]["automation"]["policies"][0]["issuers"][0]["ca"].as_str().unwrap();
        assert_eq!(ca, ACME_STAGING);
    }

    #[test]
    fn routes_skip_host_only_labels() {
        let mut labels = HashMap::new();
        labels.insert(PROXY_LABEL_HOST.to_string(), "app.example.com".to_string());
        let containers = vec![docker::LabeledContainer { name: "c1".to_string(), labels }];
        assert!(routes_from_containers(&containers).is_empty());
    }

    #[test]
    fn is_domain_host_rejects_bare_ip() {
        assert!(!is_domain_host("203.0.113.10"));
        assert!(is_domain_host("app.example.com"));
    }
}
