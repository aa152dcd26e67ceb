//! Environment Generator (C6): writes and updates `env.dockertree`, a
//! line-oriented `KEY=VALUE` file, and allocates the per-worktree
//! host-port triple.
//!
//! The file format itself needs no crate (the teacher never had an
//! analogous artifact): parsing follows the teacher's general style of
//! "read, validate, fall back to a default" seen in `config.rs`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::{DockertreeError, Result};
use crate::ids::StackName;

pub const ENV_FILE_NAME: &str = "env.dockertree";

const PORT_RANGE_START: u16 = 55000;
const PORT_RANGE_END: u16 = 59000;

/// Parse a line-oriented `KEY=VALUE` file, ignoring blank lines and lines
/// starting with `#`. Values are not quote-stripped: this format does not
/// support quoting, matching the shell-sourceable env files it produces.
pub fn parse_kv(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn render_kv(values: &BTreeMap<String, String>) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct HostPortTriple {
    pub db: u16,
    pub redis: u16,
    pub web: u16,
}

impl HostPortTriple {
    fn as_slice(&self) -> [u16; 3] {
        [self.db, self.redis, self.web]
    }
}

/// Scan every sibling `env.dockertree` under `worktrees_dir` for ports
/// already claimed, then allocate three distinct, previously-unused ports
/// in `[55000, 59000)`. Legacy worktrees without a recorded port fall back
/// to `0` (runtime-chosen) and are simply skipped when building the
/// used-set.
pub fn allocate_port_triple(worktrees_dir: &Path) -> Result<HostPortTriple> {
    let mut used = collect_used_ports(worktrees_dir)?;
    let mut rng = rand::rng();

    let mut next_port = |used: &std::collections::HashSet<u16>| -> Result<u16> {
        for _ in 0..10_000 {
            let candidate = rng.random_range(PORT_RANGE_START..PORT_RANGE_END);
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(DockertreeError::precondition(
            "exhausted the host port range while allocating a worktree port triple",
        ))
    };

    let db = next_port(&used)?;
    used.insert(db);
    let redis = next_port(&used)?;
    used.insert(redis);
    let web = next_port(&used)?;

    Ok(HostPortTriple { db, redis, web })
}

fn collect_used_ports(worktrees_dir: &Path) -> Result<std::collections::HashSet<u16>> {
    let mut used = std::collections::HashSet::new();
    if !worktrees_dir.exists() {
        return Ok(used);
    }
    let entries = std::fs::read_dir(worktrees_dir)
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        let env_path = entry.path().join(".dockertree").join(ENV_FILE_NAME);
        let Ok(raw) = std::fs::read_to_string(&env_path) else {
            continue;
        };
        let values = parse_kv(&raw);
        for key in [
            "DOCKERTREE_DB_HOST_PORT",
            "DOCKERTREE_REDIS_HOST_PORT",
            "DOCKERTREE_WEB_HOST_PORT",
        ] {
            if let Some(port) = values.get(key).and_then(|v| v.parse::<u16>().ok()) {
                if port != 0 {
                    used.insert(port);
                }
            }
        }
    }
    Ok(used)
}

/// Builds and writes the initial `env.dockertree` for a freshly created
/// worktree, per spec §4.6.
pub struct EnvFileBuilder {
    pub stack_name: StackName,
    pub ports: HostPortTriple,
}

impl EnvFileBuilder {
    pub fn build(&self) -> BTreeMap<String, String> {
        let stack = self.stack_name.as_str();
        let domain = format!("{stack}.localhost");
        let mut values = BTreeMap::new();
        values.insert("COMPOSE_PROJECT_NAME".to_string(), stack.to_string());
        values.insert("SITE_DOMAIN".to_string(), format!("http://{domain}"));
        values.insert(
            "ALLOWED_HOSTS".to_string(),
            format!("localhost,127.0.0.1,{domain},*.localhost"),
        );
        values.insert("USE_X_FORWARDED_HOST".to_string(), "True".to_string());
        values.insert(
            "DOCKERTREE_DB_HOST_PORT".to_string(),
            self.ports.db.to_string(),
        );
        values.insert(
            "DOCKERTREE_REDIS_HOST_PORT".to_string(),
            self.ports.redis.to_string(),
        );
        values.insert(
            "DOCKERTREE_WEB_HOST_PORT".to_string(),
            self.ports.web.to_string(),
        );
        values.insert(
            "VITE_ALLOWED_HOSTS".to_string(),
            format!("{domain},*.localhost,localhost,127.0.0.1"),
        );
        values
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_values(path, &self.build())
    }
}

pub fn write_values(path: &Path, values: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    }
    std::fs::write(path, render_kv(values)).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(())
}

pub fn read_values(path: &Path) -> Result<BTreeMap<String, String>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| DockertreeError::not_found(format!("{}: {e}", path.display())))?;
    Ok(parse_kv(&raw))
}

/// Applies the "on push with `--domain`/`--ip`" override rules of §4.6:
/// replaces `SITE_DOMAIN`, extends `ALLOWED_HOSTS`, and recomputes
/// `VITE_ALLOWED_HOSTS`. Exactly one of `domain`/`ip` is expected to be
/// `Some`.
pub fn apply_push_override(
    values: &mut BTreeMap<String, String>,
    domain: Option<&str>,
    ip: Option<&str>,
) {
    let (site_domain, host) = match (domain, ip) {
        (Some(domain), _) => (format!("https://{domain}"), domain.to_string()),
        (None, Some(ip)) => (format!("http://{ip}"), ip.to_string()),
        (None, None) => return,
    };
    values.insert("SITE_DOMAIN".to_string(), site_domain);

    let mut hosts: Vec<String> = values
        .get("ALLOWED_HOSTS")
        .map(|v| v.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    if !hosts.iter().any(|h| h == &host) {
        hosts.push(host.clone());
    }
    values.insert("ALLOWED_HOSTS".to_string(), hosts.join(","));

    let mut vite_hosts: Vec<String> = values
        .get("VITE_ALLOWED_HOSTS")
        .map(|v| v.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    if !vite_hosts.iter().any(|h| h == &host) {
        vite_hosts.insert(0, host);
    }
    values.insert("VITE_ALLOWED_HOSTS".to_string(), vite_hosts.join(","));
}

/// Sets `PUSH_SCP_TARGET`, `PUSH_BRANCH_NAME`, and the mutually exclusive
/// `PUSH_DOMAIN`/`PUSH_IP` after a successful push, per spec §3.
pub fn record_push_target(
    values: &mut BTreeMap<String, String>,
    scp_target: &str,
    branch_name: &str,
    domain: Option<&str>,
    ip: Option<&str>,
) {
    values.insert("PUSH_SCP_TARGET".to_string(), scp_target.to_string());
    values.insert("PUSH_BRANCH_NAME".to_string(), branch_name.to_string());
    values.remove("PUSH_DOMAIN");
    values.remove("PUSH_IP");
    if let Some(domain) = domain {
        values.insert("PUSH_DOMAIN".to_string(), domain.to_string());
    } else if let Some(ip) = ip {
        values.insert("PUSH_IP".to_string(), ip.to_string());
    }
}

/// For worker deployments bound to a central server's VPC private IP.
pub fn set_worker_hosts(values: &mut BTreeMap<String, String>, db_host: &str, redis_host: &str) {
    values.insert("DB_HOST".to_string(), db_host.to_string());
    values.insert("REDIS_HOST".to_string(), redis_host.to_string());
}

pub fn env_path_for(worktree_path: &Path) -> PathBuf {
    worktree_path.join(".dockertree").join(ENV_FILE_NAME)
}

/// Rewrites an `env.dockertree` copied in from a different `StackName` (a
/// package imported under `--target-branch`, or into a different project
/// name) so it points at its new stack rather than its old one:
/// `COMPOSE_PROJECT_NAME`, the host-port triple, and every `*.localhost`
/// domain reference are replaced. Without this, the compose variant's
/// `${COMPOSE_PROJECT_NAME}` still resolves to the exported worktree's
/// stack, and the imported worktree's ports can collide with another
/// worktree's (spec §3's disjoint-port-triple invariant).
pub fn rebind_stack(
    values: &mut BTreeMap<String, String>,
    old_stack: &str,
    new_stack: &StackName,
    ports: HostPortTriple,
) {
    let old_domain = format!("{old_stack}.localhost");
    let new_domain = format!("{}.localhost", new_stack.as_str());

    values.insert("COMPOSE_PROJECT_NAME".to_string(), new_stack.as_str().to_string());
    values.insert("DOCKERTREE_DB_HOST_PORT".to_string(), ports.db.to_string());
    values.insert("DOCKERTREE_REDIS_HOST_PORT".to_string(), ports.redis.to_string());
    values.insert("DOCKERTREE_WEB_HOST_PORT".to_string(), ports.web.to_string());

    for key in ["SITE_DOMAIN", "ALLOWED_HOSTS", "VITE_ALLOWED_HOSTS"] {
        if let Some(v) = values.get(key) {
            let rewritten = v.replace(&old_domain, &new_domain);
            values.insert(key.to_string(), rewritten);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BranchName, ProjectName};

    #[test]
    fn parses_kv_skipping_comments_and_blanks() {
        let raw = "# comment\nFOO=bar\n\nBAZ=qux\n";
        let parsed = parse_kv(raw);
        assert_eq!(parsed.get("FOO").unwrap(), "bar");
        assert_eq!(parsed.get("BAZ").unwrap(), "qux");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn builds_required_keys() {
        let project = ProjectName::new("myapp").unwrap();
        let branch = BranchName::new("feature-auth", &[]).unwrap();
        let stack = StackName::new(&project, &branch);
        let builder = EnvFileBuilder {
            stack_name: stack,
            ports: HostPortTriple {
                db: 55001,
                redis: 55002,
                web: 55003,
            },
        };
        let values = builder.build();
        assert_eq!(values["COMPOSE_PROJECT_NAME"], "myapp-feature-auth");
        assert_eq!(values["SITE_DOMAIN"], "http://myapp-feature-auth.localhost");
        assert!(values["ALLOWED_HOSTS"].contains("*.localhost"));
        assert_eq!(values["USE_X_FORWARDED_HOST"], "True");
    }

    #[test]
    fn allocated_ports_are_disjoint() {
        let tmp = tempfile::tempdir().unwrap();
        let triple = allocate_port_triple(tmp.path()).unwrap();
        let ports = triple.as_slice();
        assert_eq!(ports.len(), 3);
        assert_ne!(ports[0], ports[1]);
        assert_ne!(ports[1], ports[2]);
        assert_ne!(ports[0], ports[2]);
        for p in ports {
            assert!((PORT_RANGE_START..PORT_RANGE_END).contains(&p));
        }
    }

    #[test]
    fn allocation_avoids_ports_already_in_use() {
        let tmp = tempfile::tempdir().unwrap();
        let existing = tmp.path().join("existing-branch").join(".dockertree");
        std::fs::create_dir_all(&existing).unwrap();
        std::fs::write(
            existing.join(ENV_FILE_NAME),
            "DOCKERTREE_DB_HOST_PORT=55050\nDOCKERTREE_REDIS_HOST_PORT=55051\nDOCKERTREE_WEB_HOST_PORT=55052\n",
        )
        .unwrap();

        let used = collect_used_ports(tmp.path()).unwrap();
        assert!(used.contains(&55050));
        assert!(used.contains(&55051));
        assert!(used.contains(&55052));
    }

    #[test]
    fn push_override_sets_https_domain() {
        let mut values = BTreeMap::new();
        values.insert("ALLOWED_HOSTS".to_string(), "localhost,127.0.0.1".to_string());
        apply_push_override(&mut values, Some("example.com"), None);
        assert_eq!(values["SITE_DOMAIN"], "https://example.com");
        assert!(values["ALLOWED_HOSTS"].contains("example.com"));
    }

    #[test]
    fn push_override_sets_http_ip() {
        let mut values = BTreeMap::new();
        apply_push_override(&mut values, None, Some("10.0.0.5"));
        assert_eq!(values["SITE_DOMAIN"], "http://10.0.0.5");
    }

    #[test]
    fn rebind_stack_rewrites_project_name_ports_and_domain() {
        let project = ProjectName::new("myapp").unwrap();
        let branch = BranchName::new("feature-auth", &[]).unwrap();
        let old_stack = "myapp-original";
        let new_stack = StackName::new(&project, &branch);
        let mut values = BTreeMap::new();
        values.insert("COMPOSE_PROJECT_NAME".to_string(), old_stack.to_string());
        values.insert("SITE_DOMAIN".to_string(), "http://myapp-original.localhost".to_string());
        values.insert(
            "ALLOWED_HOSTS".to_string(),
            "localhost,127.0.0.1,myapp-original.localhost,*.localhost".to_string(),
        );
        values.insert(
            "VITE_ALLOWED_HOSTS".to_string(),
            "myapp-original.localhost,*.localhost,localhost,127.0.0.1".to_string(),
        );

        rebind_stack(
            &mut values,
            old_stack,
            &new_stack,
            HostPortTriple { db: 55101, redis: 55102, web: 55103 },
        );

        assert_eq!(values["COMPOSE_PROJECT_NAME"], "myapp-feature-auth");
        assert_eq!(values["DOCKERTREE_DB_HOST_PORT"], "55101");
        assert_eq!(values["SITE_DOMAIN"], "http://myapp-feature-auth.localhost");
        assert!(values["ALLOWED_HOSTS"].contains("myapp-feature-auth.localhost"));
        assert!(!values["ALLOWED_HOSTS"].contains("myapp-original.localhost"));
    }
}
