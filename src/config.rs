//! Project config (`.dockertree/config.yml`) and the global per-user config
//! (`~/.dockertree/env.dockertree`, provider tokens and deployment defaults).
//!
//! Follows the teacher's `deserialize_shell_path`-style "validate on the way
//! in" approach, but the project config itself is new: the teacher only ever
//! had a single global TOML file naming already-known project paths, while
//! here every project carries its own config beside its compose file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::error::{DockertreeError, Result};
use crate::ids::ProjectName;

pub const CONFIG_DIR_NAME: &str = ".dockertree";
pub const CONFIG_FILE_NAME: &str = "config.yml";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name_template: Option<String>,
}

#[serde_inline_default]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VpcConfig {
    #[serde_inline_default(false)]
    pub auto_bind_ports: bool,
    #[serde_inline_default(false)]
    pub bind_to_private_ip: bool,
    #[serde_inline_default(false)]
    pub auto_configure_firewall: bool,
}

impl Default for VpcConfig {
    fn default() -> Self {
        Self {
            auto_bind_ports: false,
            bind_to_private_ip: false,
            auto_configure_firewall: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DeploymentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DnsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_domain: Option<String>,
}

fn default_worktree_dir() -> String {
    "worktrees".to_string()
}

fn default_caddy_network() -> String {
    "dockertree_caddy_proxy".to_string()
}

/// `.dockertree/config.yml`, per spec §3's Project Config table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectConfig {
    pub project_name: String,

    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: String,

    #[serde(default = "default_caddy_network")]
    pub caddy_network: String,

    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,

    #[serde(default)]
    pub volumes: Vec<String>,

    /// Volumes in `volumes` that require the LiveSnapshot copy policy
    /// rather than FastCopy (relational database volumes).
    #[serde(default)]
    pub live_snapshot_volumes: Vec<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub protected_branches: Vec<String>,

    #[serde(default)]
    pub vpc: VpcConfig,

    #[serde(default)]
    pub deployment: DeploymentConfig,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl ProjectConfig {
    pub fn minimal(project_name: &str) -> Self {
        Self {
            project_name: project_name.to_string(),
            worktree_dir: default_worktree_dir(),
            caddy_network: default_caddy_network(),
            services: IndexMap::new(),
            volumes: Vec::new(),
            live_snapshot_volumes: Vec::new(),
            environment: BTreeMap::new(),
            protected_branches: Vec::new(),
            vpc: VpcConfig::default(),
            deployment: DeploymentConfig::default(),
            dns: DnsConfig::default(),
        }
    }

    pub fn project_name(&self) -> Result<ProjectName> {
        ProjectName::new(self.project_name.clone())
    }

    pub fn requires_live_snapshot(&self, volume: &str) -> bool {
        self.live_snapshot_volumes.iter().any(|v| v == volume)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DockertreeError::not_found(format!("{}: {e}", path.display())))?;
        let de = serde_yaml::Deserializer::from_str(&raw);
        serde_path_to_error::deserialize(de).map_err(|e| {
            DockertreeError::validation(format!("{}: {e}", path.display()))
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        }
        std::fs::write(path, yaml).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        Ok(())
    }
}

/// Global, per-user config at `~/.dockertree/env.dockertree`: provider
/// tokens and deployment defaults that should not live inside a project
/// repo. Loaded the same way the teacher locates its own config directory
/// (`directories::ProjectDirs`), but keyed by a line-oriented `KEY=VALUE`
/// format to match the env-file convention used everywhere else in this
/// crate rather than introducing a second serialization format.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub values: BTreeMap<String, String>,
}

impl GlobalConfig {
    pub fn path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "dockertree")
            .ok_or_else(|| DockertreeError::Other(eyre::eyre!("could not determine config directory")))?;
        Ok(dirs.config_dir().join("env.dockertree"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        Ok(Self {
            values: crate::env_file::parse_kv(&raw),
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_yaml() {
        let cfg = ProjectConfig::minimal("myapp");
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: ProjectConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.project_name, "myapp");
        assert_eq!(back.worktree_dir, "worktrees");
        assert_eq!(back.caddy_network, "dockertree_caddy_proxy");
    }

    #[test]
    fn missing_optional_keys_default() {
        let yaml = "project_name: myapp\n";
        let cfg: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.volumes.is_empty());
        assert!(cfg.services.is_empty());
        assert!(!cfg.vpc.auto_bind_ports);
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let err = ProjectConfig::load(Path::new("/nonexistent/config.yml")).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }
}
