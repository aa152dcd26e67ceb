//! `setup`: initializes `.dockertree/` in a project that does not have one
//! yet, per spec §4.1. No teacher equivalent (the teacher assumes a
//! `devcontainer.json` already exists); this is new, grounded in the
//! teacher's general "read, validate, fall back to a default" config style.

use std::path::{Path, PathBuf};

use crate::compose::{self, TransformOptions};
use crate::config::{ProjectConfig, CONFIG_DIR_NAME, CONFIG_FILE_NAME};
use crate::error::{DockertreeError, Result};
use crate::ids::ProjectName;
use crate::paths;
use crate::proxy;
use crate::vcs;

const MINIMAL_COMPOSE: &str = r#"services:
  web:
    build:
      context: .
    container_name: myapp-web
    ports:
      - "8000:8000"
    depends_on:
      - db
      - cache
    volumes:
      - app_data:/data
  db:
    image: postgres:16
    container_name: myapp-db
    ports:
      - "5432:5432"
    environment:
      POSTGRES_PASSWORD: postgres
    volumes:
      - db_data:/var/lib/postgresql/data
  cache:
    image: redis:7
    container_name: myapp-cache
    ports:
      - "6379:6379"
volumes:
  app_data: {}
  db_data: {}
"#;

const README_TEMPLATE: &str = r#"# .dockertree/

This directory is managed by `dockertree`. It is safe for an automated agent
or a human to read, but treat the following as authoritative:

- `config.yml` — project configuration (committed). Edit to add/declare
  named volumes, change the worktree directory, or set deployment defaults.
- `docker-compose.worktree.yml` — generated from the project's own compose
  file. Do not edit by hand; re-run `dockertree setup --force` or recreate
  worktrees after changing the source compose file.
- `worktrees/` — one directory per active branch, each itself a fractal
  `.dockertree/` checkout. Never edit files under here directly; use the
  `dockertree` CLI (`create`, `remove`, `delete`, ...).
- `env.dockertree` (inside a worktree) — generated per-branch environment.
  `COMPOSE_PROJECT_NAME`, `SITE_DOMAIN`, and the `DOCKERTREE_*_HOST_PORT`
  keys are consumed directly by the worktree compose variant.

Common commands:

```
dockertree create <branch>
dockertree <branch> up -d
dockertree list
dockertree <branch> down
dockertree delete <branch>
```
"#;

#[derive(Debug, Default)]
pub struct SetupOptions {
    pub project_name: Option<String>,
    /// Also patches the project's `.gitignore` to exclude generated
    /// worktree state (`.dockertree/worktrees/`, `env.dockertree`), since a
    /// bare `git status` in the project root would otherwise show every
    /// worktree's fractal `.dockertree/` copy as untracked noise.
    pub monkey_patch: bool,
    pub force: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct SetupReport {
    pub project_root: PathBuf,
    pub project_name: String,
    pub created_compose_skeleton: bool,
    pub already_existed: bool,
    pub warnings: Vec<String>,
}

fn derive_project_name(project_root: &Path) -> Result<ProjectName> {
    let dir_name = project_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    let sanitized: String = dir_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    ProjectName::new(sanitized)
}

pub async fn run(project_root: &Path, opts: SetupOptions) -> Result<SetupReport> {
    vcs::ensure_repo(project_root)?;

    let config_dir = project_root.join(CONFIG_DIR_NAME);
    let config_path = config_dir.join(CONFIG_FILE_NAME);

    if config_path.is_file() && !opts.force {
        let existing = ProjectConfig::load(&config_path)?;
        return Ok(SetupReport {
            project_root: project_root.to_path_buf(),
            project_name: existing.project_name,
            created_compose_skeleton: false,
            already_existed: true,
            warnings: vec!["config.yml already exists; pass --force to overwrite".to_string()],
        });
    }

    let project_name = match &opts.project_name {
        Some(n) => ProjectName::new(n.clone())?,
        None => derive_project_name(project_root)?,
    };

    let mut created_compose_skeleton = false;
    let compose_source = match compose::find_source(project_root) {
        Ok(path) => path,
        Err(_) => {
            let path = project_root.join("docker-compose.yml");
            std::fs::write(&path, MINIMAL_COMPOSE).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
            created_compose_skeleton = true;
            path
        }
    };

    let source_yaml = std::fs::read_to_string(&compose_source)
        .map_err(|e| DockertreeError::Other(eyre::eyre!("{}: {e}", compose_source.display())))?;

    let mut config = ProjectConfig::minimal(project_name.as_str());
    // Seed the declared volumes list once, at setup time, from whatever the
    // source compose file already declares. After this the two are tracked
    // independently: later compose-file edits that add volumes are flagged
    // by the transformer's warnings (§9 Open Questions), not auto-merged.
    let transform_opts = TransformOptions {
        caddy_network: &config.caddy_network,
        web_class_markers: &[],
    };
    let transformed = compose::transform(&source_yaml, &transform_opts)?;
    config.volumes = transformed.declared_volumes.clone();
    if created_compose_skeleton {
        config.live_snapshot_volumes = vec!["db_data".to_string()];
    }

    config.write(&config_path)?;

    let worktree_compose_path = config_dir.join("docker-compose.worktree.yml");
    std::fs::write(&worktree_compose_path, compose::serialize(&transformed.compose)?)
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    std::fs::write(config_dir.join("README.md"), README_TEMPLATE)
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    std::fs::write(
        paths::ResolvedContext {
            project_root: project_root.to_path_buf(),
            config_dir: config_dir.clone(),
            config_path: config_path.clone(),
            is_worktree_local: false,
        }
        .proxy_template_path(),
        serde_json::to_string_pretty(&proxy::static_template()).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?,
    )
    .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    std::fs::create_dir_all(project_root.join(&config.worktree_dir))
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    let mut warnings = transformed.warnings;
    if opts.monkey_patch {
        patch_gitignore(project_root)?;
    }

    Ok(SetupReport {
        project_root: project_root.to_path_buf(),
        project_name: project_name.as_str().to_string(),
        created_compose_skeleton,
        already_existed: false,
        warnings: std::mem::take(&mut warnings),
    })
}

fn patch_gitignore(project_root: &Path) -> Result<()> {
    let path = project_root.join(".gitignore");
    let entries = ["/.dockertree/worktrees/", ".dockertree/env.dockertree"];
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    let mut appended = String::new();
    for entry in entries {
        if !existing.lines().any(|l| l.trim() == entry) {
            appended.push_str(entry);
            appended.push('\n');
        }
    }
    if appended.is_empty() {
        return Ok(());
    }
    let mut combined = existing;
    if !combined.is_empty() && !combined.ends_with('\n') {
        combined.push('\n');
    }
    combined.push_str(&appended);
    std::fs::write(&path, combined).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_project_name_from_directory() {
        let name = derive_project_name(Path::new("/home/dev/My_App")).unwrap();
        assert_eq!(name.as_str(), "my-app");
    }
}
