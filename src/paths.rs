//! Path Resolver (C2): finds the nearest `.dockertree/config.yml`, walking
//! from the current directory toward the filesystem root.
//!
//! Grounded in the precedence-ordered candidate search used by devcontainer
//! discovery in the pack (`get2knowio-deacon`'s `DevContainer::load`), since
//! the teacher has no per-project config file of its own to discover —
//! it only ever reads a single global one.

use std::path::{Path, PathBuf};

use crate::config::{CONFIG_DIR_NAME, CONFIG_FILE_NAME};
use crate::error::{DockertreeError, Result};

#[derive(Debug, Clone)]
pub struct ResolvedContext {
    /// Directory containing `.dockertree/`.
    pub project_root: PathBuf,
    pub config_dir: PathBuf,
    pub config_path: PathBuf,
    /// True when `project_root` is itself a worktree created by this tool
    /// (its `.dockertree/` is a fractal copy, not the original).
    pub is_worktree_local: bool,
}

impl ResolvedContext {
    pub fn worktrees_dir(&self, worktree_dir_name: &str) -> PathBuf {
        self.project_root.join(worktree_dir_name)
    }

    pub fn compose_worktree_path(&self) -> PathBuf {
        self.config_dir.join("docker-compose.worktree.yml")
    }

    pub fn proxy_template_path(&self) -> PathBuf {
        self.config_dir.join("caddy.template.json")
    }
}

/// Walk upward from `start` looking for `.dockertree/config.yml`. A
/// directory also holding a `.git` (file or directory, to tolerate
/// worktrees whose `.git` is a pointer file) marks the VCS root and is
/// preferred when both a VCS root and a config directory are found at the
/// same level.
pub fn resolve_nearest(start: &Path) -> Result<ResolvedContext> {
    let start = start
        .canonicalize()
        .map_err(|e| DockertreeError::Other(eyre::eyre!("{}: {e}", start.display())))?;

    for dir in start.ancestors() {
        let config_dir = dir.join(CONFIG_DIR_NAME);
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        if config_path.is_file() {
            let git_path = dir.join(".git");
            let is_worktree_local = !config_dir.join("worktrees").exists()
                && git_path.exists()
                && git_path.is_file();
            return Ok(ResolvedContext {
                project_root: dir.to_path_buf(),
                config_dir,
                config_path,
                is_worktree_local,
            });
        }
    }

    Err(DockertreeError::not_found(format!(
        "no {CONFIG_DIR_NAME}/{CONFIG_FILE_NAME} found above {}",
        start.display()
    )))
}

/// Same walk, but returns `None` instead of an error: used by `setup`,
/// which must tolerate the "nothing found yet" case.
pub fn try_resolve_nearest(start: &Path) -> Option<ResolvedContext> {
    resolve_nearest(start).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_config_in_current_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(CONFIG_DIR_NAME);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILE_NAME), "project_name: demo\n").unwrap();

        let ctx = resolve_nearest(tmp.path()).unwrap();
        assert_eq!(ctx.project_root, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn finds_config_in_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(CONFIG_DIR_NAME);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILE_NAME), "project_name: demo\n").unwrap();

        let nested = tmp.path().join("a").join("b").join("c");
        fs::create_dir_all(&nested).unwrap();

        let ctx = resolve_nearest(&nested).unwrap();
        assert_eq!(ctx.project_root, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn missing_config_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_nearest(tmp.path()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }
}
