//! Worktree Orchestrator (C8): the linear state machine `Absent -> Created ->
//! {Running <-> Stopped} -> Absent`, per spec §4.4.
//!
//! No teacher counterpart exists for the forward `create` path (the teacher
//! never clones named volumes or writes an env file), but the rollback
//! shape generalizes the teacher's `cli/destroy.rs`/`cli/prune.rs` cleanup
//! sequence: bring the stack down, remove sidecar runtime objects, remove
//! the worktree. `create` reuses that same "tear down everything prefixed
//! by this identity" idiom as its reverse-order rollback.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bollard::Docker;
use fs2::FileExt;
use tokio::sync::Mutex;

use crate::compose;
use crate::config::ProjectConfig;
use crate::docker;
use crate::env_file::{self, EnvFileBuilder};
use crate::error::{DockertreeError, Result};
use crate::ids::{glob_match, BranchName, ProjectName, StackName};
use crate::paths::ResolvedContext;
use crate::vcs;
use crate::volume::{self, CopyPolicy, LiveSnapshotSpec};

/// Per-invocation branch serialization: an in-process `tokio::sync::Mutex`
/// keyed by branch name, plus a filesystem advisory lock on the worktree
/// root. Constructed explicitly by the caller (the CLI entry point, or the
/// RPC server once per process) rather than reached for as global state.
#[derive(Default, Clone)]
pub struct BranchLocks {
    inner: Arc<std::sync::Mutex<std::collections::HashMap<String, Arc<Mutex<()>>>>>,
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, branch: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("branch lock map poisoned");
        map.entry(branch.to_string()).or_default().clone()
    }

    /// Runs `f` while holding both the in-process lock for `branch` and a
    /// `flock`-style advisory lock on `lock_path` (created if absent).
    pub async fn with_branch_lock<T>(
        &self,
        branch: &str,
        lock_path: &Path,
        f: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let handle = self.handle(branch);
        let _guard = handle.lock().await;

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_path)
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        file.lock_exclusive()
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

        let result = f.await;
        let _ = file.unlock();
        result
    }
}

/// Best-effort cooperative cancellation: checked between orchestrator steps,
/// not mid-syscall. A true mid-blocking-call abort would require signalling
/// the spawned child process directly; this flag gives callers (e.g. a
/// signal handler installed by the CLI) a way to stop the *next* step from
/// starting and trigger the rollback chain of the step in progress.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.0.load(Ordering::SeqCst) {
            return Err(DockertreeError::Cancelled { details: Vec::new() });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeState {
    Absent,
    Created,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Worktree {
    pub branch: String,
    pub path: PathBuf,
    pub created_at: Option<String>,
    pub state: WorktreeState,
    pub stack_name: String,
}

#[derive(Clone, Copy)]
pub struct Orchestrator<'a> {
    pub docker: &'a Docker,
    pub repo_path: &'a Path,
    pub ctx: &'a ResolvedContext,
    pub config: &'a ProjectConfig,
    pub locks: &'a BranchLocks,
}

impl<'a> Orchestrator<'a> {
    pub(crate) fn project_name(&self) -> Result<ProjectName> {
        self.config.project_name()
    }

    pub(crate) fn branch_name(&self, raw: &str) -> Result<BranchName> {
        BranchName::new(raw, &self.config.protected_branches)
    }

    pub(crate) fn worktree_path(&self, branch: &BranchName) -> PathBuf {
        self.ctx
            .worktrees_dir(&self.config.worktree_dir)
            .join(branch.path_segment())
    }

    fn lock_path(&self, branch: &BranchName) -> PathBuf {
        self.ctx
            .config_dir
            .join("locks")
            .join(format!("{}.lock", branch.path_segment()))
    }

    pub(crate) fn stack_name(&self, branch: &BranchName) -> Result<StackName> {
        Ok(StackName::new(&self.project_name()?, branch))
    }

    fn compose_source(&self, worktree_path: &Path) -> Result<PathBuf> {
        compose::find_source(worktree_path)
    }

    pub(crate) fn stack_files(&self, worktree_path: &Path) -> Result<Vec<PathBuf>> {
        let source = self.compose_source(worktree_path)?;
        let derived = worktree_path.join(".dockertree").join("docker-compose.worktree.yml");
        Ok(vec![source, derived])
    }

    /// **create(B)**: Absent -> Created.
    pub async fn create(&self, branch_raw: &str, cancel: &CancelToken) -> Result<Worktree> {
        let branch = self.branch_name(branch_raw)?;
        let worktree_path = self.worktree_path(&branch);
        let lock_path = self.lock_path(&branch);

        self.locks
            .with_branch_lock(branch.as_str(), &lock_path, self.create_inner(&branch, &worktree_path, cancel))
            .await
    }

    async fn create_inner(&self, branch: &BranchName, worktree_path: &Path, cancel: &CancelToken) -> Result<Worktree> {
        cancel.check()?;
        if worktree_path.exists() {
            return Err(DockertreeError::AlreadyExists {
                message: format!("a worktree for '{branch}' already exists at {}", worktree_path.display()),
                details: Vec::new(),
            });
        }

        // Step 2: worktree_add. Rollback: worktree_remove.
        vcs::worktree_add(self.repo_path, branch, worktree_path).await?;
        let result = self.create_after_checkout(branch, worktree_path, cancel).await;
        if let Err(e) = result {
            self.rollback_create(branch, worktree_path).await;
            return Err(e);
        }
        result
    }

    async fn create_after_checkout(&self, branch: &BranchName, worktree_path: &Path, cancel: &CancelToken) -> Result<Worktree> {
        cancel.check()?;

        // Step 3: fractal copy of .dockertree/ (excluding worktrees/).
        copy_dockertree_fractal(&self.ctx.config_dir, &worktree_path.join(".dockertree"))?;
        cancel.check()?;

        let stack_name = self.stack_name(branch)?;

        // Step 4: allocate a host-port triple unique across existing worktrees.
        let worktrees_dir = self.ctx.worktrees_dir(&self.config.worktree_dir);
        let ports = env_file::allocate_port_triple(&worktrees_dir)?;
        cancel.check()?;

        // Step 5: write env.dockertree.
        let env_path = env_file::env_path_for(worktree_path);
        EnvFileBuilder {
            stack_name: stack_name.clone(),
            ports,
        }
        .write(&env_path)?;
        cancel.check()?;

        // Step 6: for each declared volume, create + copy.
        let mut created_volumes = Vec::new();
        for declared in &self.config.volumes {
            cancel.check()?;
            let src = declared.clone();
            let dst = stack_name.volume_name(declared);
            let is_db = self.config.requires_live_snapshot(declared);
            let policy = volume::choose_policy(self.docker, &src, is_db).await?;
            let live_spec = if policy == CopyPolicy::LiveSnapshot {
                Some(default_live_snapshot_spec())
            } else {
                None
            };
            let copy_result = volume::volume_copy(self.docker, &src, &dst, policy, live_spec.as_ref()).await;
            created_volumes.push(dst.clone());
            if let Err(e) = copy_result {
                for v in &created_volumes {
                    docker::volume_remove(self.docker, v).await.ok();
                }
                return Err(e);
            }
        }

        Ok(Worktree {
            branch: branch.as_str().to_string(),
            path: worktree_path.to_path_buf(),
            created_at: worktree_created_at(worktree_path),
            state: WorktreeState::Created,
            stack_name: stack_name.as_str().to_string(),
        })
    }

    /// Undo, in reverse order, whatever of `create`'s steps already ran.
    async fn rollback_create(&self, branch: &BranchName, worktree_path: &Path) {
        if let Ok(stack_name) = self.stack_name(branch) {
            for v in docker::volume_list(self.docker, &format!("{stack_name}_")).await.unwrap_or_default() {
                docker::volume_remove(self.docker, &v).await.ok();
            }
        }
        let _ = std::fs::remove_file(env_file::env_path_for(worktree_path));
        vcs::worktree_remove(self.repo_path, worktree_path, true).await.ok();
    }

    /// **start(B)**: Created|Stopped -> Running.
    pub async fn start(&self, branch_raw: &str, detach: bool) -> Result<()> {
        let branch = self.branch_name(branch_raw)?;
        let worktree_path = self.worktree_path(&branch);
        require_exists(&worktree_path, &branch)?;

        self.locks
            .with_branch_lock(branch.as_str(), &self.lock_path(&branch), async {
                let stack_name = self.stack_name(&branch)?;
                docker::ensure_network(self.docker, &self.config.caddy_network).await?;

                let stack_files = self.stack_files(&worktree_path)?;
                let env_path = env_file::env_path_for(&worktree_path);
                docker::stack_up(&stack_files, stack_name.as_str(), &env_path, detach, &worktree_path).await?;
                self.reconcile_proxy().await;
                Ok(())
            })
            .await
    }

    /// **stop(B)**: Running -> Stopped.
    pub async fn stop(&self, branch_raw: &str) -> Result<()> {
        let branch = self.branch_name(branch_raw)?;
        let worktree_path = self.worktree_path(&branch);
        require_exists(&worktree_path, &branch)?;

        self.locks
            .with_branch_lock(branch.as_str(), &self.lock_path(&branch), async {
                let stack_name = self.stack_name(&branch)?;
                let stack_files = self.stack_files(&worktree_path)?;
                let env_path = env_file::env_path_for(&worktree_path);
                docker::stack_down(&stack_files, stack_name.as_str(), &env_path, false, &worktree_path).await?;
                self.reconcile_proxy().await;
                Ok(())
            })
            .await
    }

    /// Best-effort: pushes fresh routing configuration to the proxy after a
    /// lifecycle transition that can add or remove a labeled container.
    /// Never fails the caller's transition — if the proxy isn't running
    /// (spec §4.8 requires it to be for configuration to be produced), this
    /// just logs and moves on; the next `start-proxy` or lifecycle
    /// transition will reconcile again.
    async fn reconcile_proxy(&self) {
        if let Err(e) = crate::proxy::reconcile(self.docker).await {
            tracing::warn!(error = %e, "proxy reconcile failed (is the proxy running?)");
        }
    }

    /// **remove(B)**: any -> Absent, branch preserved. Best-effort: on
    /// partial failure, the error's `details` list the runtime objects
    /// still left behind.
    pub async fn remove(&self, branch_raw: &str) -> Result<()> {
        let branch = self.branch_name(branch_raw)?;
        self.locks
            .with_branch_lock(branch.as_str(), &self.lock_path(&branch), async {
                let result = self.remove_worktree_only(&branch).await;
                self.reconcile_proxy().await;
                result
            })
            .await
    }

    async fn remove_worktree_only(&self, branch: &BranchName) -> Result<()> {
        let worktree_path = self.worktree_path(branch);
        let stack_name = self.stack_name(branch)?;
        let mut leftovers = Vec::new();

        if worktree_path.exists() {
            let stack_files = self.stack_files(&worktree_path).unwrap_or_default();
            let env_path = env_file::env_path_for(&worktree_path);
            if !stack_files.is_empty() && env_path.exists() {
                if let Err(e) = docker::stack_down(&stack_files, stack_name.as_str(), &env_path, false, &worktree_path).await {
                    leftovers.push(format!("stack_down failed: {e}"));
                }
            }
        }

        for v in docker::volume_list(self.docker, &format!("{stack_name}_")).await.unwrap_or_default() {
            if let Err(e) = docker::volume_remove(self.docker, &v).await {
                leftovers.push(format!("volume {v}: {e}"));
            }
        }

        if let Err(e) = vcs::worktree_remove(self.repo_path, &worktree_path, true).await {
            leftovers.push(format!("worktree_remove: {e}"));
        }

        if leftovers.is_empty() {
            Ok(())
        } else {
            Err(DockertreeError::Runtime {
                tool: "remove".to_string(),
                exit_code: 1,
                stderr_tail: leftovers.join("; "),
            })
        }
    }

    /// **delete(B)**: as `remove`, plus `branch_delete(B, safe=true)`,
    /// bypassed only with explicit `force`.
    pub async fn delete(&self, branch_raw: &str, force: bool) -> Result<()> {
        let branch = self.branch_name(branch_raw)?;
        self.locks
            .with_branch_lock(branch.as_str(), &self.lock_path(&branch), async {
                self.remove_worktree_only(&branch).await?;
                self.reconcile_proxy().await;
                vcs::branch_delete(self.repo_path, &branch, &self.config.protected_branches, !force).await
            })
            .await
    }

    /// Branch names currently backed by a worktree, for `list`/completion.
    pub async fn list(&self) -> Result<Vec<Worktree>> {
        let worktrees_dir = self.ctx.worktrees_dir(&self.config.worktree_dir);
        if !worktrees_dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&worktrees_dir).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))? {
            let entry = entry.map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let branch = entry.file_name().to_string_lossy().into_owned();
            let stack_name = self
                .project_name()
                .ok()
                .map(|p| format!("{p}-{branch}"))
                .unwrap_or_default();
            let state = self.container_state(&stack_name).await;
            out.push(Worktree {
                branch,
                created_at: worktree_created_at(&path),
                state,
                stack_name,
                path,
            });
        }
        out.sort_by(|a, b| a.branch.cmp(&b.branch));
        Ok(out)
    }

    async fn container_state(&self, stack_name: &str) -> WorktreeState {
        let mut filters = std::collections::HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("com.docker.compose.project={stack_name}")],
        );
        let containers = self
            .docker
            .list_containers(Some(bollard::query_parameters::ListContainersOptions {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .unwrap_or_default();
        if containers.is_empty() {
            return WorktreeState::Created;
        }
        if containers.iter().any(|c| c.state.as_deref() == Some("running")) {
            WorktreeState::Running
        } else {
            WorktreeState::Stopped
        }
    }

    /// Branches matching a glob pattern (`*`, `?`, `[...]`), case-insensitive,
    /// for bulk `remove`/`delete`. A strict subset of `list`'s output, per
    /// the Testable Properties (§8).
    pub async fn matching(&self, pattern: &str) -> Result<Vec<String>> {
        let all = self.list().await?;
        Ok(all
            .into_iter()
            .map(|w| w.branch)
            .filter(|b| glob_match(pattern, b))
            .collect())
    }
}

pub(crate) fn require_exists(worktree_path: &Path, branch: &BranchName) -> Result<()> {
    if !worktree_path.exists() {
        return Err(DockertreeError::not_found(format!("no worktree for branch '{branch}'")));
    }
    Ok(())
}

fn worktree_created_at(path: &Path) -> Option<String> {
    let metadata = std::fs::metadata(path).ok()?;
    let created = metadata.created().or_else(|_| metadata.modified()).ok()?;
    let timestamp = jiff::Timestamp::try_from(created).ok()?;
    Some(timestamp.to_string())
}

/// Recursively copies `src` (a `.dockertree/` directory) into `dst`,
/// skipping the `worktrees/` subtree so a worktree never embeds its own
/// siblings — the Fractal Structure invariant (spec §3).
fn copy_dockertree_fractal(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    for entry in std::fs::read_dir(src).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))? {
        let entry = entry.map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        let name = entry.file_name();
        if name == "worktrees" || name == "locks" {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if from.is_dir() {
            copy_dockertree_fractal(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        }
    }
    Ok(())
}

fn default_live_snapshot_spec() -> LiveSnapshotSpec<'static> {
    LiveSnapshotSpec {
        db_image: "postgres:16",
        db_user: "postgres",
        env: vec![
            "POSTGRES_USER=postgres".to_string(),
            "POSTGRES_PASSWORD=postgres".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_places_running_highest() {
        assert!(WorktreeState::Running > WorktreeState::Stopped);
        assert!(WorktreeState::Stopped > WorktreeState::Created);
        assert!(WorktreeState::Created > WorktreeState::Absent);
    }
}
