//! VCS Adapter (C4): git worktree and branch management.
//!
//! Generalizes the teacher's `worktree.rs` (`create`/`list` over `git
//! worktree add`/`list --porcelain`). The `gix::open` validation-only check
//! is kept for the "is this a git repo" precondition; mutating operations
//! keep shelling out to the `git` binary rather than reimplementing them
//! against `gix`'s worktree-mutation feature, matching the teacher's own
//! choice.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{DockertreeError, Result};
use crate::ids::BranchName;

fn not_a_repo(repo_path: &Path, e: impl std::fmt::Display) -> DockertreeError {
    DockertreeError::precondition(format!("{} is not a git repository: {e}", repo_path.display()))
}

pub fn ensure_repo(repo_path: &Path) -> Result<()> {
    gix::open(repo_path).map_err(|e| not_a_repo(repo_path, e))?;
    Ok(())
}

async fn run_git(args: &[&str], dir: &Path) -> Result<std::process::Output> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(out)
}

fn tool_error(tool: &str, out: &std::process::Output) -> DockertreeError {
    let stderr_tail = String::from_utf8_lossy(&out.stderr);
    let stderr_tail = stderr_tail.lines().rev().take(20).collect::<Vec<_>>().join("\n");
    DockertreeError::Runtime {
        tool: tool.to_string(),
        exit_code: out.status.code().unwrap_or(-1),
        stderr_tail,
    }
}

/// `worktree_add(branch, path)` — create a multi-checkout at `path`,
/// creating the branch if it does not already exist.
pub async fn worktree_add(repo_path: &Path, branch: &BranchName, path: &Path) -> Result<PathBuf> {
    ensure_repo(repo_path)?;

    if path.exists() {
        return Err(DockertreeError::AlreadyExists {
            message: format!("a checkout already exists at {}", path.display()),
            details: Vec::new(),
        });
    }

    let branch_exists = run_git(
        &["show-ref", "--verify", "--quiet", &format!("refs/heads/{}", branch.as_str())],
        repo_path,
    )
    .await?
    .status
    .success();

    let path_str = path.to_string_lossy().into_owned();
    let mut args = vec!["worktree", "add"];
    if !branch_exists {
        args.push("-b");
        args.push(branch.as_str());
        args.push(&path_str);
    } else {
        args.push(&path_str);
        args.push(branch.as_str());
    }

    let out = run_git(&args, repo_path).await?;
    if !out.status.success() {
        return Err(tool_error("git worktree add", &out));
    }

    Ok(path.to_path_buf())
}

pub async fn worktree_remove(repo_path: &Path, path: &Path, force: bool) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let path_str = path.to_string_lossy().into_owned();
    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(&path_str);

    let out = run_git(&args, repo_path).await?;
    if !out.status.success() {
        return Err(tool_error("git worktree remove", &out));
    }
    Ok(())
}

pub async fn worktree_list(repo_path: &Path) -> Result<HashSet<PathBuf>> {
    let out = run_git(&["worktree", "list", "--porcelain"], repo_path).await?;
    if !out.status.success() {
        return Err(tool_error("git worktree list", &out));
    }
    let output = String::from_utf8_lossy(&out.stdout);
    Ok(output
        .lines()
        .filter_map(|line| line.strip_prefix("worktree ").map(PathBuf::from))
        .collect())
}

pub async fn worktree_prune(repo_path: &Path) -> Result<()> {
    let out = run_git(&["worktree", "prune"], repo_path).await?;
    if !out.status.success() {
        return Err(tool_error("git worktree prune", &out));
    }
    Ok(())
}

/// Refuses to delete protected branches; in `safe` mode also refuses to
/// delete branches with commits not merged into the default branch. `force`
/// bypasses both checks and is only set by the caller when the worktree
/// owning the branch is being intentionally deleted.
pub async fn branch_delete(
    repo_path: &Path,
    branch: &BranchName,
    protected: &[String],
    safe: bool,
) -> Result<()> {
    if branch.is_protected(protected) {
        return Err(DockertreeError::precondition(format!(
            "refusing to delete protected branch '{branch}'"
        )));
    }

    let flag = if safe { "-d" } else { "-D" };
    let out = run_git(&["branch", flag, branch.as_str()], repo_path).await?;
    if !out.status.success() {
        if safe {
            return Err(DockertreeError::precondition(format!(
                "branch '{branch}' has unmerged commits; pass --force to delete anyway"
            )));
        }
        return Err(tool_error("git branch -D", &out));
    }
    Ok(())
}

/// `archive(branch, out_path)` — reproducible code archive of a branch's
/// tree via `git archive`.
pub async fn archive(repo_path: &Path, branch: &BranchName, out_path: &Path) -> Result<()> {
    let out_str = out_path.to_string_lossy().into_owned();
    let out = run_git(
        &["archive", "--format=tar.gz", "-o", &out_str, branch.as_str()],
        repo_path,
    )
    .await?;
    if !out.status.success() {
        return Err(tool_error("git archive", &out));
    }
    Ok(())
}

/// List local branch names, used by `list`/completion.
pub async fn branch_list(repo_path: &Path) -> Result<Vec<String>> {
    let out = run_git(&["for-each-ref", "--format=%(refname:short)", "refs/heads/"], repo_path).await?;
    if !out.status.success() {
        return Err(tool_error("git for-each-ref", &out));
    }
    Ok(String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn worktree_add_rejects_existing_path() {
        let tmp = tempfile::tempdir().unwrap();
        let existing = tmp.path().join("already-here");
        std::fs::create_dir_all(&existing).unwrap();

        let branch = BranchName::new_unchecked("feature-x");
        let err = worktree_add(tmp.path(), &branch, &existing).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn branch_delete_refuses_protected() {
        let tmp = tempfile::tempdir().unwrap();
        let branch = BranchName::new_unchecked("main");
        let err = branch_delete(tmp.path(), &branch, &[], true).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PreconditionFailed);
    }
}
