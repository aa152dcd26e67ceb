//! Package Manager (C10): export/import bundles of a worktree's
//! environment, volumes, and (optionally) code, per spec §4.9/§6.2.
//!
//! No teacher equivalent. Grounded in the pack's choice of `tar` + `flate2`
//! for archive bundling and `sha2` for content checksums, composed with the
//! teacher's "throwaway container streams a tar of a volume" idiom from its
//! volume-copy path (`docker::run_throwaway_public`) for the per-volume
//! backup/restore step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bollard::Docker;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ProjectConfig;
use crate::docker;
use crate::env_file;
use crate::error::{DockertreeError, Result};
use crate::ids::{BranchName, StackName};
use crate::orchestrator::{self, Orchestrator};
use crate::vcs;

pub const PACKAGE_VERSION: u32 = 1;
const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
const ALPINE_IMAGE: &str = "docker.io/library/alpine:latest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub package_version: u32,
    pub tool_version: String,
    pub created_at: String,
    pub branch_name: String,
    pub project_name: String,
    pub git_commit: Option<String>,
    pub include_code: bool,
    pub volumes: Vec<String>,
    pub checksums: BTreeMap<String, String>,
    pub mode_hint: String,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub include_code: bool,
    /// Whether to back up declared named volumes at all. `false` is the
    /// code-only fast path used by `--code-only` pushes.
    pub include_data: bool,
    pub output_dir: PathBuf,
    pub compress: bool,
}

/// `packages export <B>`. Returns the path to the produced archive (or, if
/// `!compress`, the bundle directory).
pub async fn export(
    docker: &Docker,
    repo_path: &Path,
    orch: &Orchestrator<'_>,
    config: &ProjectConfig,
    branch_raw: &str,
    opts: ExportOptions,
    now: &str,
) -> Result<PathBuf> {
    let branch = orch.branch_name(branch_raw)?;
    let worktree_path = orch.worktree_path(&branch);
    orchestrator::require_exists(&worktree_path, &branch)?;
    let stack_name = orch.stack_name(&branch)?;

    let was_running = orch
        .list()
        .await?
        .into_iter()
        .find(|w| w.branch == branch.as_str())
        .map(|w| w.state == crate::orchestrator::WorktreeState::Running)
        .unwrap_or(false);

    if was_running {
        orch.stop(branch_raw).await?;
    }

    let result = export_inner(docker, repo_path, config, &branch, &stack_name, &worktree_path, &opts, now).await;

    if was_running {
        orch.start(branch_raw, true).await?;
    }

    result
}

async fn export_inner(
    docker: &Docker,
    repo_path: &Path,
    config: &ProjectConfig,
    branch: &BranchName,
    stack_name: &StackName,
    worktree_path: &Path,
    opts: &ExportOptions,
    now: &str,
) -> Result<PathBuf> {
    let bundle_dir = opts.output_dir.join(format!(".{}-export-tmp", stack_name));
    if bundle_dir.exists() {
        std::fs::remove_dir_all(&bundle_dir).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    }
    std::fs::create_dir_all(&bundle_dir).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    let env_dir = bundle_dir.join("environment");
    copy_environment(worktree_path, &env_dir)?;

    let mut volumes_backed_up = Vec::new();
    if opts.include_data && !config.volumes.is_empty() {
        let volumes_dir = bundle_dir.join("volumes");
        std::fs::create_dir_all(&volumes_dir).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        for declared in &config.volumes {
            let volume_name = stack_name.volume_name(declared);
            if !docker::volume_exists(docker, &volume_name).await? {
                continue;
            }
            backup_volume(docker, &volume_name, &volumes_dir.join(format!("{declared}.tar.gz"))).await?;
            volumes_backed_up.push(declared.clone());
        }
    }

    if opts.include_code {
        let code_dir = bundle_dir.join("code");
        std::fs::create_dir_all(&code_dir).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        vcs::archive(repo_path, branch, &code_dir.join(format!("{}.tar.gz", branch.path_segment()))).await?;
    }

    let git_commit = current_commit(repo_path, branch).await;
    let checksums = checksum_tree(&bundle_dir)?;

    let metadata = Metadata {
        package_version: PACKAGE_VERSION,
        tool_version: TOOL_VERSION.to_string(),
        created_at: now.to_string(),
        branch_name: branch.as_str().to_string(),
        project_name: config.project_name.clone(),
        git_commit,
        include_code: opts.include_code,
        volumes: volumes_backed_up,
        checksums,
        mode_hint: "normal".to_string(),
    };
    std::fs::write(
        bundle_dir.join("metadata.json"),
        serde_json::to_string_pretty(&metadata).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?,
    )
    .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    if !opts.compress {
        return Ok(bundle_dir);
    }

    let archive_name = format!("{}-{}-{now}.dockertree-package.tar.gz", config.project_name, branch.path_segment());
    let archive_path = opts.output_dir.join(&archive_name);
    compress_dir(&bundle_dir, &archive_path)?;
    std::fs::remove_dir_all(&bundle_dir).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(archive_path)
}

fn copy_environment(worktree_path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    let dotenv = worktree_path.join(".env");
    if dotenv.is_file() {
        std::fs::copy(&dotenv, dest.join(".env")).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    }

    let env_file_src = worktree_path.join(".dockertree").join(env_file::ENV_FILE_NAME);
    if env_file_src.is_file() {
        std::fs::copy(&env_file_src, dest.join(env_file::ENV_FILE_NAME))
            .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    }

    copy_dir_excluding(&worktree_path.join(".dockertree"), &dest.join(".dockertree"), &["worktrees", "locks", env_file::ENV_FILE_NAME])
}

fn copy_dir_excluding(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    for entry in std::fs::read_dir(src).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))? {
        let entry = entry.map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        let name = entry.file_name();
        if exclude.iter().any(|e| name == std::ffi::OsStr::new(e)) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if from.is_dir() {
            copy_dir_excluding(&from, &to, exclude)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        }
    }
    Ok(())
}

/// Streams a volume's contents to a `.tar.gz` via a throwaway container,
/// the same read-only-bind-mount idiom used by `docker::fastcopy_volume`.
async fn backup_volume(docker: &Docker, volume_name: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    }
    let container_dest = dest
        .parent()
        .ok_or_else(|| DockertreeError::Other(eyre::eyre!("backup destination has no parent directory")))?;
    let file_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DockertreeError::Other(eyre::eyre!("backup destination has no file name")))?;

    docker::run_throwaway_public(
        docker,
        ALPINE_IMAGE,
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("tar czf /out/{file_name} -C /from ."),
        ],
        vec![format!("{volume_name}:/from:ro"), format!("{}:/out", container_dest.display())],
    )
    .await
}

fn checksum_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::new();
    checksum_tree_inner(root, root, &mut checksums)?;
    Ok(checksums)
}

fn checksum_tree_inner(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))? {
        let entry = entry.map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        let path = entry.path();
        if path.is_dir() {
            checksum_tree_inner(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().into_owned();
            let bytes = std::fs::read(&path).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
            let digest = Sha256::digest(&bytes);
            out.insert(rel, hex::encode(digest));
        }
    }
    Ok(())
}

fn compress_dir(src: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::create(dest).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder
        .append_dir_all(".", src)
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    builder.finish().map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(())
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    let file = std::fs::File::open(archive).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    let dec = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(dec);
    archive.unpack(dest).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    Ok(())
}

fn unpack_code_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    let dec = flate2::read::GzDecoder::new(file);
    tar::Archive::new(dec)
        .unpack(dest)
        .map_err(|e| DockertreeError::Other(eyre::eyre!(e)))
}

async fn current_commit(repo_path: &Path, branch: &BranchName) -> Option<String> {
    let worktree_path = repo_path.join(".dockertree").join("worktrees").join(branch.path_segment());
    let target = if worktree_path.exists() { &worktree_path } else { repo_path };
    gix::open(target).ok()?.head_id().ok().map(|id| id.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Normal,
    Standalone,
}

pub struct ImportOptions {
    pub target_branch: Option<String>,
    pub restore_data: bool,
    pub mode: Option<ImportMode>,
    pub target_dir: Option<PathBuf>,
    pub domain: Option<String>,
    pub ip: Option<String>,
}

pub struct ImportReport {
    pub branch: String,
    pub worktree_path: PathBuf,
    pub mode: ImportMode,
}

/// `packages import <file>`. Validates every checksum in the manifest
/// before any side effect (§3 Invariants, §8 property 6).
pub async fn import(
    docker: &Docker,
    repo_path: &Path,
    orch: Option<&Orchestrator<'_>>,
    archive: &Path,
    opts: ImportOptions,
) -> Result<ImportReport> {
    if opts.domain.is_some() && opts.ip.is_some() {
        return Err(DockertreeError::validation("--domain and --ip are mutually exclusive"));
    }

    let mode = opts.mode.unwrap_or_else(|| {
        if orch.is_some() && repo_path.join(".git").exists() {
            ImportMode::Normal
        } else {
            ImportMode::Standalone
        }
    });

    let staging = tempfile::tempdir().map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    extract_archive(archive, staging.path())?;

    let metadata_path = staging.path().join("metadata.json");
    let raw = std::fs::read_to_string(&metadata_path)
        .map_err(|_| DockertreeError::Integrity { message: "package is missing metadata.json".to_string(), details: Vec::new() })?;
    let metadata: Metadata = serde_json::from_str(&raw).map_err(|e| DockertreeError::Integrity {
        message: format!("corrupted metadata.json: {e}"),
        details: Vec::new(),
    })?;

    verify_checksums(staging.path(), &metadata.checksums)?;

    if mode == ImportMode::Standalone && !metadata.include_code {
        return Err(DockertreeError::precondition(
            "standalone import requires a package exported with --include-code",
        ));
    }

    match mode {
        ImportMode::Normal => import_normal(docker, repo_path, orch, &staging.path().to_path_buf(), &metadata, &opts).await,
        ImportMode::Standalone => import_standalone(staging.path(), &metadata, &opts).await,
    }
}

/// `packages list`. Reads just `metadata.json` out of the archive stream
/// without extracting the rest, for a cheap per-file summary.
pub fn peek_metadata(archive: &Path) -> Result<Metadata> {
    let file = std::fs::File::open(archive).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    let dec = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(dec);
    let entries = tar.entries().map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
        if entry.path().map(|p| p == Path::new("metadata.json")).unwrap_or(false) {
            let mut raw = String::new();
            std::io::Read::read_to_string(&mut entry, &mut raw).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
            return serde_json::from_str(&raw).map_err(|e| DockertreeError::Integrity {
                message: format!("corrupted metadata.json: {e}"),
                details: Vec::new(),
            });
        }
    }
    Err(DockertreeError::Integrity {
        message: "package is missing metadata.json".to_string(),
        details: Vec::new(),
    })
}

/// `packages validate <file>`. Extracts to a scratch directory and verifies
/// every checksum without importing anything, for a dry-run sanity check.
pub fn validate(archive: &Path) -> Result<Metadata> {
    let staging = tempfile::tempdir().map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    extract_archive(archive, staging.path())?;

    let metadata_path = staging.path().join("metadata.json");
    let raw = std::fs::read_to_string(&metadata_path).map_err(|_| DockertreeError::Integrity {
        message: "package is missing metadata.json".to_string(),
        details: Vec::new(),
    })?;
    let metadata: Metadata = serde_json::from_str(&raw).map_err(|e| DockertreeError::Integrity {
        message: format!("corrupted metadata.json: {e}"),
        details: Vec::new(),
    })?;
    verify_checksums(staging.path(), &metadata.checksums)?;
    Ok(metadata)
}

fn verify_checksums(root: &Path, expected: &BTreeMap<String, String>) -> Result<()> {
    for (rel, expected_hash) in expected {
        let path = root.join(rel);
        let bytes = std::fs::read(&path).map_err(|_| DockertreeError::Integrity {
            message: format!("package is missing payload file '{rel}'"),
            details: Vec::new(),
        })?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if &actual != expected_hash {
            return Err(DockertreeError::Integrity {
                message: format!("checksum mismatch for '{rel}'"),
                details: vec![format!("expected {expected_hash}, got {actual}")],
            });
        }
    }
    Ok(())
}

async fn import_normal(
    docker: &Docker,
    repo_path: &Path,
    orch: Option<&Orchestrator<'_>>,
    staging: &PathBuf,
    metadata: &Metadata,
    opts: &ImportOptions,
) -> Result<ImportReport> {
    let orch = orch.ok_or_else(|| DockertreeError::precondition("normal-mode import requires a resolved .dockertree/config.yml"))?;

    let target_branch_raw = opts.target_branch.clone().unwrap_or_else(|| metadata.branch_name.clone());
    let branch = orch.branch_name(&target_branch_raw)?;
    let worktree_path = orch.worktree_path(&branch);
    if worktree_path.exists() {
        return Err(DockertreeError::AlreadyExists {
            message: format!("a worktree for '{branch}' already exists"),
            details: Vec::new(),
        });
    }

    vcs::worktree_add(repo_path, &branch, &worktree_path).await?;

    copy_dir_excluding(&staging.join("environment").join(".dockertree"), &worktree_path.join(".dockertree"), &[])?;
    let env_src = staging.join("environment").join(env_file::ENV_FILE_NAME);
    let env_dest = worktree_path.join(".dockertree").join(env_file::ENV_FILE_NAME);
    let stack_name = orch.stack_name(&branch)?;
    if env_src.is_file() {
        std::fs::copy(&env_src, &env_dest).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

        let old_stack = format!("{}-{}", metadata.project_name, metadata.branch_name);
        if old_stack != stack_name.as_str() {
            let ports = env_file::allocate_port_triple(&orch.ctx.worktrees_dir(&orch.config.worktree_dir))?;
            let mut values = env_file::read_values(&env_dest)?;
            env_file::rebind_stack(&mut values, &old_stack, &stack_name, ports);
            env_file::write_values(&env_dest, &values)?;
        }
    }
    apply_overrides(&env_dest, opts)?;

    if opts.restore_data {
        let volumes_dir = staging.join("volumes");
        if volumes_dir.is_dir() {
            for entry in std::fs::read_dir(&volumes_dir).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))? {
                let entry = entry.map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
                let Some(declared) = entry.path().file_stem().and_then(|s| s.to_str()).map(|s| s.trim_end_matches(".tar").to_string()) else {
                    continue;
                };
                let volume_name = stack_name.volume_name(&declared);
                restore_volume(docker, &entry.path(), &volume_name).await?;
            }
        }
    }

    let code_archive = staging.join("code").join(format!("{}.tar.gz", metadata.branch_name.replace('/', "-")));
    if metadata.include_code && code_archive.is_file() {
        unpack_code_archive(&code_archive, &worktree_path)?;
    }

    Ok(ImportReport { branch: branch.as_str().to_string(), worktree_path, mode: ImportMode::Normal })
}

async fn import_standalone(staging: &Path, metadata: &Metadata, opts: &ImportOptions) -> Result<ImportReport> {
    let target_dir = opts
        .target_dir
        .clone()
        .ok_or_else(|| DockertreeError::validation("--target-dir is required for standalone import"))?;
    std::fs::create_dir_all(&target_dir).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;

    let code_archive = staging.join("code").join(format!("{}.tar.gz", metadata.branch_name.replace('/', "-")));
    unpack_code_archive(&code_archive, &target_dir)?;

    copy_dir_excluding(&staging.join("environment").join(".dockertree"), &target_dir.join(".dockertree"), &[])?;
    let env_src = staging.join("environment").join(env_file::ENV_FILE_NAME);
    let env_dest = target_dir.join(".dockertree").join(env_file::ENV_FILE_NAME);
    if env_src.is_file() {
        std::fs::copy(&env_src, &env_dest).map_err(|e| DockertreeError::Other(eyre::eyre!(e)))?;
    }
    apply_overrides(&env_dest, opts)?;

    Ok(ImportReport { branch: metadata.branch_name.clone(), worktree_path: target_dir, mode: ImportMode::Standalone })
}

fn apply_overrides(env_path: &Path, opts: &ImportOptions) -> Result<()> {
    if opts.domain.is_none() && opts.ip.is_none() {
        return Ok(());
    }
    if !env_path.is_file() {
        return Ok(());
    }
    let mut values = env_file::read_values(env_path)?;
    env_file::apply_push_override(&mut values, opts.domain.as_deref(), opts.ip.as_deref());
    env_file::write_values(env_path, &values)
}

async fn restore_volume(docker: &Docker, archive_path: &Path, volume_name: &str) -> Result<()> {
    docker::volume_create(docker, volume_name).await?;
    let parent = archive_path
        .parent()
        .ok_or_else(|| DockertreeError::Other(eyre::eyre!("volume archive has no parent directory")))?;
    let file_name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DockertreeError::Other(eyre::eyre!("volume archive has no file name")))?;
    docker::run_throwaway_public(
        docker,
        ALPINE_IMAGE,
        vec!["tar".to_string(), "xzf".to_string(), format!("/in/{file_name}"), "-C".to_string(), "/to".to_string()],
        vec![format!("{}:/in:ro", parent.display()), format!("{volume_name}:/to")],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_tree_covers_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("metadata.json"), b"{}").unwrap();
        std::fs::create_dir_all(tmp.path().join("volumes")).unwrap();
        std::fs::write(tmp.path().join("volumes").join("db.tar.gz"), b"payload").unwrap();

        let sums = checksum_tree(tmp.path()).unwrap();
        assert_eq!(sums.len(), 2);
        assert!(sums.contains_key("metadata.json"));
    }

    #[test]
    fn tampered_payload_fails_checksum_verification() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"original").unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("a.txt".to_string(), hex::encode(Sha256::digest(b"original")));

        std::fs::write(tmp.path().join("a.txt"), b"tampered").unwrap();
        let err = verify_checksums(tmp.path(), &expected).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Integrity);
    }

    #[test]
    fn missing_payload_fails_checksum_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("missing.txt".to_string(), "deadbeef".to_string());
        let err = verify_checksums(tmp.path(), &expected).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Integrity);
    }
}
