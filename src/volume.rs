//! Volume Cloner (C7): `volume_copy(src, dst, policy)`.
//!
//! FastCopy is the teacher's own `cli/copy.rs` throwaway-container pattern,
//! reused verbatim via `docker::fastcopy_volume`. LiveSnapshot has no
//! teacher counterpart (the teacher never clones a live database) and is
//! built in the same throwaway-container idiom: a client container joins
//! the live database container's network and runs `pg_dumpall` against it
//! over the wire, then a fresh instance bound to the destination volume
//! replays the dump. `src`'s volume is never bind-mounted anywhere — the
//! live container keeps exclusive use of it throughout.

use std::time::Duration;

use bollard::Docker;
use tokio::time::timeout;

use crate::docker;
use crate::error::{DockertreeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPolicy {
    FastCopy,
    LiveSnapshot,
}

/// Decide which policy applies: LiveSnapshot only when `src` is a declared
/// database volume *and* a container currently using it is running.
pub async fn choose_policy(docker: &Docker, src: &str, is_database_volume: bool) -> Result<CopyPolicy> {
    if !is_database_volume {
        return Ok(CopyPolicy::FastCopy);
    }
    let users = docker::containers_using_volume(docker, src).await?;
    if users.is_empty() {
        return Ok(CopyPolicy::FastCopy);
    }
    if docker::containers_are_running(docker, &users).await? {
        Ok(CopyPolicy::LiveSnapshot)
    } else {
        Ok(CopyPolicy::FastCopy)
    }
}

pub struct LiveSnapshotSpec<'a> {
    /// Image used for both the dump client and the replay instance.
    pub db_image: &'a str,
    /// Superuser/role used for both the dump and the replay.
    pub db_user: &'a str,
    /// Environment passed to both containers (credentials, auth method).
    pub env: Vec<String>,
}

/// `volume_copy(src, dst, policy)`. If `src` does not exist, a fresh empty
/// `dst` is created instead (newly initialized worktrees for empty
/// projects).
pub async fn volume_copy(
    docker: &Docker,
    src: &str,
    dst: &str,
    policy: CopyPolicy,
    live: Option<&LiveSnapshotSpec<'_>>,
) -> Result<()> {
    docker::volume_create(docker, dst).await?;

    if !docker::volume_exists(docker, src).await? {
        return Ok(());
    }

    let result = match policy {
        CopyPolicy::FastCopy => {
            timeout(Duration::from_secs(600), docker::fastcopy_volume(docker, src, dst))
                .await
                .map_err(|_| DockertreeError::Timeout {
                    operation: format!("volume_copy({src} -> {dst})"),
                    elapsed_secs: 600,
                })?
        }
        CopyPolicy::LiveSnapshot => {
            let spec = live.ok_or_else(|| DockertreeError::VolumeCopyFailed {
                message: "LiveSnapshot policy requested without a snapshot spec".to_string(),
                details: Vec::new(),
            })?;
            timeout(Duration::from_secs(1800), live_snapshot(docker, src, dst, spec))
                .await
                .map_err(|_| DockertreeError::Timeout {
                    operation: format!("volume_copy live snapshot({src} -> {dst})"),
                    elapsed_secs: 1800,
                })?
        }
    };

    if let Err(e) = result {
        docker::volume_remove(docker, dst).await.ok();
        return Err(e);
    }
    Ok(())
}

async fn live_snapshot(docker: &Docker, src: &str, dst: &str, spec: &LiveSnapshotSpec<'_>) -> Result<()> {
    let live = docker::find_live_container(docker, src)
        .await
        .map_err(to_volume_copy_failed)?
        .ok_or_else(|| DockertreeError::VolumeCopyFailed {
            message: format!("no running container is using volume '{src}'"),
            details: Vec::new(),
        })?;

    // 1. One-shot dump: a client container joins the live container's
    // network and runs `pg_dumpall` against it, streaming the result into
    // an intermediate file inside `dst` (mounted at `/data`) rather than
    // ever touching `src`'s own files.
    let dump_script = format!("pg_dumpall -h '{host}' -U '{user}' > /data/dump.sql", host = live.alias, user = spec.db_user);
    docker::run_db_container(docker, spec.db_image, &dump_script, vec![format!("{dst}:/data")], spec.env.clone(), Some(&live.network))
        .await
        .map_err(to_volume_copy_failed)?;

    // 2. Start a fresh instance bound to `dst` and replay the dump. `PGDATA`
    // is a subdirectory of `/data` so the sibling `dump.sql` doesn't trip
    // `initdb`'s empty-directory check.
    let restore_script = format!(
        "docker-entrypoint.sh postgres &\n\
         until pg_isready -U '{user}' >/dev/null 2>&1; do sleep 1; done\n\
         psql -U '{user}' -f /data/dump.sql\n\
         pg_ctl -D \"$PGDATA\" -m fast -w stop",
        user = spec.db_user,
    );
    let mut restore_env = spec.env.clone();
    restore_env.push("PGDATA=/data/pgdata".to_string());
    docker::run_db_container(docker, spec.db_image, &restore_script, vec![format!("{dst}:/data")], restore_env, None)
        .await
        .map_err(to_volume_copy_failed)?;

    Ok(())
}

fn to_volume_copy_failed(e: DockertreeError) -> DockertreeError {
    match e {
        DockertreeError::VolumeCopyFailed { .. } => e,
        other => DockertreeError::VolumeCopyFailed {
            message: other.to_string(),
            details: Vec::new(),
        },
    }
}
