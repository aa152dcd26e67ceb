//! Programmatic surface (C12, spec §6.5): an `axum` HTTP server mirroring
//! the CLI command tree with identical semantics and JSON schemas. Every
//! route accepts a mandatory `working_directory` field and shares the same
//! request structs and `{success, operation, data, error, timestamp}`
//! response envelope as `--json` CLI output (`cli::envelope`).
//!
//! Grounded in `tftio-gator`'s `gator-cli` `serve_cmd` module: a thin
//! `axum::Router` with one route per operation, `with_state`-free since
//! every handler re-discovers its own project context per request rather
//! than sharing a pool.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::cli::{self, droplet, packages, volumes};
use crate::config::{CONFIG_DIR_NAME, CONFIG_FILE_NAME};
use crate::error::{DockertreeError, Result};

/// Wraps an operation's own request fields with the mandatory
/// `working_directory` every programmatic call carries (spec §6.5).
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    working_directory: PathBuf,
    #[serde(flatten)]
    body: T,
}

/// Empty request body for operations with no fields besides
/// `working_directory` (e.g. `list`, `prune`, `start-proxy`).
#[derive(Debug, Deserialize)]
struct Empty {}

fn project_exists(working_directory: &Path) -> bool {
    working_directory.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME).exists()
}

/// Validates the precondition spec §6.5 requires before any mutating call:
/// `working_directory` must contain a `.dockertree/config.yml`. `setup` is
/// the one operation exempt, since it is what creates that file.
fn require_project(working_directory: &Path) -> Result<()> {
    if project_exists(working_directory) {
        Ok(())
    } else {
        Err(DockertreeError::precondition(format!(
            "'{}' does not contain {CONFIG_DIR_NAME}/{CONFIG_FILE_NAME}",
            working_directory.display()
        )))
    }
}

/// Scopes `run` to `working_directory` via [`cli::with_working_dir`], runs
/// the precondition check (unless `operation` is exempt), and wraps the
/// outcome in the same envelope `--json` CLI output uses.
async fn dispatch<F, Fut>(operation: &'static str, working_directory: PathBuf, gate: bool, run: F) -> Json<serde_json::Value>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<serde_json::Value>>,
{
    let result = async {
        if gate {
            require_project(&working_directory)?;
        }
        cli::with_working_dir(working_directory, run()).await
    }
    .await;
    Json(cli::envelope(operation, &result))
}

async fn setup(Json(req): Json<Envelope<cli::setup::Setup>>) -> Json<serde_json::Value> {
    dispatch("setup", req.working_directory, false, || req.body.run()).await
}

async fn proxy_start(Json(req): Json<Envelope<Empty>>) -> Json<serde_json::Value> {
    dispatch("start-proxy", req.working_directory, true, cli::proxy::start).await
}

async fn proxy_stop(Json(req): Json<Envelope<Empty>>) -> Json<serde_json::Value> {
    dispatch("stop-proxy", req.working_directory, true, cli::proxy::stop).await
}

async fn create(Json(req): Json<Envelope<cli::create::Create>>) -> Json<serde_json::Value> {
    dispatch("create", req.working_directory, true, || req.body.run()).await
}

async fn remove(Json(req): Json<Envelope<cli::remove::Remove>>) -> Json<serde_json::Value> {
    dispatch("remove", req.working_directory, true, || req.body.run()).await
}

async fn delete(Json(req): Json<Envelope<cli::remove::Delete>>) -> Json<serde_json::Value> {
    dispatch("delete", req.working_directory, true, || req.body.run()).await
}

async fn remove_all(Json(req): Json<Envelope<cli::remove::RemoveAll>>) -> Json<serde_json::Value> {
    dispatch("remove-all", req.working_directory, true, || req.body.run()).await
}

async fn delete_all(Json(req): Json<Envelope<cli::remove::DeleteAll>>) -> Json<serde_json::Value> {
    dispatch("delete-all", req.working_directory, true, || req.body.run()).await
}

async fn list(Json(req): Json<Envelope<cli::list::List>>) -> Json<serde_json::Value> {
    dispatch("list", req.working_directory, true, || req.body.run()).await
}

async fn prune(Json(req): Json<Envelope<cli::prune::Prune>>) -> Json<serde_json::Value> {
    dispatch("prune", req.working_directory, true, || req.body.run()).await
}

async fn clean_legacy(Json(req): Json<Envelope<Empty>>) -> Json<serde_json::Value> {
    dispatch("clean-legacy", req.working_directory, true, cli::prune::clean_legacy).await
}

/// `<branch> <action> [args...]` runtime passthrough (spec §6.1).
#[derive(Debug, Deserialize)]
struct BranchBody {
    branch: String,
    action: String,
    #[serde(default)]
    args: Vec<String>,
}

async fn branch(Json(req): Json<Envelope<BranchBody>>) -> Json<serde_json::Value> {
    let mut argv = vec![req.body.branch, req.body.action];
    argv.extend(req.body.args);
    dispatch(
        "branch",
        req.working_directory,
        true,
        || async move { crate::cli::branch_dispatch(argv).await },
    )
    .await
}

// ---------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------

async fn volumes_list(Json(req): Json<Envelope<Empty>>) -> Json<serde_json::Value> {
    dispatch("volumes list", req.working_directory, true, || {
        volumes::Volumes { command: volumes::VolumesCommand::List }.run()
    })
    .await
}

async fn volumes_size(Json(req): Json<Envelope<Empty>>) -> Json<serde_json::Value> {
    dispatch("volumes size", req.working_directory, true, || {
        volumes::Volumes { command: volumes::VolumesCommand::Size }.run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct VolumesBackupBody {
    branch: String,
    output_dir: Option<PathBuf>,
}

async fn volumes_backup(Json(req): Json<Envelope<VolumesBackupBody>>) -> Json<serde_json::Value> {
    dispatch("volumes backup", req.working_directory, true, || {
        volumes::Volumes {
            command: volumes::VolumesCommand::Backup { branch: req.body.branch, output_dir: req.body.output_dir },
        }
        .run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct VolumesRestoreBody {
    branch: String,
    volume: String,
    archive: PathBuf,
}

async fn volumes_restore(Json(req): Json<Envelope<VolumesRestoreBody>>) -> Json<serde_json::Value> {
    dispatch("volumes restore", req.working_directory, true, || {
        volumes::Volumes {
            command: volumes::VolumesCommand::Restore {
                branch: req.body.branch,
                volume: req.body.volume,
                archive: req.body.archive,
            },
        }
        .run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct VolumesCleanBody {
    branch: String,
}

async fn volumes_clean(Json(req): Json<Envelope<VolumesCleanBody>>) -> Json<serde_json::Value> {
    dispatch("volumes clean", req.working_directory, true, || {
        volumes::Volumes { command: volumes::VolumesCommand::Clean { branch: req.body.branch } }.run()
    })
    .await
}

// ---------------------------------------------------------------------
// Packages
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PackagesExportBody {
    branch: String,
    #[serde(default)]
    include_code: bool,
    #[serde(default)]
    no_data: bool,
    output_dir: Option<PathBuf>,
    #[serde(default)]
    no_compress: bool,
}

async fn packages_export(Json(req): Json<Envelope<PackagesExportBody>>) -> Json<serde_json::Value> {
    dispatch("packages export", req.working_directory, true, || {
        let b = req.body;
        packages::Packages {
            command: packages::PackagesCommand::Export {
                branch: b.branch,
                include_code: b.include_code,
                no_data: b.no_data,
                output_dir: b.output_dir,
                no_compress: b.no_compress,
            },
        }
        .run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct PackagesImportBody {
    archive: PathBuf,
    branch: Option<String>,
    #[serde(default)]
    no_restore_data: bool,
    #[serde(default)]
    standalone: bool,
    target_dir: Option<PathBuf>,
    domain: Option<String>,
    ip: Option<String>,
}

async fn packages_import(Json(req): Json<Envelope<PackagesImportBody>>) -> Json<serde_json::Value> {
    // Import is valid both in-project (normal mode) and standalone, so it
    // does not gate on an existing `.dockertree/config.yml` the way other
    // mutating operations do (spec §4.9's auto-detection already covers it).
    dispatch("packages import", req.working_directory, false, || {
        let b = req.body;
        packages::Packages {
            command: packages::PackagesCommand::Import {
                archive: b.archive,
                branch: b.branch,
                no_restore_data: b.no_restore_data,
                standalone: b.standalone,
                target_dir: b.target_dir,
                domain: b.domain,
                ip: b.ip,
            },
        }
        .run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct PackagesListBody {
    #[serde(default = "default_dir")]
    dir: PathBuf,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

async fn packages_list(Json(req): Json<Envelope<PackagesListBody>>) -> Json<serde_json::Value> {
    dispatch("packages list", req.working_directory, false, || {
        packages::Packages { command: packages::PackagesCommand::List { dir: req.body.dir } }.run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct PackagesValidateBody {
    archive: PathBuf,
}

async fn packages_validate(Json(req): Json<Envelope<PackagesValidateBody>>) -> Json<serde_json::Value> {
    dispatch("packages validate", req.working_directory, false, || {
        packages::Packages { command: packages::PackagesCommand::Validate { archive: req.body.archive } }.run()
    })
    .await
}

// ---------------------------------------------------------------------
// Droplet
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DropletCreateBody {
    name: String,
    #[serde(default = "default_region")]
    region: String,
    #[serde(default = "default_size")]
    size: String,
    #[serde(default = "default_image")]
    image: String,
    ssh_key: Option<String>,
    token: Option<String>,
}

fn default_region() -> String {
    "nyc3".to_string()
}
fn default_size() -> String {
    "s-1vcpu-1gb".to_string()
}
fn default_image() -> String {
    "ubuntu-22-04-x64".to_string()
}

async fn droplet_create(Json(req): Json<Envelope<DropletCreateBody>>) -> Json<serde_json::Value> {
    dispatch("droplet create", req.working_directory, false, || {
        let b = req.body;
        droplet::Droplet {
            command: droplet::DropletCommand::Create {
                name: b.name,
                region: b.region,
                size: b.size,
                image: b.image,
                ssh_key: b.ssh_key,
                token: b.token,
            },
        }
        .run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct DropletPushBody {
    branch: String,
    target: String,
    domain: Option<String>,
    ip: Option<String>,
    token: Option<String>,
}

async fn droplet_push(Json(req): Json<Envelope<DropletPushBody>>) -> Json<serde_json::Value> {
    dispatch("droplet push", req.working_directory, true, || {
        let b = req.body;
        droplet::Droplet {
            command: droplet::DropletCommand::Push { branch: b.branch, target: b.target, domain: b.domain, ip: b.ip, token: b.token },
        }
        .run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct TokenOnlyBody {
    token: Option<String>,
}

async fn droplet_list(Json(req): Json<Envelope<TokenOnlyBody>>) -> Json<serde_json::Value> {
    dispatch("droplet list", req.working_directory, false, || {
        droplet::Droplet { command: droplet::DropletCommand::List { token: req.body.token } }.run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct DropletInfoBody {
    id: u64,
    token: Option<String>,
}

async fn droplet_info(Json(req): Json<Envelope<DropletInfoBody>>) -> Json<serde_json::Value> {
    dispatch("droplet info", req.working_directory, false, || {
        droplet::Droplet { command: droplet::DropletCommand::Info { id: req.body.id, token: req.body.token } }.run()
    })
    .await
}

#[derive(Debug, Deserialize)]
struct DropletDestroyBody {
    ids: Vec<u64>,
    token: Option<String>,
}

async fn droplet_destroy(Json(req): Json<Envelope<DropletDestroyBody>>) -> Json<serde_json::Value> {
    dispatch("droplet destroy", req.working_directory, false, || {
        droplet::Droplet { command: droplet::DropletCommand::Destroy { ids: req.body.ids, token: req.body.token } }.run()
    })
    .await
}

async fn droplet_regions(Json(req): Json<Envelope<TokenOnlyBody>>) -> Json<serde_json::Value> {
    dispatch("droplet regions", req.working_directory, false, || {
        droplet::Droplet { command: droplet::DropletCommand::Regions { token: req.body.token } }.run()
    })
    .await
}

// ---------------------------------------------------------------------
// Router / entry point
// ---------------------------------------------------------------------

pub fn build_router() -> Router {
    Router::new()
        .route("/api/setup", post(setup))
        .route("/api/proxy/start", post(proxy_start))
        .route("/api/proxy/stop", post(proxy_stop))
        .route("/api/create", post(create))
        .route("/api/remove", post(remove))
        .route("/api/delete", post(delete))
        .route("/api/remove-all", post(remove_all))
        .route("/api/delete-all", post(delete_all))
        .route("/api/list", post(list))
        .route("/api/prune", post(prune))
        .route("/api/clean-legacy", post(clean_legacy))
        .route("/api/branch", post(branch))
        .route("/api/volumes/list", post(volumes_list))
        .route("/api/volumes/size", post(volumes_size))
        .route("/api/volumes/backup", post(volumes_backup))
        .route("/api/volumes/restore", post(volumes_restore))
        .route("/api/volumes/clean", post(volumes_clean))
        .route("/api/packages/export", post(packages_export))
        .route("/api/packages/import", post(packages_import))
        .route("/api/packages/list", post(packages_list))
        .route("/api/packages/validate", post(packages_validate))
        .route("/api/droplet/create", post(droplet_create))
        .route("/api/droplet/push", post(droplet_push))
        .route("/api/droplet/list", post(droplet_list))
        .route("/api/droplet/info", post(droplet_info))
        .route("/api/droplet/destroy", post(droplet_destroy))
        .route("/api/droplet/regions", post(droplet_regions))
        .layer(CorsLayer::permissive())
}

pub async fn run_server(bind: &str, port: u16) -> eyre::Result<()> {
    let app = build_router();
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("dockertree rpc surface listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("dockertree rpc surface shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn rejects_missing_working_directory() {
        let app = build_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/list")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        // Missing the mandatory `working_directory` field is a malformed
        // request body, rejected by the `Json` extractor itself.
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn gates_mutating_call_without_project() {
        let tmp = tempfile::tempdir().unwrap();
        let app = build_router();
        let body = serde_json::json!({"working_directory": tmp.path()});
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/list")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
        let envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"]["code"], "precondition_failed");
    }

    #[test]
    fn project_exists_checks_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!project_exists(tmp.path()));
        std::fs::create_dir_all(tmp.path().join(CONFIG_DIR_NAME)).unwrap();
        std::fs::write(tmp.path().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME), "project_name: x\n").unwrap();
        assert!(project_exists(tmp.path()));
    }
}
