use serde_json::json;

use crate::cli::CliContext;
use crate::docker;
use crate::error::Result;
use crate::proxy;

pub async fn start() -> Result<serde_json::Value> {
    let ctx = CliContext::discover().await?;
    proxy::start(&ctx.docker, &ctx.config.caddy_network).await?;
    let report = proxy::reconcile(&ctx.docker).await?;
    Ok(json!({"routes": report.routes, "staged": report.staged}))
}

pub async fn stop() -> Result<serde_json::Value> {
    let docker = docker::client()?;
    proxy::stop(&docker).await?;
    Ok(json!({"stopped": true}))
}
