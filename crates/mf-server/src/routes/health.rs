//! Liveness endpoint.

use std::path::Path;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use mf_av::tools::{FFMPEG, FFPROBE, YTDLP};

use crate::context::AppContext;

/// Scheduler part of the health report.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WorkerHealth {
    pub healthy: bool,
    pub workers_alive: usize,
    pub workers_expected: usize,
    pub accepting: bool,
}

/// Availability of one external tool.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ToolStatus {
    pub name: String,
    pub available: bool,
}

/// Whether a configured directory exists and is writable.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DirectoryStatus {
    pub path: String,
    pub writable: bool,
}

/// Health check response.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: String,
    pub version: String,
    pub scheduler: WorkerHealth,
    pub tools: Vec<ToolStatus>,
    pub temp_root: DirectoryStatus,
    pub output_root: DirectoryStatus,
}

/// GET /health
///
/// Healthy when every worker is alive and the scheduler accepts jobs.
/// Missing tools and unwritable directories are reported but only the
/// worker pool decides the status code.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Worker pool is degraded", body = HealthResponse)
    )
)]
pub async fn health_check(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthResponse>) {
    let scheduler = ctx.scheduler.health();
    let tools = [FFMPEG, FFPROBE, YTDLP]
        .into_iter()
        .map(|name| ToolStatus {
            name: name.to_string(),
            available: ctx.tools.is_available(name),
        })
        .collect();

    let status = if scheduler.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthResponse {
        status: if scheduler.healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        scheduler: WorkerHealth {
            healthy: scheduler.healthy,
            workers_alive: scheduler.workers_alive,
            workers_expected: scheduler.workers_expected,
            accepting: scheduler.accepting,
        },
        tools,
        temp_root: directory_status(&ctx.config.workspace.temp_root),
        output_root: directory_status(&ctx.config.workspace.output_root),
    };
    (status, Json(body))
}

/// A directory counts as writable if it exists and is not read-only. This
/// never creates anything.
fn directory_status(path: &Path) -> DirectoryStatus {
    let writable = std::fs::metadata(path)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false);
    DirectoryStatus {
        path: path.display().to_string(),
        writable,
    }
}
