//! Admin dashboard and tools route handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use mf_av::ToolInfo;

use crate::context::AppContext;
use crate::error::AppError;

/// Number of recent events shown on the dashboard.
const DASHBOARD_EVENTS: usize = 20;

/// Dashboard response containing queue counters and recent events.
#[derive(Serialize, utoipa::ToSchema)]
pub struct DashboardResponse {
    pub jobs: DashboardJobs,
    pub workspaces: DashboardWorkspaces,
    /// Newest first.
    #[schema(value_type = Vec<Object>)]
    pub recent_events: Vec<mf_core::events::Event>,
}

/// Job counters for the dashboard.
#[derive(Serialize, utoipa::ToSchema)]
pub struct DashboardJobs {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub peak_running: usize,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
}

/// Workspace usage for the dashboard.
#[derive(Serialize, utoipa::ToSchema)]
pub struct DashboardWorkspaces {
    pub active: usize,
    pub root: String,
}

/// GET /api/admin/dashboard
#[utoipa::path(
    get,
    path = "/api/admin/dashboard",
    responses(
        (status = 200, description = "Dashboard statistics", body = DashboardResponse)
    )
)]
pub async fn dashboard(State(ctx): State<AppContext>) -> Json<DashboardResponse> {
    let stats = ctx.scheduler.stats();
    Json(DashboardResponse {
        jobs: DashboardJobs {
            pending: stats.pending,
            running: stats.running,
            succeeded: stats.succeeded,
            failed: stats.failed,
            cancelled: stats.cancelled,
            peak_running: stats.peak_running,
            max_concurrent_jobs: stats.max_concurrent_jobs,
            queue_capacity: stats.queue_capacity,
        },
        workspaces: DashboardWorkspaces {
            active: ctx.workspaces.active_count(),
            root: ctx.workspaces.root().display().to_string(),
        },
        recent_events: ctx.event_bus.recent_events(DASHBOARD_EVENTS),
    })
}

/// GET /api/admin/tools
///
/// Runs each tool's version command, so the check happens on the blocking
/// pool.
#[utoipa::path(
    get,
    path = "/api/admin/tools",
    responses(
        (status = 200, description = "List external tool availability", body = Vec<ToolInfo>)
    )
)]
pub async fn tools(State(ctx): State<AppContext>) -> Result<Json<Vec<ToolInfo>>, AppError> {
    let registry = ctx.tools.clone();
    let infos = tokio::task::spawn_blocking(move || registry.check_all())
        .await
        .map_err(|e| mf_core::Error::Internal(format!("tool check failed: {e}")))?;
    Ok(Json(infos))
}
