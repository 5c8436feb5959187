//! Axum router construction.
//!
//! Builds the application router with all route groups, middleware layers
//! and the OpenAPI document.

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::context::AppContext;
use crate::middleware::request_id::request_id_middleware;
use crate::routes;

#[derive(OpenApi)]
#[openapi(
    info(title = "mediaforge", description = "Media download and conversion jobs"),
    paths(
        routes::jobs::submit_job,
        routes::jobs::list_jobs,
        routes::jobs::get_job,
        routes::jobs::cancel_job,
        routes::jobs::purge_job,
        routes::files::download_file,
        routes::health::health_check,
        routes::admin::dashboard,
        routes::admin::tools,
        routes::cookies::upload_cookies,
        routes::events::events_handler,
    ),
    components(schemas(
        routes::jobs::SubmitJobRequest,
        routes::jobs::SubmitJobResponse,
        routes::jobs::SourceKind,
        routes::jobs::JobResponse,
        routes::jobs::JobErrorResponse,
        routes::jobs::MediaResponse,
        routes::cookies::CookiesResponse,
        routes::jobs::CancelJobResponse,
        routes::health::HealthResponse,
        routes::health::WorkerHealth,
        routes::health::ToolStatus,
        routes::health::DirectoryStatus,
        routes::admin::DashboardResponse,
        routes::admin::DashboardJobs,
        routes::admin::DashboardWorkspaces,
        mf_av::ToolInfo,
    ))
)]
pub struct ApiDoc;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = cors_layer(ctx.config.server.cors_origin.as_deref());

    let api = Router::new()
        // Jobs
        .route(
            "/jobs",
            get(routes::jobs::list_jobs).post(routes::jobs::submit_job),
        )
        .route(
            "/jobs/{id}",
            get(routes::jobs::get_job).delete(routes::jobs::cancel_job),
        )
        .route("/jobs/{id}/files", delete(routes::jobs::purge_job))
        .route("/cookies", post(routes::cookies::upload_cookies))
        .route("/events", get(routes::events::events_handler))
        // Admin
        .route("/admin/dashboard", get(routes::admin::dashboard))
        .route("/admin/tools", get(routes::admin::tools));

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/files/{id}", get(routes::files::download_file))
        .route("/api-docs/openapi.json", get(openapi_json))
        .nest("/api", api)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Allow the configured frontend origin, or any origin when none is set.
fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match origin.map(HeaderValue::from_str) {
        Some(Ok(origin)) => layer.allow_origin(origin),
        Some(Err(e)) => {
            tracing::warn!("Ignoring invalid CORS origin: {e}");
            layer.allow_origin(Any)
        }
        None => layer.allow_origin(Any),
    }
}
