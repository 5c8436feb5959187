//! Job management route handlers.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use mf_core::paths::format_duration;
use mf_core::{Container, JobId, VideoCodec};
use mf_pipeline::{
    CancelOutcome, InputSource, JobSnapshot, JobSpec, JobState, MediaInfo, OutputOptions,
};

use crate::context::AppContext;
use crate::error::AppError;
use crate::middleware::request_id::RequestId;

/// Extensions treated as direct media links when `source_kind` is omitted.
const DIRECT_MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mkv", "webm", "mov", "avi", "ts", "flv", "wmv", "mpg", "mpeg",
];

/// How the `source` of a submission should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Direct HTTP(S) download.
    Url,
    /// Web page resolved through yt-dlp.
    Page,
    /// File under the uploads directory.
    Upload,
}

impl SourceKind {
    /// Guess the kind from the source string: http(s) links ending in a
    /// media extension are direct downloads, other links are pages, and
    /// everything else is an uploaded path.
    pub fn infer(source: &str) -> Self {
        let lower = source.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Self::Upload;
        }
        let path = lower.split(['?', '#']).next().unwrap_or_default();
        let last = path.rsplit('/').next().unwrap_or_default();
        match last.rsplit_once('.') {
            Some((_, ext)) if DIRECT_MEDIA_EXTENSIONS.contains(&ext) => Self::Url,
            _ => Self::Page,
        }
    }
}

/// Request body for submitting a new job.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SubmitJobRequest {
    /// An http(s) URL, or a path relative to the uploads directory.
    pub source: String,
    pub source_kind: Option<SourceKind>,
    #[schema(value_type = Option<String>, example = "mkv")]
    pub container: Option<Container>,
    #[schema(value_type = Option<String>, example = "hevc")]
    pub codec: Option<VideoCodec>,
    pub max_height: Option<u32>,
    pub crf: Option<u32>,
    /// Download filename; sanitized and given the container's extension.
    pub rename: Option<String>,
    /// Expected SHA-256 of the input, hex encoded.
    pub checksum: Option<String>,
}

impl SubmitJobRequest {
    fn into_spec(self) -> JobSpec {
        let source = self.source.trim().to_string();
        let input = match self.source_kind.unwrap_or_else(|| SourceKind::infer(&source)) {
            SourceKind::Url => InputSource::Url(source),
            SourceKind::Page => InputSource::Page(source),
            SourceKind::Upload => InputSource::Upload(PathBuf::from(source)),
        };
        JobSpec {
            input,
            output: OutputOptions {
                container: self.container,
                codec: self.codec,
                max_height: self.max_height,
                crf: self.crf,
                rename: self.rename,
            },
            checksum: self.checksum.map(|c| c.to_ascii_lowercase()),
        }
    }
}

/// Response to a successful submission.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SubmitJobResponse {
    pub id: String,
    pub state: String,
}

/// Failure detail of a failed job.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobErrorResponse {
    pub kind: String,
    pub detail: String,
}

/// What is known about the job's media.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MediaResponse {
    /// Page title reported by the extractor.
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    /// Duration as `HH:MM:SS`, or `MM:SS` under an hour.
    pub duration: Option<String>,
    pub duration_secs: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_codec: Option<String>,
}

impl From<MediaInfo> for MediaResponse {
    fn from(info: MediaInfo) -> Self {
        Self {
            title: info.title,
            thumbnail: info.thumbnail,
            duration: info.duration_secs.map(format_duration),
            duration_secs: info.duration_secs,
            width: info.width,
            height: info.height,
            video_codec: info.video_codec,
        }
    }
}

/// Job response.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: String,
    pub seq: u64,
    pub state: String,
    pub stage: Option<String>,
    pub input: String,
    pub container: String,
    pub codec: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub output: Option<String>,
    /// Where the artifact can be fetched once the job succeeded.
    pub download_url: Option<String>,
    pub download_name: String,
    pub error: Option<JobErrorResponse>,
    pub cancel_requested: bool,
    pub media: Option<MediaResponse>,
}

impl From<JobSnapshot> for JobResponse {
    fn from(job: JobSnapshot) -> Self {
        let download_url =
            (job.state == JobState::Succeeded).then(|| format!("/files/{}", job.id));
        Self {
            id: job.id.to_string(),
            seq: job.seq,
            state: job.state.to_string(),
            stage: job.stage.map(|s| s.to_string()),
            input: job.input.to_string(),
            container: job.container.to_string(),
            codec: job.codec.to_string(),
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
            output: job.output.map(|p| p.display().to_string()),
            download_url,
            download_name: job.download_name,
            error: job.failure.map(|f| JobErrorResponse {
                kind: f.kind.to_string(),
                detail: f.detail,
            }),
            cancel_requested: job.cancel_requested,
            media: job.media.map(MediaResponse::from),
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CancelJobResponse {
    pub id: String,
    /// `cancelled`, `signalled` or `already_finished`.
    #[schema(value_type = String)]
    pub outcome: CancelOutcome,
}

/// Query parameters for listing jobs.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsParams {
    /// Only jobs in this state (`pending`, `running`, `succeeded`, ...).
    pub state: Option<String>,
}

pub(crate) fn parse_job_id(id: &str) -> Result<JobId, AppError> {
    id.parse()
        .map_err(|_| mf_core::Error::Validation(format!("Invalid job ID: {id}")).into())
}

/// POST /api/jobs
#[utoipa::path(
    post,
    path = "/api/jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 201, description = "Job queued", body = SubmitJobResponse),
        (status = 400, description = "Invalid request"),
        (status = 429, description = "Queue is full")
    )
)]
pub async fn submit_job(
    State(ctx): State<AppContext>,
    Extension(request_id): Extension<RequestId>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, AppError> {
    if payload.source.trim().is_empty() {
        return Err(AppError::new(mf_core::Error::Validation("source is required".into()))
            .with_request_id(request_id.0));
    }

    let id = ctx
        .scheduler
        .submit(payload.into_spec())
        .map_err(|e| AppError::new(e).with_request_id(request_id.0.clone()))?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            id: id.to_string(),
            state: JobState::Pending.to_string(),
        }),
    ))
}

/// GET /api/jobs
#[utoipa::path(
    get,
    path = "/api/jobs",
    params(ListJobsParams),
    responses(
        (status = 200, description = "Jobs in submission order", body = Vec<JobResponse>)
    )
)]
pub async fn list_jobs(
    State(ctx): State<AppContext>,
    Query(params): Query<ListJobsParams>,
) -> Json<Vec<JobResponse>> {
    let jobs = ctx
        .scheduler
        .list()
        .into_iter()
        .filter(|job| {
            params
                .state
                .as_deref()
                .map_or(true, |state| job.state.to_string() == state)
        })
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

/// GET /api/jobs/{id}
#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 404, description = "Job not found")
    )
)]
pub async fn get_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(ctx.scheduler.status(job_id)?.into()))
}

/// DELETE /api/jobs/{id}
#[utoipa::path(
    delete,
    path = "/api/jobs/{id}",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Cancellation acknowledged", body = CancelJobResponse),
        (status = 404, description = "Job not found")
    )
)]
pub async fn cancel_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<CancelJobResponse>, AppError> {
    let job_id = parse_job_id(&id)?;
    let outcome = ctx.scheduler.cancel(job_id)?;
    Ok(Json(CancelJobResponse {
        id: job_id.to_string(),
        outcome,
    }))
}

/// DELETE /api/jobs/{id}/files
#[utoipa::path(
    delete,
    path = "/api/jobs/{id}/files",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 204, description = "Job record and artifact removed"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job has not finished")
    )
)]
pub async fn purge_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let job_id = parse_job_id(&id)?;
    ctx.scheduler.purge(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_source_kind() {
        assert_eq!(SourceKind::infer("https://cdn.test/a/clip.MP4?x=1"), SourceKind::Url);
        assert_eq!(SourceKind::infer("https://video.test/watch?v=abc"), SourceKind::Page);
        assert_eq!(SourceKind::infer("http://video.test/"), SourceKind::Page);
        assert_eq!(SourceKind::infer("incoming/clip.mkv"), SourceKind::Upload);
    }

    #[test]
    fn request_maps_to_spec() {
        let req: SubmitJobRequest = serde_json::from_value(serde_json::json!({
            "source": " https://video.test/watch?v=1 ",
            "container": "mp4",
            "codec": "h264",
            "rename": "holiday",
            "checksum": "ABCDEF"
        }))
        .unwrap();
        let spec = req.into_spec();
        assert_eq!(spec.input, InputSource::Page("https://video.test/watch?v=1".into()));
        assert_eq!(spec.output.container, Some(Container::Mp4));
        assert_eq!(spec.output.codec, Some(VideoCodec::H264));
        assert_eq!(spec.checksum.as_deref(), Some("abcdef"));
    }

    #[test]
    fn media_duration_is_formatted() {
        let media = MediaResponse::from(MediaInfo {
            title: Some("Launch Day".into()),
            duration_secs: Some(3725),
            width: Some(1280),
            height: Some(720),
            ..MediaInfo::default()
        });
        assert_eq!(media.duration.as_deref(), Some("01:02:05"));
        assert_eq!(media.duration_secs, Some(3725));
        assert_eq!(media.title.as_deref(), Some("Launch Day"));

        let unknown = MediaResponse::from(MediaInfo::default());
        assert_eq!(unknown.duration, None);
    }

    #[test]
    fn explicit_kind_wins() {
        let req: SubmitJobRequest = serde_json::from_value(serde_json::json!({
            "source": "https://video.test/page",
            "source_kind": "url"
        }))
        .unwrap();
        assert!(matches!(req.into_spec().input, InputSource::Url(_)));
    }
}
