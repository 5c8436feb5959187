//! Artifact download.
//!
//! Streams the published file of a succeeded job in 64KB chunks via
//! `ReaderStream`, so memory stays bounded regardless of file size.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;

use mf_pipeline::JobState;

use crate::context::AppContext;
use crate::error::AppError;
use crate::routes::jobs::parse_job_id;

const CHUNK_SIZE: usize = 64 * 1024;

/// GET /files/{id}
#[utoipa::path(
    get,
    path = "/files/{id}",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "The converted file", content_type = "application/octet-stream"),
        (status = 404, description = "Unknown job or no artifact"),
        (status = 409, description = "Job has not finished")
    )
)]
pub async fn download_file(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let job_id = parse_job_id(&id)?;
    let job = ctx.scheduler.status(job_id)?;

    let output = match (job.state, job.output) {
        (JobState::Succeeded, Some(output)) => output,
        (state, _) if !state.is_terminal() => {
            return Err(mf_core::Error::Conflict(format!("job {job_id} is still {state}")).into())
        }
        (state, _) => {
            return Err(mf_core::Error::not_found("file", format!("{job_id} ({state})")).into())
        }
    };

    let file = tokio::fs::File::open(&output)
        .await
        .map_err(|_| mf_core::Error::not_found("file", output.display()))?;
    let size = file.metadata().await.map(|m| m.len()).ok();

    let body = Body::from_stream(ReaderStream::with_capacity(file, CHUNK_SIZE));
    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, job.container.mime_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                content_disposition(&job.download_name),
            ),
        ],
        body,
    )
        .into_response();
    if let Some(size) = size {
        if let Ok(value) = size.to_string().parse() {
            response.headers_mut().insert(header::CONTENT_LENGTH, value);
        }
    }
    Ok(response)
}

/// `attachment` disposition with a quoted filename. Quotes and backslashes
/// are already stripped by filename sanitization; non-ASCII is replaced.
fn content_disposition(name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| if c.is_ascii() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    format!("attachment; filename=\"{ascii}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_is_ascii_and_quoted() {
        assert_eq!(
            content_disposition("clip.mkv"),
            "attachment; filename=\"clip.mkv\""
        );
        assert_eq!(
            content_disposition("caf\u{e9}.mp4"),
            "attachment; filename=\"caf_.mp4\""
        );
    }
}
