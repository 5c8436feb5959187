//! Cookies upload for page extraction.
//!
//! yt-dlp is handed `fetch.cookies_file` on every page job, so an upload
//! applies to the next extraction without a restart. The body is the raw
//! Netscape-format file; `filename` carries the client's file name.

use std::path::Path;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use mf_core::Error;

use crate::context::AppContext;
use crate::error::AppError;

/// Largest accepted cookies file.
pub const MAX_COOKIES_BYTES: usize = 1024 * 1024;

/// Query parameters for a cookies upload.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct CookiesParams {
    /// Name of the uploaded file. Must end in `.txt`.
    pub filename: String,
}

/// Result of a cookies upload.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CookiesResponse {
    pub path: String,
    pub bytes: usize,
    /// Lines in Netscape cookie-file format.
    pub entries: usize,
    /// `false` when no cookie line was recognised; the file is kept anyway.
    pub valid: bool,
}

/// POST /api/cookies
#[utoipa::path(
    post,
    path = "/api/cookies",
    params(CookiesParams),
    request_body(content = String, content_type = "text/plain"),
    responses(
        (status = 200, description = "Cookies stored", body = CookiesResponse),
        (status = 400, description = "Not a .txt file, empty, or above 1 MiB"),
        (status = 409, description = "No cookies file is configured")
    )
)]
pub async fn upload_cookies(
    State(ctx): State<AppContext>,
    Query(params): Query<CookiesParams>,
    body: Bytes,
) -> Result<Json<CookiesResponse>, AppError> {
    if !params.filename.to_ascii_lowercase().ends_with(".txt") {
        return Err(Error::Validation("only .txt cookie files are accepted".into()).into());
    }
    if body.is_empty() {
        return Err(Error::Validation("cookies file is empty".into()).into());
    }
    if body.len() > MAX_COOKIES_BYTES {
        return Err(Error::Validation(format!(
            "cookies file is {} bytes, above the {MAX_COOKIES_BYTES} byte limit",
            body.len()
        ))
        .into());
    }
    let Some(dest) = ctx.config.fetch.cookies_file.as_deref() else {
        return Err(Error::Conflict("fetch.cookies_file is not configured".into()).into());
    };

    write_cookies(dest, &body).await?;
    let entries = count_cookie_entries(&body);
    if entries == 0 {
        tracing::warn!("Uploaded cookies file has no Netscape-format entries");
    }
    tracing::info!(bytes = body.len(), entries, "Stored cookies at {}", dest.display());

    Ok(Json(CookiesResponse {
        path: dest.display().to_string(),
        bytes: body.len(),
        entries,
        valid: entries > 0,
    }))
}

/// Write through a sibling temp file so yt-dlp never sees a partial file.
async fn write_cookies(dest: &Path, contents: &[u8]) -> mf_core::Result<()> {
    let failed = |e: std::io::Error| {
        Error::Internal(format!("cannot write cookies file {}: {e}", dest.display()))
    };

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(failed)?;
    }
    let partial = dest.with_extension("partial");

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);

    let written = async {
        let mut file = opts.open(&partial).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        tokio::fs::rename(&partial, dest).await
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(failed(e));
    }
    Ok(())
}

/// Count tab-separated seven-field lines, including `#HttpOnly_` entries.
fn count_cookie_entries(contents: &[u8]) -> usize {
    String::from_utf8_lossy(contents)
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('#') || line.starts_with("#HttpOnly_"))
        .filter(|line| line.split('\t').count() == 7)
        .count()
}
