//! ffprobe-based verification of produced artifacts.
//!
//! Shells out to `ffprobe -v error -print_format json -show_format
//! -show_streams` and checks that the file is a readable container with at
//! least one video stream.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use mf_core::{Error, Result};

use crate::command::{ProcessInvocation, ProcessRunner};

/// What ffprobe reported about a file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSummary {
    pub format_name: Option<String>,
    pub duration_secs: Option<f64>,
    pub video_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub audio_streams: usize,
}

/// Run ffprobe over `file` and confirm it holds a decodable video stream.
///
/// # Errors
///
/// [`Error::Integrity`] if ffprobe rejects the file or finds no video
/// stream. Runner errors (spawn, timeout, cancellation) pass through.
pub async fn verify_output(
    runner: &ProcessRunner,
    ffprobe: &Path,
    file: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProbeSummary> {
    let mut cmd = ProcessInvocation::new(ffprobe);
    cmd.args([
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ]);
    cmd.arg(file.to_string_lossy().as_ref());
    cmd.timeout(timeout);

    let result = runner.run(&cmd, cancel).await?;
    if !result.success() {
        return Err(Error::Integrity(format!(
            "ffprobe rejected {} ({}): {}",
            file.display(),
            result.describe_exit(),
            result.stderr_tail(5)
        )));
    }

    let summary = parse_probe_output(&result.stdout)?;
    tracing::debug!(
        "Verified {}: codec={:?} {}x{} duration={:?}",
        file.display(),
        summary.video_codec,
        summary.width.unwrap_or(0),
        summary.height.unwrap_or(0),
        summary.duration_secs,
    );
    Ok(summary)
}

/// Parse ffprobe JSON output into a [`ProbeSummary`].
pub fn parse_probe_output(json: &str) -> Result<ProbeSummary> {
    let ff: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| Error::Integrity(format!("ffprobe JSON parse error: {e}")))?;

    let video = ff
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| Error::Integrity("output contains no video stream".into()))?;

    let audio_streams = ff
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .count();

    let format = ff.format.unwrap_or_default();
    Ok(ProbeSummary {
        format_name: format.format_name,
        duration_secs: format.duration.and_then(|d| d.parse().ok()),
        video_codec: video.codec_name.clone(),
        width: video.width,
        height: video.height,
        audio_streams,
    })
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}
