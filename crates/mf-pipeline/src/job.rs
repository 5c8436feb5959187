//! Job model: what a job asks for, and the state machine it moves through.
//!
//! A job is `Pending` until a worker admits it, `Running` while the pipeline
//! works on it, and then ends in exactly one of `Succeeded`, `Failed` or
//! `Cancelled`. All status changes go through [`JobStatus::transition`],
//! which consults a single transition table and rejects everything else.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mf_av::{ProbeSummary, TranscodeOptions};
use mf_core::config::ConversionConfig;
use mf_core::paths::{sanitize_filename, with_extension};
use mf_core::{Container, Error, ErrorKind, JobId, Result, VideoCodec};

/// Accepted range for the output frame height.
const MIN_HEIGHT: u32 = 144;
const MAX_HEIGHT: u32 = 2160;

// ---------------------------------------------------------------------------
// Job specification
// ---------------------------------------------------------------------------

/// Where the job's input comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InputSource {
    /// A direct HTTP(S) link to a media file.
    Url(String),
    /// A web page resolved through yt-dlp.
    Page(String),
    /// A file already on disk under the uploads root.
    Upload(PathBuf),
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "url:{url}"),
            Self::Page(url) => write!(f, "page:{url}"),
            Self::Upload(path) => write!(f, "upload:{}", path.display()),
        }
    }
}

/// Requested output options. Unset fields fall back to the configured
/// conversion profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    pub container: Option<Container>,
    pub codec: Option<VideoCodec>,
    pub max_height: Option<u32>,
    pub crf: Option<u32>,
    /// Download filename offered to clients.
    pub rename: Option<String>,
}

impl OutputOptions {
    /// Fill in unset fields from `defaults`.
    ///
    /// When only the container is given, the codec is chosen to fit it.
    pub fn resolve(&self, defaults: &ConversionConfig) -> TranscodeOptions {
        let container = self.container.unwrap_or(defaults.container);
        let codec = self.codec.unwrap_or_else(|| {
            if container.supports(defaults.codec) {
                defaults.codec
            } else if container == Container::Webm {
                VideoCodec::Vp9
            } else {
                VideoCodec::H264
            }
        });
        TranscodeOptions {
            container,
            codec,
            crf: self.crf.unwrap_or(defaults.crf),
            preset: defaults.preset.clone(),
            audio_bitrate: defaults.audio_bitrate.clone(),
            max_height: self.max_height.unwrap_or(defaults.max_height),
        }
    }
}

/// Everything a client submits to create a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub input: InputSource,
    #[serde(default)]
    pub output: OutputOptions,
    /// Expected SHA-256 of the acquired input, lowercase hex.
    #[serde(default)]
    pub checksum: Option<String>,
}

impl JobSpec {
    pub fn new(input: InputSource) -> Self {
        Self {
            input,
            output: OutputOptions::default(),
            checksum: None,
        }
    }

    /// Check the request before it is admitted.
    ///
    /// Uploaded paths must resolve lexically under `uploads_root`; the
    /// acquisition step checks the canonical path again before reading.
    pub fn validate(&self, defaults: &ConversionConfig, uploads_root: Option<&Path>) -> Result<()> {
        match &self.input {
            InputSource::Url(url) | InputSource::Page(url) => validate_http_url(url)?,
            InputSource::Upload(path) => {
                resolve_upload(path, uploads_root)?;
            }
        }

        let opts = self.output.resolve(defaults);
        if !opts.container.supports(opts.codec) {
            return Err(Error::Validation(format!(
                "codec {} cannot be stored in a {} container",
                opts.codec, opts.container
            )));
        }
        if !(MIN_HEIGHT..=MAX_HEIGHT).contains(&opts.max_height) || opts.max_height % 2 != 0 {
            return Err(Error::Validation(format!(
                "max_height must be an even number in {MIN_HEIGHT}..={MAX_HEIGHT}"
            )));
        }
        let max_crf = if opts.codec == VideoCodec::Vp9 { 63 } else { 51 };
        if opts.crf > max_crf {
            return Err(Error::Validation(format!(
                "crf must be at most {max_crf} for {}",
                opts.codec
            )));
        }
        if let Some(ref name) = self.output.rename {
            if sanitize_filename(name).is_none() {
                return Err(Error::Validation(format!("unusable rename: {name:?}")));
            }
        }
        if let Some(ref checksum) = self.checksum {
            if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Validation(
                    "checksum must be 64 hex characters (SHA-256)".into(),
                ));
            }
        }
        Ok(())
    }

    /// Filename offered when the artifact is downloaded.
    pub fn download_name(&self, job_id: JobId, container: Container) -> String {
        self.output
            .rename
            .as_deref()
            .and_then(sanitize_filename)
            .map(|name| with_extension(&name, container.extension()))
            .unwrap_or_else(|| format!("{job_id}.{}", container.extension()))
    }
}

fn validate_http_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::Validation(format!("invalid URL {url:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        scheme => Err(Error::Validation(format!(
            "unsupported URL scheme {scheme:?}; only http and https are accepted"
        ))),
    }
}

/// Resolve an uploaded path against `uploads_root` without touching the
/// filesystem. Relative paths are taken relative to the root.
pub fn resolve_upload(path: &Path, uploads_root: Option<&Path>) -> Result<PathBuf> {
    let Some(root) = uploads_root else {
        return Err(Error::Validation(
            "uploaded inputs are disabled (workspace.uploads_root is not set)".into(),
        ));
    };
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
    {
        return Err(Error::Validation(format!(
            "upload path must not contain '.' or '..': {}",
            path.display()
        )));
    }
    let full = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    if !full.starts_with(root) || full == root {
        return Err(Error::Validation(format!(
            "upload path is outside the uploads directory: {}",
            path.display()
        )));
    }
    Ok(full)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Pipeline stage of a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preparing,
    Downloading,
    Converting,
    Verifying,
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::Converting => "converting",
            Self::Verifying => "verifying",
            Self::Publishing => "publishing",
        };
        f.write_str(s)
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&Error> for JobFailure {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            detail: e.to_string(),
        }
    }
}

/// Payload-free discriminant of [`JobStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Allowed `(from, to)` moves. Everything else is rejected.
const TRANSITIONS: &[(JobState, JobState)] = &[
    (JobState::Pending, JobState::Running),
    (JobState::Pending, JobState::Cancelled),
    (JobState::Running, JobState::Succeeded),
    (JobState::Running, JobState::Failed),
    (JobState::Running, JobState::Cancelled),
];

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        TRANSITIONS.contains(&(self, next))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Job status with its terminal payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded { output: PathBuf },
    Failed { failure: JobFailure },
    Cancelled,
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self {
            Self::Pending => JobState::Pending,
            Self::Running => JobState::Running,
            Self::Succeeded { .. } => JobState::Succeeded,
            Self::Failed { .. } => JobState::Failed,
            Self::Cancelled => JobState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Move to `next` if the transition table allows it.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] for any move the table does not list, including
    /// every move out of a terminal state.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        let (from, to) = (self.state(), next.state());
        if !from.can_transition_to(to) {
            return Err(Error::Conflict(format!(
                "illegal job transition {from} -> {to}"
            )));
        }
        *self = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Media info
// ---------------------------------------------------------------------------

/// What the pipeline learned about a job's media.
///
/// Page inputs contribute the extractor's title and thumbnail; the ffprobe
/// pass over the artifact contributes duration, dimensions and codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    /// Whole seconds.
    pub duration_secs: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_codec: Option<String>,
}

impl MediaInfo {
    /// Overlay `newer` on `self`: fields `newer` knows replace ours.
    pub fn merge(&mut self, newer: MediaInfo) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.title, newer.title);
        take(&mut self.thumbnail, newer.thumbnail);
        take(&mut self.duration_secs, newer.duration_secs);
        take(&mut self.width, newer.width);
        take(&mut self.height, newer.height);
        take(&mut self.video_codec, newer.video_codec);
    }
}

/// Round a reported duration to whole seconds, dropping nonsense values.
pub(crate) fn whole_seconds(secs: f64) -> Option<u64> {
    (secs.is_finite() && secs >= 0.0).then(|| secs.round() as u64)
}

impl From<&ProbeSummary> for MediaInfo {
    fn from(summary: &ProbeSummary) -> Self {
        Self {
            duration_secs: summary.duration_secs.and_then(whole_seconds),
            width: summary.width,
            height: summary.height,
            video_codec: summary.video_codec.clone(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only view of a job, as returned by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    /// Submission sequence number.
    pub seq: u64,
    pub state: JobState,
    pub stage: Option<Stage>,
    pub input: InputSource,
    pub container: Container,
    pub codec: VideoCodec,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub workspace: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub download_name: String,
    pub failure: Option<JobFailure>,
    pub cancel_requested: bool,
    pub media: Option<MediaInfo>,
}
