//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! sub-configs for the HTTP server, external tools, scheduler, workspaces,
//! conversion profile and input fetching. Every section defaults sensibly so
//! a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::media::{Container, VideoCodec};
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tools: ToolsConfig,
    pub scheduler: SchedulerConfig,
    pub workspace: WorkspaceConfig,
    pub conversion: ConversionConfig,
    pub fetch: FetchConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    ///
    /// Recognised variables: `PORT`, `FRONTEND_ORIGIN`,
    /// `MEDIAFORGE_TEMP_ROOT`, `MEDIAFORGE_OUTPUT_ROOT`. Unparseable values
    /// are logged and ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            match port.trim().parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!("Ignoring invalid PORT value {port:?}"),
            }
        }
        if let Some(origin) = lookup("FRONTEND_ORIGIN").filter(|s| !s.is_empty()) {
            self.server.cors_origin = Some(origin);
        }
        if let Some(root) = lookup("MEDIAFORGE_TEMP_ROOT").filter(|s| !s.is_empty()) {
            self.workspace.temp_root = PathBuf::from(root);
        }
        if let Some(root) = lookup("MEDIAFORGE_OUTPUT_ROOT").filter(|s| !s.is_empty()) {
            self.workspace.output_root = PathBuf::from(root);
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if self.scheduler.max_concurrent_jobs == 0 {
            warnings.push("scheduler.max_concurrent_jobs is 0; one worker will be used".into());
        }
        if self.scheduler.queue_capacity == 0 {
            warnings.push(
                "scheduler.queue_capacity is 0; every submission will be rejected".into(),
            );
        }
        if self.scheduler.job_timeout_secs == 0 {
            warnings.push("scheduler.job_timeout_secs is 0; every conversion will time out".into());
        }

        if self.workspace.temp_root == self.workspace.output_root {
            warnings.push(
                "workspace.temp_root and workspace.output_root are the same directory".into(),
            );
        }
        if self.workspace.max_workspaces < self.scheduler.max_concurrent_jobs {
            warnings.push(format!(
                "workspace.max_workspaces ({}) is below scheduler.max_concurrent_jobs ({})",
                self.workspace.max_workspaces, self.scheduler.max_concurrent_jobs
            ));
        }

        let c = &self.conversion;
        if !c.container.supports(c.codec) {
            warnings.push(format!(
                "conversion.codec '{}' cannot be stored in conversion.container '{}'",
                c.codec, c.container
            ));
        }
        if c.crf > 51 {
            warnings.push(format!("conversion.crf {} is outside 0..=51", c.crf));
        }
        if !VALID_PRESETS.contains(&c.preset.as_str()) {
            warnings.push(format!(
                "conversion.preset '{}' is not a recognized preset (valid: {})",
                c.preset,
                VALID_PRESETS.join(", ")
            ));
        }

        if let Some(ref cookies) = self.fetch.cookies_file {
            if !cookies.exists() {
                warnings.push(format!(
                    "fetch.cookies_file {} does not exist",
                    cookies.display()
                ));
            }
        }

        warnings
    }
}

/// x264/x265 presets accepted by [`ConversionConfig::preset`].
const VALID_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origin. `None` allows any origin.
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            cors_origin: None,
        }
    }
}

/// Paths to external CLI tools. `None` means look up on `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
}

/// Job queue and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of workers, and therefore the ceiling on concurrently running
    /// external processes.
    pub max_concurrent_jobs: usize,
    /// Maximum number of pending jobs before submissions are rejected.
    pub queue_capacity: usize,
    /// Per-process time budget.
    pub job_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when a running job is cancelled.
    pub cancel_grace_secs: u64,
    /// How long terminal jobs (and their artifacts) are kept.
    pub job_retention_secs: u64,
}

impl SchedulerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            queue_capacity: 32,
            job_timeout_secs: 3600,
            cancel_grace_secs: 5,
            job_retention_secs: 3600,
        }
    }
}

/// Filesystem layout and workspace budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Parent of all per-job workspaces.
    pub temp_root: PathBuf,
    /// Where finished artifacts are retained.
    pub output_root: PathBuf,
    /// The only directory uploaded-path inputs may be read from. Uploaded
    /// inputs are refused when unset.
    pub uploads_root: Option<PathBuf>,
    /// Maximum number of live workspaces.
    pub max_workspaces: usize,
    /// Free space that must remain on the temp filesystem.
    pub min_free_bytes: u64,
    /// Free inodes that must remain on the temp filesystem.
    pub min_free_inodes: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            temp_root: PathBuf::from("temp"),
            output_root: PathBuf::from("downloads"),
            uploads_root: None,
            max_workspaces: 64,
            min_free_bytes: 256 * 1024 * 1024,
            min_free_inodes: 1024,
        }
    }
}

/// Default conversion profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub container: Container,
    pub codec: VideoCodec,
    pub crf: u32,
    pub preset: String,
    pub audio_bitrate: String,
    /// Output is scaled down and padded to this height (16:9 box).
    pub max_height: u32,
    /// Retry once with H.264 when the HEVC encoder is unavailable.
    pub fallback_to_h264: bool,
    /// Run ffprobe over the artifact before publishing it.
    pub verify_with_ffprobe: bool,
    /// Bytes of stdout/stderr retained per stream.
    pub capture_limit_bytes: usize,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            container: Container::Mkv,
            codec: VideoCodec::Hevc,
            crf: 23,
            preset: "medium".into(),
            audio_bitrate: "96k".into(),
            max_height: 720,
            fallback_to_h264: true,
            verify_with_ffprobe: true,
            capture_limit_bytes: 64 * 1024,
        }
    }
}

/// Input acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    /// Inputs larger than this are rejected.
    pub max_input_bytes: u64,
    /// Netscape cookie file handed to yt-dlp.
    pub cookies_file: Option<PathBuf>,
    pub user_agent: String,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            max_input_bytes: 4 * 1024 * 1024 * 1024,
            cookies_file: None,
            user_agent: concat!("mediaforge/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}
