//! The conversion pipeline: one job from workspace to published artifact.
//!
//! Stages: `Preparing` (workspace), `Downloading` (stage and validate the
//! input), `Converting` (run the transcoder), `Verifying` (optional ffprobe
//! check), `Publishing` (move the artifact to the output root). Cancellation
//! is observed between stages and inside every external process. The
//! workspace is released exactly once whatever the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mf_av::tools::FFPROBE;
use mf_av::{
    verify_output, ProcessResult, ProcessRunner, ToolRegistry, TranscodeOptions, Workspace,
    WorkspaceManager,
};
use mf_core::config::{Config, ConversionConfig};
use mf_core::{Error, JobId, Result, VideoCodec};

use crate::acquire::InputAcquirer;
use crate::context::{JobContext, JobProgress};
use crate::job::{MediaInfo, Stage};
use crate::runner::JobRunner;
use crate::transcoder::Transcoder;

/// Lines of stderr kept in a conversion failure.
const STDERR_TAIL_LINES: usize = 20;

/// Budget for the ffprobe verification pass.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// ffmpeg's message when an encoder was not compiled in.
const UNKNOWN_ENCODER: &str = "Unknown encoder";

/// Runs jobs through acquisition, transcoding, verification and publishing.
pub struct ConversionPipeline {
    workspaces: Arc<WorkspaceManager>,
    acquirer: InputAcquirer,
    transcoder: Arc<dyn Transcoder>,
    runner: ProcessRunner,
    tools: Arc<ToolRegistry>,
    conversion: ConversionConfig,
    job_timeout: Duration,
    output_root: PathBuf,
}

impl ConversionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        acquirer: InputAcquirer,
        transcoder: Arc<dyn Transcoder>,
        runner: ProcessRunner,
        tools: Arc<ToolRegistry>,
        conversion: ConversionConfig,
        job_timeout: Duration,
        output_root: PathBuf,
    ) -> Self {
        Self {
            workspaces,
            acquirer,
            transcoder,
            runner,
            tools,
            conversion,
            job_timeout,
            output_root,
        }
    }

    /// Wire a pipeline from configuration, sharing `workspaces` and `tools`
    /// with the rest of the service.
    pub fn from_config(
        config: &Config,
        workspaces: Arc<WorkspaceManager>,
        tools: Arc<ToolRegistry>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Self> {
        let runner = ProcessRunner::new(config.scheduler.cancel_grace());
        let acquirer = InputAcquirer::new(
            config.fetch.clone(),
            config.workspace.uploads_root.clone(),
            Arc::clone(&tools),
            runner.clone(),
        )?
        .with_capture_limit(config.conversion.capture_limit_bytes);
        Ok(Self::new(
            workspaces,
            acquirer,
            transcoder,
            runner,
            tools,
            config.conversion.clone(),
            config.scheduler.job_timeout(),
            config.workspace.output_root.clone(),
        ))
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    async fn run_in(&self, ctx: &JobContext, ws: &Workspace) -> Result<PathBuf> {
        let cancel = &ctx.cancellation;
        let spec = &ctx.spec;

        ctx.check_cancelled()?;
        ctx.progress.stage(Stage::Downloading);
        let staged = self
            .acquirer
            .acquire(&spec.input, ws, spec.checksum.as_deref(), cancel)
            .await?;
        if let Some(media) = staged.media {
            ctx.progress.send(JobProgress::Media(media));
        }
        let input = staged.path;

        ctx.check_cancelled()?;
        ctx.progress.stage(Stage::Converting);
        let opts = spec.output.resolve(&self.conversion);
        let artifact = self.convert(ctx.job_id, ws, &input, &opts, cancel).await?;

        ctx.check_cancelled()?;
        if self.conversion.verify_with_ffprobe {
            ctx.progress.stage(Stage::Verifying);
            if let Some(media) = self.verify(ctx.job_id, &artifact, cancel).await? {
                ctx.progress.send(JobProgress::Media(media));
            }
        }

        ctx.check_cancelled()?;
        ctx.progress.stage(Stage::Publishing);
        self.publish(ctx.job_id, &artifact, &opts).await
    }

    /// Run the transcoder, retrying once with H.264 if the HEVC encoder is
    /// missing and the fallback is enabled.
    async fn convert(
        &self,
        job_id: JobId,
        ws: &Workspace,
        input: &Path,
        opts: &TranscodeOptions,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let output = ws.file(&format!("output.{}", opts.container.extension()))?;

        let mut result = self.transcode(ws, input, &output, opts, cancel).await?;
        if !result.success()
            && self.conversion.fallback_to_h264
            && opts.codec == VideoCodec::Hevc
            && result.stderr.contains(UNKNOWN_ENCODER)
        {
            tracing::warn!(job_id = %job_id, "HEVC encoder unavailable; retrying with H.264");
            remove_if_exists(&output).await?;
            let fallback = opts.with_codec(VideoCodec::H264);
            result = self.transcode(ws, input, &output, &fallback, cancel).await?;
        }

        if !result.success() {
            return Err(Error::conversion(
                self.transcoder.name(),
                format!(
                    "{}: {}",
                    result.describe_exit(),
                    result.stderr_tail(STDERR_TAIL_LINES)
                ),
            ));
        }

        match tokio::fs::metadata(&output).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                tracing::info!(
                    job_id = %job_id,
                    bytes = meta.len(),
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "conversion finished"
                );
                Ok(output)
            }
            Ok(_) => Err(Error::Integrity(format!(
                "{} exited successfully but produced an empty artifact",
                self.transcoder.name()
            ))),
            Err(_) => Err(Error::Integrity(format!(
                "{} exited successfully but produced no artifact",
                self.transcoder.name()
            ))),
        }
    }

    async fn transcode(
        &self,
        ws: &Workspace,
        input: &Path,
        output: &Path,
        opts: &TranscodeOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult> {
        let mut inv = self.transcoder.build(input, output, opts)?;
        inv.current_dir(ws.path())
            .timeout(self.job_timeout)
            .capture_limit(self.conversion.capture_limit_bytes);
        self.runner.run(&inv, cancel).await
    }

    /// Check the artifact with ffprobe, returning what it reported. `None`
    /// when ffprobe is not installed.
    async fn verify(
        &self,
        job_id: JobId,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<MediaInfo>> {
        let Ok(ffprobe) = self.tools.require(FFPROBE) else {
            tracing::debug!(job_id = %job_id, "ffprobe not available; skipping verification");
            return Ok(None);
        };
        let summary =
            verify_output(&self.runner, &ffprobe.path, artifact, VERIFY_TIMEOUT, cancel).await?;
        Ok(Some(MediaInfo::from(&summary)))
    }

    /// Move the artifact to `<output_root>/<job_id>.<ext>`.
    ///
    /// An output root that cannot be written is reported as
    /// [`Error::ResourceExhausted`].
    async fn publish(
        &self,
        job_id: JobId,
        artifact: &Path,
        opts: &TranscodeOptions,
    ) -> Result<PathBuf> {
        let unwritable = |e: std::io::Error| {
            Error::ResourceExhausted(format!(
                "cannot write to output root {}: {e}",
                self.output_root.display()
            ))
        };

        tokio::fs::create_dir_all(&self.output_root)
            .await
            .map_err(unwritable)?;
        let dest = self
            .output_root
            .join(format!("{job_id}.{}", opts.container.extension()));

        // Rename first (same filesystem), fall back to copy+remove.
        if tokio::fs::rename(artifact, &dest).await.is_err() {
            if let Err(e) = tokio::fs::copy(artifact, &dest).await {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(unwritable(e));
            }
            let _ = tokio::fs::remove_file(artifact).await;
        }

        tracing::info!(job_id = %job_id, "published {}", dest.display());
        Ok(dest)
    }
}

#[async_trait]
impl JobRunner for ConversionPipeline {
    fn name(&self) -> &'static str {
        "conversion"
    }

    async fn run(&self, ctx: &JobContext) -> Result<PathBuf> {
        ctx.check_cancelled()?;
        ctx.progress.stage(Stage::Preparing);

        let lease = self.workspaces.lease(ctx.job_id)?;
        ctx.progress
            .send(JobProgress::Workspace(lease.path().to_path_buf()));

        let result = self.run_in(ctx, &lease).await;
        lease.release_async().await;

        if let Err(ref e) = result {
            tracing::debug!(job_id = %ctx.job_id, "pipeline stopped: {e}");
        }
        result
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
