//! The [`Transcoder`] seam: turns an input file and output options into the
//! process invocation that produces the artifact.

use std::path::Path;
use std::sync::Arc;

use mf_av::tools::FFMPEG;
use mf_av::{build_transcode, ProcessInvocation, ToolRegistry, TranscodeOptions};

/// Builds the transform invocation for a job.
pub trait Transcoder: Send + Sync {
    /// Tool name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Build the invocation that reads `input` and writes `output`.
    fn build(
        &self,
        input: &Path,
        output: &Path,
        opts: &TranscodeOptions,
    ) -> mf_core::Result<ProcessInvocation>;
}

/// [`Transcoder`] backed by the discovered ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    tools: Arc<ToolRegistry>,
}

impl FfmpegTranscoder {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &'static str {
        FFMPEG
    }

    fn build(
        &self,
        input: &Path,
        output: &Path,
        opts: &TranscodeOptions,
    ) -> mf_core::Result<ProcessInvocation> {
        let ffmpeg = self.tools.require(FFMPEG)?;
        Ok(build_transcode(&ffmpeg.path, input, output, opts))
    }
}
