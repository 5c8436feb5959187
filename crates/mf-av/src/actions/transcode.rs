//! ffmpeg transcode invocation.
//!
//! The default profile is HEVC + AAC 96k, scaled down and letterboxed into a
//! 1280x720 frame at preset `medium`, CRF 23.

use std::path::Path;

use mf_core::config::ConversionConfig;
use mf_core::{Container, VideoCodec};

use crate::command::ProcessInvocation;

/// Output encoding parameters for one transcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOptions {
    pub container: Container,
    pub codec: VideoCodec,
    pub crf: u32,
    pub preset: String,
    pub audio_bitrate: String,
    pub max_height: u32,
}

impl TranscodeOptions {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            container: config.container,
            codec: config.codec,
            crf: config.crf,
            preset: config.preset.clone(),
            audio_bitrate: config.audio_bitrate.clone(),
            max_height: config.max_height,
        }
    }

    /// The same options with a different video codec.
    pub fn with_codec(&self, codec: VideoCodec) -> Self {
        Self {
            codec,
            ..self.clone()
        }
    }
}

/// Width of a 16:9 frame of the given height, rounded up to an even number.
pub fn scaled_width(height: u32) -> u32 {
    (height * 16 / 9 + 1) / 2 * 2
}

/// Build the ffmpeg invocation that transcodes `input` into `output`.
///
/// The returned invocation has no timeout, working directory or capture
/// limit set; the caller owns those.
pub fn build_transcode(
    ffmpeg: &Path,
    input: &Path,
    output: &Path,
    opts: &TranscodeOptions,
) -> ProcessInvocation {
    let height = opts.max_height;
    let width = scaled_width(height);
    let audio = opts.container.audio_codec();

    tracing::info!(
        "Transcode: {:?} -> {:?} (encoder={}, crf={}, preset={}, {}x{})",
        input,
        output,
        opts.codec.encoder(),
        opts.crf,
        opts.preset,
        width,
        height,
    );

    let mut cmd = ProcessInvocation::new(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-y"]);
    cmd.arg("-i").arg(input.to_string_lossy().as_ref());
    cmd.args(["-map", "0:v:0", "-map", "0:a:0?"]);

    cmd.args(["-c:v", opts.codec.encoder()]);
    match opts.codec {
        VideoCodec::Hevc | VideoCodec::H264 => {
            cmd.args(["-preset", &opts.preset]);
            cmd.args(["-crf", &opts.crf.to_string()]);
        }
        VideoCodec::Vp9 => {
            // Constant-quality mode needs an explicit zero bitrate.
            cmd.args(["-crf", &opts.crf.to_string(), "-b:v", "0"]);
            cmd.args(["-row-mt", "1"]);
        }
    }
    if opts.container == Container::Mp4 && opts.codec == VideoCodec::Hevc {
        cmd.args(["-tag:v", "hvc1"]);
    }

    cmd.args(["-c:a", audio.encoder(), "-b:a", &opts.audio_bitrate]);
    cmd.args([
        "-vf",
        &format!(
            "scale={width}:{height}:force_original_aspect_ratio=decrease,pad={width}:{height}:(ow-iw)/2:(oh-ih)/2"
        ),
    ]);
    if opts.container == Container::Mp4 {
        cmd.args(["-movflags", "+faststart"]);
    }
    cmd.arg(output.to_string_lossy().as_ref());
    cmd
}
