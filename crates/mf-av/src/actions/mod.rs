//! Invocation builders for the media tools: ffmpeg transcodes and ffprobe
//! verification.

mod probe;
mod transcode;

pub use probe::{parse_probe_output, verify_output, ProbeSummary};
pub use transcode::{build_transcode, scaled_width, TranscodeOptions};
