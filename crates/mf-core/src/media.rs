//! Media-domain enums for output containers and codecs.
//!
//! All enums serialize in lowercase (via `serde(rename_all = "lowercase")`) and
//! implement `Display` manually for consistent string representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// Supported output container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mkv,
    Mp4,
    Webm,
}

impl Container {
    /// File extension (without the dot).
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mkv => "mkv",
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }

    /// MIME type used when serving the artifact.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mkv => "video/x-matroska",
            Self::Mp4 => "video/mp4",
            Self::Webm => "video/webm",
        }
    }

    /// Audio codec paired with this container.
    pub fn audio_codec(self) -> AudioCodec {
        match self {
            Self::Mkv | Self::Mp4 => AudioCodec::Aac,
            Self::Webm => AudioCodec::Opus,
        }
    }

    /// Whether the container can carry the given video codec.
    pub fn supports(self, codec: VideoCodec) -> bool {
        match self {
            Self::Mkv => true,
            Self::Mp4 => matches!(codec, VideoCodec::Hevc | VideoCodec::H264),
            Self::Webm => codec == VideoCodec::Vp9,
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Container {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mkv" | "matroska" => Ok(Self::Mkv),
            "mp4" => Ok(Self::Mp4),
            "webm" => Ok(Self::Webm),
            other => Err(Error::Validation(format!("unknown container: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// VideoCodec
// ---------------------------------------------------------------------------

/// Supported output video codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Hevc,
    H264,
    Vp9,
}

impl VideoCodec {
    /// ffmpeg encoder name.
    pub fn encoder(self) -> &'static str {
        match self {
            Self::Hevc => "libx265",
            Self::H264 => "libx264",
            Self::Vp9 => "libvpx-vp9",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hevc => write!(f, "hevc"),
            Self::H264 => write!(f, "h264"),
            Self::Vp9 => write!(f, "vp9"),
        }
    }
}

impl FromStr for VideoCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hevc" | "h265" | "x265" => Ok(Self::Hevc),
            "h264" | "avc" | "x264" => Ok(Self::H264),
            "vp9" => Ok(Self::Vp9),
            other => Err(Error::Validation(format!("unknown video codec: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// AudioCodec
// ---------------------------------------------------------------------------

/// Supported output audio codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
}

impl AudioCodec {
    /// ffmpeg encoder name.
    pub fn encoder(self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Opus => "libopus",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aac => write!(f, "aac"),
            Self::Opus => write!(f, "opus"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_serde_lowercase() {
        let json = serde_json::to_string(&Container::Webm).unwrap();
        assert_eq!(json, "\"webm\"");
        let back: Container = serde_json::from_str("\"mkv\"").unwrap();
        assert_eq!(back, Container::Mkv);
    }

    #[test]
    fn container_codec_compatibility() {
        assert!(Container::Mkv.supports(VideoCodec::Vp9));
        assert!(Container::Mp4.supports(VideoCodec::Hevc));
        assert!(!Container::Mp4.supports(VideoCodec::Vp9));
        assert!(!Container::Webm.supports(VideoCodec::H264));
    }

    #[test]
    fn encoders() {
        assert_eq!(VideoCodec::Hevc.encoder(), "libx265");
        assert_eq!(Container::Webm.audio_codec().encoder(), "libopus");
        assert_eq!(Container::Mkv.mime_type(), "video/x-matroska");
    }

    #[test]
    fn parse_from_cli_strings() {
        assert_eq!("MP4".parse::<Container>().unwrap(), Container::Mp4);
        assert_eq!("h265".parse::<VideoCodec>().unwrap(), VideoCodec::Hevc);
        assert!("avi".parse::<Container>().is_err());
    }
}
