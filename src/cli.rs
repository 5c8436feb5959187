use clap::{Parser, Subcommand};
use std::path::PathBuf;

use mf_core::{Container, VideoCodec};

#[derive(Parser)]
#[command(name = "mediaforge")]
#[command(author, version, about = "Media download and conversion service")]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and job workers
    Start {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config and PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Convert a single input through the job pipeline and wait for it
    Convert {
        /// http(s) URL or local file
        #[arg(required = true)]
        source: String,

        /// Treat an http(s) source as a page for yt-dlp
        #[arg(long, conflicts_with = "direct")]
        page: bool,

        /// Treat an http(s) source as a direct media link
        #[arg(long)]
        direct: bool,

        /// Output container (mkv, mp4, webm)
        #[arg(long)]
        container: Option<Container>,

        /// Video codec (hevc, h264, vp9)
        #[arg(long)]
        codec: Option<VideoCodec>,

        /// Maximum output height in pixels
        #[arg(long)]
        max_height: Option<u32>,

        /// Constant rate factor
        #[arg(long)]
        crf: Option<u32>,

        /// Expected SHA-256 of the input
        #[arg(long)]
        checksum: Option<String>,

        /// Directory for the finished file (overrides config)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses --config if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
