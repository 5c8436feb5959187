//! # mf-av
//!
//! External process execution, workspace management and tool discovery for
//! the mediaforge pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg,
//!   ffprobe and yt-dlp.
//! - **Process execution** ([`ProcessRunner`]) -- runs a [`ProcessInvocation`]
//!   in its own process group with a timeout, cooperative cancellation and
//!   bounded output capture.
//! - **Workspace management** ([`WorkspaceManager`]) -- one scoped temporary
//!   directory per job, budgeted and always reclaimed.
//! - **Action builders** ([`actions`]) -- ffmpeg transcode and ffprobe
//!   verification invocations.

pub mod actions;
pub mod command;
pub mod tools;
pub mod workspace;

// ---- Re-exports for convenience ----

pub use command::{ProcessInvocation, ProcessResult, ProcessRunner};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use workspace::{Workspace, WorkspaceBudget, WorkspaceLease, WorkspaceManager};

pub use actions::{
    build_transcode, parse_probe_output, verify_output, ProbeSummary, TranscodeOptions,
};
