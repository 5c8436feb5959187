//! # mf-pipeline
//!
//! Job model, scheduling and the conversion pipeline.
//!
//! This crate provides:
//!
//! - **Job model** ([`job`]) -- [`JobSpec`], the [`JobStatus`] state machine
//!   and read-only [`JobSnapshot`]s.
//! - **[`JobScheduler`]** -- bounded FIFO queue, fixed worker pool,
//!   cancellation, retention and liveness.
//! - **[`JobRunner`]** trait -- the seam between scheduler and pipeline.
//! - **[`ConversionPipeline`]** -- stages input, runs the [`Transcoder`],
//!   verifies and publishes the artifact inside a leased workspace.
//! - **[`InputAcquirer`]** -- HTTP downloads, yt-dlp extraction and uploaded
//!   files, with size and checksum validation.

pub mod acquire;
pub mod context;
pub mod job;
pub mod pipeline;
pub mod runner;
pub mod scheduler;
pub mod transcoder;

// Re-export key types at the crate root.
pub use acquire::{InputAcquirer, StagedInput};
pub use context::{JobContext, JobProgress, ProgressSender};
pub use job::{
    InputSource, JobFailure, JobSnapshot, JobSpec, JobState, JobStatus, MediaInfo, OutputOptions,
    Stage,
};
pub use pipeline::ConversionPipeline;
pub use runner::JobRunner;
pub use scheduler::{CancelOutcome, JobScheduler, SchedulerHealth, SchedulerOptions, SchedulerStats};
pub use transcoder::{FfmpegTranscoder, Transcoder};
