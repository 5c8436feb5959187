//! The [`JobRunner`] trait is what a scheduler worker calls to carry a job
//! from `Running` to a terminal state.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::context::JobContext;

/// Does the actual work for one admitted job.
///
/// The production implementation is
/// [`ConversionPipeline`](crate::ConversionPipeline).
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// A short, human-readable name (e.g. "conversion").
    fn name(&self) -> &'static str;

    /// Run the job and return the path of the published artifact.
    ///
    /// Must return [`mf_core::Error::Cancelled`] promptly once
    /// `ctx.cancellation` fires, and must not return before every external
    /// process it started has exited and its workspace has been released.
    async fn run(&self, ctx: &JobContext) -> mf_core::Result<PathBuf>;
}
