//! Execution context handed to a [`JobRunner`](crate::JobRunner) for one job.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use mf_core::JobId;

use crate::job::{JobSpec, MediaInfo, Stage};

/// Something the pipeline reports back to the scheduler while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobProgress {
    /// Entered a new stage.
    Stage(Stage),
    /// The workspace assigned to the job.
    Workspace(PathBuf),
    /// Metadata learned about the media.
    Media(MediaInfo),
}

/// Sender for reporting progress from within the pipeline.
pub struct ProgressSender {
    callback: Box<dyn Fn(JobProgress) + Send + Sync>,
}

impl ProgressSender {
    /// Create a new sender from the given callback.
    pub fn new(callback: impl Fn(JobProgress) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Create a sender that discards all reports.
    pub fn noop() -> Self {
        Self {
            callback: Box::new(|_| {}),
        }
    }

    pub fn send(&self, progress: JobProgress) {
        (self.callback)(progress);
    }

    pub fn stage(&self, stage: Stage) {
        self.send(JobProgress::Stage(stage));
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender").finish_non_exhaustive()
    }
}

/// Context passed to the runner for a single job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub spec: Arc<JobSpec>,
    /// Fired when the job is cancelled or the scheduler shuts down.
    pub cancellation: CancellationToken,
    pub progress: Arc<ProgressSender>,
}

impl JobContext {
    /// Create a context with a fresh cancellation token and no progress
    /// reporting.
    pub fn new(job_id: JobId, spec: Arc<JobSpec>) -> Self {
        Self {
            job_id,
            spec,
            cancellation: CancellationToken::new(),
            progress: Arc::new(ProgressSender::noop()),
        }
    }

    /// Builder: attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Builder: attach a progress sender.
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    /// Fail with [`mf_core::Error::Cancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> mf_core::Result<()> {
        if self.cancellation.is_cancelled() {
            Err(mf_core::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
