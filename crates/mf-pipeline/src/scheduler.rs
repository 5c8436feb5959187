//! Job queue and scheduler.
//!
//! One [`JobScheduler`] owns the job table. A fixed pool of worker tasks
//! pulls `Pending` jobs in submission order and hands each to the
//! [`JobRunner`]. At most `max_concurrent_jobs` jobs are `Running` at any
//! moment, so at most that many external processes exist system-wide.
//!
//! All bookkeeping lives behind a single `parking_lot::Mutex`. The lock is
//! never held across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mf_core::config::{Config, ConversionConfig};
use mf_core::events::{EventBus, EventPayload};
use mf_core::{Container, Error, JobId, Result, VideoCodec};

use crate::context::{JobContext, JobProgress, ProgressSender};
use crate::job::{JobFailure, JobSnapshot, JobSpec, JobState, JobStatus, MediaInfo, Stage};
use crate::runner::JobRunner;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Scheduler settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    /// How long terminal jobs stay listed before [`JobScheduler::reap_expired`]
    /// drops them.
    pub job_retention: Duration,
    /// Profile used to validate submissions and resolve their output.
    pub conversion: ConversionConfig,
    pub uploads_root: Option<PathBuf>,
}

impl SchedulerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_jobs: config.scheduler.max_concurrent_jobs.max(1),
            queue_capacity: config.scheduler.queue_capacity,
            job_retention: config.scheduler.job_retention(),
            conversion: config.conversion.clone(),
            uploads_root: config.workspace.uploads_root.clone(),
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

/// What a cancellation request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was pending and is now `Cancelled`; it never ran.
    Cancelled,
    /// The job is running; its processes are being stopped and it will end
    /// as `Cancelled`.
    Signalled,
    /// The job had already reached a terminal state. Nothing changed.
    AlreadyFinished,
}

/// Counters for the admin dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Highest number of simultaneously running jobs observed.
    pub peak_running: usize,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
}

/// Liveness of the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerHealth {
    pub healthy: bool,
    pub workers_alive: usize,
    pub workers_expected: usize,
    pub accepting: bool,
    /// Whether the job table lock was obtained in time.
    pub responsive: bool,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct JobRecord {
    id: JobId,
    seq: u64,
    spec: Arc<JobSpec>,
    status: JobStatus,
    stage: Option<Stage>,
    container: Container,
    codec: VideoCodec,
    download_name: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    workspace: Option<PathBuf>,
    media: Option<MediaInfo>,
    cancel: CancellationToken,
    cancel_requested: bool,
}

impl JobRecord {
    fn snapshot(&self) -> JobSnapshot {
        let (output, failure) = match &self.status {
            JobStatus::Succeeded { output } => (Some(output.clone()), None),
            JobStatus::Failed { failure } => (None, Some(failure.clone())),
            _ => (None, None),
        };
        JobSnapshot {
            id: self.id,
            seq: self.seq,
            state: self.status.state(),
            stage: self.stage,
            input: self.spec.input.clone(),
            container: self.container,
            codec: self.codec,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            workspace: self.workspace.clone(),
            output,
            download_name: self.download_name.clone(),
            failure,
            cancel_requested: self.cancel_requested,
            media: self.media.clone(),
        }
    }

    fn artifact(&self) -> Option<&Path> {
        match &self.status {
            JobStatus::Succeeded { output } => Some(output),
            _ => None,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<JobId, JobRecord>,
    /// Pending job ids in submission order.
    pending: VecDeque<JobId>,
    running: usize,
    peak_running: usize,
    next_seq: u64,
    accepting: bool,
}

struct Inner {
    state: Mutex<SchedulerState>,
    /// Wakes idle workers when a job is queued.
    work_ready: Notify,
    /// Wakes waiters when any job reaches a terminal state.
    job_finished: Notify,
    runner: Arc<dyn JobRunner>,
    events: Arc<EventBus>,
    options: SchedulerOptions,
    alive_workers: AtomicUsize,
    shutdown: CancellationToken,
}

/// A job a worker has just admitted.
struct Admitted {
    id: JobId,
    spec: Arc<JobSpec>,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// JobScheduler
// ---------------------------------------------------------------------------

/// Bounded job queue with a fixed worker pool.
pub struct JobScheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Create the scheduler and spawn its workers on the current runtime.
    pub fn start(
        options: SchedulerOptions,
        runner: Arc<dyn JobRunner>,
        events: Arc<EventBus>,
    ) -> Self {
        let worker_count = options.max_concurrent_jobs.max(1);
        let inner = Arc::new(Inner {
            state: Mutex::new(SchedulerState {
                accepting: true,
                ..SchedulerState::default()
            }),
            work_ready: Notify::new(),
            job_finished: Notify::new(),
            runner,
            events,
            options,
            alive_workers: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });

        let workers = (0..worker_count)
            .map(|index| {
                inner.alive_workers.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(worker_loop(Arc::clone(&inner), index))
            })
            .collect();

        tracing::info!(
            workers = worker_count,
            queue_capacity = inner.options.queue_capacity,
            runner = inner.runner.name(),
            "Job scheduler started"
        );

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    /// Validate `spec` and queue it as a `Pending` job.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a malformed request.
    /// - [`Error::QueueFull`] when the pending queue is at capacity. No job
    ///   record is created.
    /// - [`Error::Conflict`] once the scheduler is shutting down.
    pub fn submit(&self, spec: JobSpec) -> Result<JobId> {
        let options = &self.inner.options;
        spec.validate(&options.conversion, options.uploads_root.as_deref())?;
        let resolved = spec.output.resolve(&options.conversion);

        let id = JobId::new();
        {
            let mut state = self.inner.state.lock();
            if !state.accepting {
                return Err(Error::Conflict("scheduler is shutting down".into()));
            }
            if state.pending.len() >= options.queue_capacity {
                return Err(Error::QueueFull {
                    depth: state.pending.len(),
                    capacity: options.queue_capacity,
                });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let record = JobRecord {
                id,
                seq,
                download_name: spec.download_name(id, resolved.container),
                spec: Arc::new(spec),
                status: JobStatus::Pending,
                stage: None,
                container: resolved.container,
                codec: resolved.codec,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                workspace: None,
                media: None,
                cancel: self.inner.shutdown.child_token(),
                cancel_requested: false,
            };
            tracing::info!(job_id = %id, seq, input = %record.spec.input, "Job queued");
            state.jobs.insert(id, record);
            state.pending.push_back(id);
        }

        self.inner.events.publish(EventPayload::JobQueued { job_id: id });
        self.inner.work_ready.notify_one();
        Ok(id)
    }

    /// Request cancellation of a job.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id.
    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        let outcome = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let record = state
                .jobs
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("job", id))?;

            match record.status.state() {
                JobState::Pending => {
                    record.status.transition(JobStatus::Cancelled)?;
                    record.cancel_requested = true;
                    record.finished_at = Some(Utc::now());
                    state.pending.retain(|pending| *pending != id);
                    CancelOutcome::Cancelled
                }
                JobState::Running => {
                    record.cancel_requested = true;
                    record.cancel.cancel();
                    CancelOutcome::Signalled
                }
                _ => CancelOutcome::AlreadyFinished,
            }
        };

        match outcome {
            CancelOutcome::Cancelled => {
                tracing::info!(job_id = %id, "Pending job cancelled");
                self.inner.events.publish(EventPayload::JobCancelled { job_id: id });
                self.inner.job_finished.notify_waiters();
            }
            CancelOutcome::Signalled => tracing::info!(job_id = %id, "Cancelling running job"),
            CancelOutcome::AlreadyFinished => {
                tracing::debug!(job_id = %id, "Cancel ignored; job already finished")
            }
        }
        Ok(outcome)
    }

    /// Snapshot of one job.
    pub fn status(&self, id: JobId) -> Result<JobSnapshot> {
        self.inner
            .state
            .lock()
            .jobs
            .get(&id)
            .map(JobRecord::snapshot)
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// All known jobs, oldest submission first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let state = self.inner.state.lock();
        let mut jobs: Vec<JobSnapshot> = state.jobs.values().map(JobRecord::snapshot).collect();
        jobs.sort_by(|a, b| a.seq.cmp(&b.seq).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Wait until `id` reaches a terminal state and return its snapshot.
    pub async fn wait(&self, id: JobId) -> Result<JobSnapshot> {
        loop {
            let notified = self.inner.job_finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snapshot = self.status(id)?;
            if snapshot.state.is_terminal() {
                return Ok(snapshot);
            }
            notified.await;
        }
    }

    /// Forget a terminal job and delete its published artifact.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id, [`Error::Conflict`] if the job
    /// has not finished yet.
    pub async fn purge(&self, id: JobId) -> Result<()> {
        let artifact = {
            let mut state = self.inner.state.lock();
            let record = state
                .jobs
                .get(&id)
                .ok_or_else(|| Error::not_found("job", id))?;
            if !record.status.is_terminal() {
                return Err(Error::Conflict(format!(
                    "job {id} is {}; cancel it before purging",
                    record.status.state()
                )));
            }
            let artifact = record.artifact().map(Path::to_path_buf);
            state.jobs.remove(&id);
            artifact
        };

        if let Some(path) = artifact {
            remove_artifact(&path).await;
        }
        tracing::info!(job_id = %id, "Job purged");
        Ok(())
    }

    /// Drop terminal jobs that finished more than `job_retention` before
    /// `now`, deleting their artifacts. Returns the number removed.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = self.inner.options.job_retention;
        let expired: Vec<(JobId, Option<PathBuf>)> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<JobId> = state
                .jobs
                .values()
                .filter(|r| r.status.is_terminal())
                .filter(|r| {
                    r.finished_at.is_some_and(|at| {
                        now.signed_duration_since(at)
                            .to_std()
                            .is_ok_and(|age| age > retention)
                    })
                })
                .map(|r| r.id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.jobs.remove(&id))
                .map(|r| {
                    let artifact = r.artifact().map(Path::to_path_buf);
                    (r.id, artifact)
                })
                .collect()
        };

        for (id, artifact) in &expired {
            if let Some(path) = artifact {
                remove_artifact(path).await;
            }
            tracing::debug!(job_id = %id, "Expired job reaped");
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Reaped expired jobs");
        }
        expired.len()
    }

    /// Liveness check. Has no side effects and never waits on the job
    /// table: a held lock reports `responsive: false`.
    pub fn health(&self) -> SchedulerHealth {
        let workers_expected = self.inner.options.max_concurrent_jobs.max(1);
        let workers_alive = self.inner.alive_workers.load(Ordering::SeqCst);
        let (responsive, accepting) = match self.inner.state.try_lock() {
            Some(state) => (true, state.accepting),
            None => (false, !self.inner.shutdown.is_cancelled()),
        };
        SchedulerHealth {
            healthy: responsive && accepting && workers_alive == workers_expected,
            workers_alive,
            workers_expected,
            accepting,
            responsive,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        let mut stats = SchedulerStats {
            pending: state.pending.len(),
            running: state.running,
            peak_running: state.peak_running,
            max_concurrent_jobs: self.inner.options.max_concurrent_jobs,
            queue_capacity: self.inner.options.queue_capacity,
            ..SchedulerStats::default()
        };
        for record in state.jobs.values() {
            match record.status.state() {
                JobState::Succeeded => stats.succeeded += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
                JobState::Pending | JobState::Running => {}
            }
        }
        stats
    }

    /// Stop accepting work, cancel pending and running jobs, and wait for
    /// every worker to exit.
    pub async fn shutdown(&self) {
        let cancelled: Vec<JobId> = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.accepting = false;
            let pending: Vec<JobId> = state.pending.drain(..).collect();
            for id in &pending {
                if let Some(record) = state.jobs.get_mut(id) {
                    let _ = record.status.transition(JobStatus::Cancelled);
                    record.cancel_requested = true;
                    record.finished_at = Some(Utc::now());
                }
            }
            for record in state.jobs.values_mut() {
                if record.status.state() == JobState::Running {
                    record.cancel_requested = true;
                }
            }
            pending
        };
        for id in cancelled {
            self.inner.events.publish(EventPayload::JobCancelled { job_id: id });
        }

        self.inner.shutdown.cancel();
        self.inner.work_ready.notify_waiters();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler worker ended abnormally: {e}");
            }
        }
        self.inner.job_finished.notify_waiters();
        tracing::info!("Job scheduler stopped");
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.work_ready.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn worker_loop(inner: Arc<Inner>, index: usize) {
    tracing::debug!(worker = index, "Scheduler worker started");

    loop {
        let notified = inner.work_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if inner.shutdown.is_cancelled() {
            break;
        }

        match admit_next(&inner) {
            Some(job) => run_job(&inner, job).await,
            None => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = inner.shutdown.cancelled() => break,
                }
            }
        }
    }

    inner.alive_workers.fetch_sub(1, Ordering::SeqCst);
    tracing::debug!(worker = index, "Scheduler worker stopped");
}

/// Pop the oldest pending job and mark it `Running`.
fn admit_next(inner: &Inner) -> Option<Admitted> {
    let admitted = {
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        if !state.accepting {
            return None;
        }

        let mut admitted = None;
        while let Some(id) = state.pending.pop_front() {
            let Some(record) = state.jobs.get_mut(&id) else {
                continue;
            };
            if record.status.transition(JobStatus::Running).is_err() {
                continue;
            }
            record.started_at = Some(Utc::now());
            state.running += 1;
            state.peak_running = state.peak_running.max(state.running);
            admitted = Some(Admitted {
                id,
                spec: Arc::clone(&record.spec),
                cancel: record.cancel.clone(),
            });
            break;
        }

        // More work left for another idle worker.
        if admitted.is_some() && !state.pending.is_empty() {
            inner.work_ready.notify_one();
        }
        admitted
    };

    if let Some(ref job) = admitted {
        inner.events.publish(EventPayload::JobStarted { job_id: job.id });
        tracing::info!(job_id = %job.id, "Job started");
    }
    admitted
}

async fn run_job(inner: &Arc<Inner>, job: Admitted) {
    let progress = progress_sender(Arc::downgrade(inner), job.id);
    let ctx = JobContext::new(job.id, job.spec)
        .with_cancellation(job.cancel)
        .with_progress(progress);

    let result = match AssertUnwindSafe(inner.runner.run(&ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(Error::Internal(format!(
            "{} runner panicked",
            inner.runner.name()
        ))),
    };

    finish_job(inner, job.id, result).await;
}

/// Record the runner's outcome as the job's terminal status.
async fn finish_job(inner: &Inner, id: JobId, result: Result<PathBuf>) {
    let mut discard = None;
    let event = {
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        state.running = state.running.saturating_sub(1);

        let Some(record) = state.jobs.get_mut(&id) else {
            return;
        };
        record.finished_at = Some(Utc::now());
        record.workspace = None;

        // A requested cancel wins over whatever the runner returned.
        let (next, event) = if record.cancel_requested {
            discard = result.ok();
            (JobStatus::Cancelled, EventPayload::JobCancelled { job_id: id })
        } else {
            match result {
                Ok(output) => {
                    let event = EventPayload::JobSucceeded {
                        job_id: id,
                        output: output.display().to_string(),
                    };
                    (JobStatus::Succeeded { output }, event)
                }
                Err(Error::Cancelled) => {
                    (JobStatus::Cancelled, EventPayload::JobCancelled { job_id: id })
                }
                Err(e) => {
                    let failure = JobFailure::from(&e);
                    let event = EventPayload::JobFailed {
                        job_id: id,
                        kind: failure.kind,
                        error: failure.detail.clone(),
                    };
                    (JobStatus::Failed { failure }, event)
                }
            }
        };

        if let Err(e) = record.status.transition(next) {
            tracing::error!(job_id = %id, "Could not record job outcome: {e}");
            None
        } else {
            Some(event)
        }
    };

    if let Some(path) = discard {
        remove_artifact(&path).await;
    }

    if let Some(event) = event {
        match &event {
            EventPayload::JobSucceeded { output, .. } => {
                tracing::info!(job_id = %id, output = %output, "Job succeeded")
            }
            EventPayload::JobFailed { kind, error, .. } => {
                tracing::warn!(job_id = %id, kind = %kind, "Job failed: {error}")
            }
            _ => tracing::info!(job_id = %id, "Job cancelled"),
        }
        inner.events.publish(event);
    }
    inner.job_finished.notify_waiters();
}

fn progress_sender(inner: Weak<Inner>, id: JobId) -> ProgressSender {
    ProgressSender::new(move |progress| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let stage = {
            let mut state = inner.state.lock();
            let Some(record) = state.jobs.get_mut(&id) else {
                return;
            };
            match progress {
                JobProgress::Stage(stage) => {
                    record.stage = Some(stage);
                    Some(stage)
                }
                JobProgress::Workspace(path) => {
                    record.workspace = Some(path);
                    None
                }
                JobProgress::Media(info) => {
                    record.media.get_or_insert_with(MediaInfo::default).merge(info);
                    None
                }
            }
        };
        if let Some(stage) = stage {
            tracing::debug!(job_id = %id, stage = %stage, "Job stage");
            inner.events.publish(EventPayload::JobStage {
                job_id: id,
                stage: stage.to_string(),
            });
        }
    })
}

async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed artifact {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove artifact {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::InputSource;
    use async_trait::async_trait;
    use mf_core::ErrorKind;

    /// Sleeps for `delay` (or until cancelled) and tracks concurrency.
    struct FakeRunner {
        delay: Duration,
        outcome: fn(&JobContext) -> Result<PathBuf>,
        invocations: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<JobId>>,
    }

    impl FakeRunner {
        fn new(delay: Duration) -> Arc<Self> {
            Self::with_outcome(delay, |ctx| {
                Ok(PathBuf::from(format!("/out/{}.mkv", ctx.job_id)))
            })
        }

        fn with_outcome(
            delay: Duration,
            outcome: fn(&JobContext) -> Result<PathBuf>,
        ) -> Arc<Self> {
            Arc::new(Self {
                delay,
                outcome,
                invocations: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl JobRunner for FakeRunner {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn run(&self, ctx: &JobContext) -> Result<PathBuf> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.order.lock().push(ctx.job_id);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            ctx.progress.stage(Stage::Converting);

            let result = tokio::select! {
                _ = tokio::time::sleep(self.delay) => (self.outcome)(ctx),
                _ = ctx.cancellation.cancelled() => Err(Error::Cancelled),
            };
            self.current.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl JobRunner for PanickingRunner {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn run(&self, _ctx: &JobContext) -> Result<PathBuf> {
            panic!("boom");
        }
    }

    fn options(workers: usize, capacity: usize) -> SchedulerOptions {
        SchedulerOptions {
            max_concurrent_jobs: workers,
            queue_capacity: capacity,
            ..SchedulerOptions::default()
        }
    }

    fn spec() -> JobSpec {
        JobSpec::new(InputSource::Url("https://example.com/clip.mp4".into()))
    }

    fn scheduler(workers: usize, capacity: usize, runner: Arc<dyn JobRunner>) -> JobScheduler {
        JobScheduler::start(options(workers, capacity), runner, Arc::new(EventBus::default()))
    }

    async fn wait_for_state(sched: &JobScheduler, id: JobId, want: JobState) {
        for _ in 0..200 {
            if sched.status(id).unwrap().state == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {want}");
    }

    #[tokio::test]
    async fn runs_job_to_success() {
        let runner = FakeRunner::new(Duration::from_millis(10));
        let sched = scheduler(2, 8, runner.clone());

        let id = sched.submit(spec()).unwrap();
        let snap = sched.wait(id).await.unwrap();
        assert_eq!(snap.state, JobState::Succeeded);
        assert_eq!(snap.output, Some(PathBuf::from(format!("/out/{id}.mkv"))));
        assert_eq!(snap.stage, Some(Stage::Converting));
        assert!(snap.started_at.is_some() && snap.finished_at.is_some());
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn three_jobs_on_two_workers() {
        let runner = FakeRunner::new(Duration::from_millis(300));
        let sched = scheduler(2, 8, runner.clone());

        let ids: Vec<JobId> = (0..3).map(|_| sched.submit(spec()).unwrap()).collect();
        wait_for_state(&sched, ids[0], JobState::Running).await;
        wait_for_state(&sched, ids[1], JobState::Running).await;
        assert_eq!(sched.status(ids[2]).unwrap().state, JobState::Pending);

        for id in &ids {
            assert_eq!(sched.wait(*id).await.unwrap().state, JobState::Succeeded);
        }
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
        assert_eq!(sched.stats().peak_running, 2);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn peak_concurrency_never_exceeds_workers() {
        let runner = FakeRunner::new(Duration::from_millis(20));
        let sched = scheduler(3, 64, runner.clone());

        let ids: Vec<JobId> = (0..20).map(|_| sched.submit(spec()).unwrap()).collect();
        for id in ids {
            sched.wait(id).await.unwrap();
        }
        assert!(runner.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(sched.stats().succeeded, 20);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn queue_full_creates_no_record() {
        let runner = FakeRunner::new(Duration::from_secs(5));
        let sched = scheduler(1, 1, runner.clone());

        let first = sched.submit(spec()).unwrap();
        wait_for_state(&sched, first, JobState::Running).await;
        sched.submit(spec()).unwrap();

        let err = sched.submit(spec()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueFull);
        assert_eq!(sched.list().len(), 2);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected() {
        let sched = scheduler(1, 4, FakeRunner::new(Duration::ZERO));
        let err = sched
            .submit(JobSpec::new(InputSource::Url("file:///etc/passwd".into())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(sched.list().is_empty());
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_pending_job_never_runs_it() {
        let runner = FakeRunner::new(Duration::from_millis(300));
        let sched = scheduler(1, 8, runner.clone());

        let first = sched.submit(spec()).unwrap();
        let second = sched.submit(spec()).unwrap();
        wait_for_state(&sched, first, JobState::Running).await;

        assert_eq!(sched.cancel(second).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(sched.status(second).unwrap().state, JobState::Cancelled);

        sched.wait(first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
        assert!(!runner.order.lock().contains(&second));
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_running_job_signals_runner() {
        let runner = FakeRunner::new(Duration::from_secs(30));
        let sched = scheduler(1, 8, runner.clone());

        let id = sched.submit(spec()).unwrap();
        wait_for_state(&sched, id, JobState::Running).await;

        assert_eq!(sched.cancel(id).unwrap(), CancelOutcome::Signalled);
        let snap = sched.wait(id).await.unwrap();
        assert_eq!(snap.state, JobState::Cancelled);
        assert!(snap.cancel_requested);

        assert_eq!(sched.cancel(id).unwrap(), CancelOutcome::AlreadyFinished);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let sched = scheduler(1, 8, FakeRunner::new(Duration::ZERO));
        let id = JobId::new();
        assert_eq!(sched.status(id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(sched.cancel(id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(sched.purge(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn failure_records_kind() {
        let runner = FakeRunner::with_outcome(Duration::ZERO, |_| {
            Err(Error::Integrity("empty artifact".into()))
        });
        let sched = scheduler(1, 8, runner);

        let id = sched.submit(spec()).unwrap();
        let snap = sched.wait(id).await.unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.failure.unwrap().kind, ErrorKind::IntegrityError);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn runner_panic_fails_job_and_keeps_worker() {
        let sched = scheduler(1, 8, Arc::new(PanickingRunner));

        let id = sched.submit(spec()).unwrap();
        let snap = sched.wait(id).await.unwrap();
        assert_eq!(snap.failure.unwrap().kind, ErrorKind::Internal);
        assert!(sched.health().healthy);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn purge_requires_terminal_state() {
        let runner = FakeRunner::new(Duration::from_secs(30));
        let sched = scheduler(1, 8, runner);
        let id = sched.submit(spec()).unwrap();
        assert_eq!(sched.purge(id).await.unwrap_err().kind(), ErrorKind::Conflict);

        sched.cancel(id).unwrap();
        sched.wait(id).await.unwrap();
        sched.purge(id).await.unwrap();
        assert_eq!(sched.status(id).unwrap_err().kind(), ErrorKind::NotFound);
        sched.shutdown().await;
    }

    fn temp_artifact(ctx: &JobContext) -> Result<PathBuf> {
        Ok(std::env::temp_dir().join(format!("mf-sched-{}.mkv", ctx.job_id)))
    }

    #[tokio::test]
    async fn purge_removes_artifact() {
        let sched = scheduler(1, 8, FakeRunner::with_outcome(Duration::ZERO, temp_artifact));
        let id = sched.submit(spec()).unwrap();
        let output = sched.wait(id).await.unwrap().output.unwrap();
        std::fs::write(&output, b"data").unwrap();

        sched.purge(id).await.unwrap();
        assert!(!output.exists());
        assert!(sched.list().is_empty());
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_wins_over_late_success() {
        let sched = scheduler(1, 8, FakeRunner::with_outcome(Duration::ZERO, temp_artifact));
        let id = sched.submit(spec()).unwrap();
        // Job may finish before the cancel lands; either way the outcome is
        // consistent with the acknowledgement.
        match sched.cancel(id).unwrap() {
            CancelOutcome::AlreadyFinished => {
                assert_eq!(sched.wait(id).await.unwrap().state, JobState::Succeeded)
            }
            _ => assert_eq!(sched.wait(id).await.unwrap().state, JobState::Cancelled),
        }
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn reap_expired_drops_old_terminal_jobs() {
        let sched = scheduler(1, 8, FakeRunner::new(Duration::ZERO));
        let id = sched.submit(spec()).unwrap();
        sched.wait(id).await.unwrap();

        assert_eq!(sched.reap_expired(Utc::now()).await, 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(sched.reap_expired(later).await, 1);
        assert!(sched.list().is_empty());
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn list_and_execution_follow_submission_order() {
        let runner = FakeRunner::new(Duration::from_millis(5));
        let sched = scheduler(1, 8, runner.clone());
        let ids: Vec<JobId> = (0..4).map(|_| sched.submit(spec()).unwrap()).collect();
        let listed: Vec<JobId> = sched.list().into_iter().map(|s| s.id).collect();
        assert_eq!(listed, ids);

        sched.wait(ids[3]).await.unwrap();
        assert_eq!(*runner.order.lock(), ids);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn events_follow_lifecycle() {
        let events = Arc::new(EventBus::default());
        let sched = JobScheduler::start(
            options(1, 8),
            FakeRunner::new(Duration::ZERO),
            Arc::clone(&events),
        );
        let id = sched.submit(spec()).unwrap();
        sched.wait(id).await.unwrap();

        let kinds: Vec<String> = events
            .recent_events(10)
            .into_iter()
            .rev()
            .map(|e| {
                let payload = serde_json::to_value(&e.payload).unwrap();
                payload["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(kinds, ["job_queued", "job_started", "job_stage", "job_succeeded"]);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn media_reports_are_merged_into_snapshot() {
        let runner = FakeRunner::with_outcome(Duration::ZERO, |ctx| {
            ctx.progress.send(JobProgress::Media(MediaInfo {
                title: Some("Launch Day".into()),
                duration_secs: Some(3725),
                width: Some(1920),
                height: Some(1080),
                ..MediaInfo::default()
            }));
            ctx.progress.send(JobProgress::Media(MediaInfo {
                duration_secs: Some(3724),
                width: Some(1280),
                height: Some(720),
                video_codec: Some("hevc".into()),
                ..MediaInfo::default()
            }));
            Ok(PathBuf::from(format!("/out/{}.mkv", ctx.job_id)))
        });
        let sched = scheduler(1, 8, runner);

        let id = sched.submit(spec()).unwrap();
        let media = sched.wait(id).await.unwrap().media.unwrap();
        assert_eq!(media.title.as_deref(), Some("Launch Day"));
        assert_eq!(media.duration_secs, Some(3724));
        assert_eq!((media.width, media.height), (Some(1280), Some(720)));
        assert_eq!(media.video_codec.as_deref(), Some("hevc"));
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn jobs_without_media_reports_have_none() {
        let sched = scheduler(1, 8, FakeRunner::new(Duration::ZERO));
        let id = sched.submit(spec()).unwrap();
        assert_eq!(sched.wait(id).await.unwrap().media, None);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn health_does_not_wait_on_held_job_table() {
        let sched = scheduler(1, 8, FakeRunner::new(Duration::ZERO));
        let held = sched.inner.state.lock();

        let started = std::time::Instant::now();
        let health = sched.health();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(!health.responsive);
        assert!(!health.healthy);
        assert!(health.accepting);

        drop(held);
        assert!(sched.health().responsive);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn health_and_shutdown() {
        let runner = FakeRunner::new(Duration::from_secs(30));
        let sched = scheduler(2, 8, runner);
        assert!(sched.health().healthy);
        assert_eq!(sched.health().workers_alive, 2);

        let running = sched.submit(spec()).unwrap();
        wait_for_state(&sched, running, JobState::Running).await;

        sched.shutdown().await;
        let health = sched.health();
        assert!(!health.healthy);
        assert!(!health.accepting);
        assert_eq!(health.workers_alive, 0);
        assert_eq!(sched.status(running).unwrap().state, JobState::Cancelled);
        assert_eq!(sched.submit(spec()).unwrap_err().kind(), ErrorKind::Conflict);
    }
}
