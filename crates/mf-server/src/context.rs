//! Application context.
//!
//! [`AppContext`] is the struct shared across all route handlers via Axum
//! state. It is cheaply cloneable because it only holds `Arc`s.

use std::sync::Arc;

use mf_av::{ToolRegistry, WorkspaceBudget, WorkspaceManager};
use mf_core::config::Config;
use mf_core::events::EventBus;
use mf_pipeline::{
    ConversionPipeline, FfmpegTranscoder, JobRunner, JobScheduler, SchedulerOptions, Transcoder,
};

/// Application context shared by all request handlers (via Axum state).
#[derive(Clone)]
pub struct AppContext {
    /// Immutable application configuration snapshot.
    pub config: Arc<Config>,
    /// The job queue and worker pool.
    pub scheduler: Arc<JobScheduler>,
    /// Job lifecycle events for the dashboard.
    pub event_bus: Arc<EventBus>,
    /// External tool registry.
    pub tools: Arc<ToolRegistry>,
    /// Per-job temporary directories.
    pub workspaces: Arc<WorkspaceManager>,
}

impl AppContext {
    /// Discover tools and wire the production ffmpeg pipeline.
    ///
    /// Must be called inside a Tokio runtime; the scheduler spawns its
    /// workers immediately.
    pub fn from_config(config: Config) -> mf_core::Result<Self> {
        let tools = Arc::new(ToolRegistry::discover(&config.tools));
        let transcoder: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new(Arc::clone(&tools)));
        Self::with_transcoder(config, tools, transcoder)
    }

    /// Like [`from_config`](Self::from_config) with a caller-supplied
    /// transcoder.
    pub fn with_transcoder(
        config: Config,
        tools: Arc<ToolRegistry>,
        transcoder: Arc<dyn Transcoder>,
    ) -> mf_core::Result<Self> {
        let workspaces = Arc::new(WorkspaceManager::new(
            config.workspace.temp_root.clone(),
            WorkspaceBudget::from(&config.workspace),
        )?);
        let pipeline = ConversionPipeline::from_config(
            &config,
            Arc::clone(&workspaces),
            Arc::clone(&tools),
            transcoder,
        )?;
        Ok(Self::with_runner(config, tools, workspaces, Arc::new(pipeline)))
    }

    /// Assemble a context around an arbitrary [`JobRunner`].
    pub fn with_runner(
        config: Config,
        tools: Arc<ToolRegistry>,
        workspaces: Arc<WorkspaceManager>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let scheduler = Arc::new(JobScheduler::start(
            SchedulerOptions::from_config(&config),
            runner,
            Arc::clone(&event_bus),
        ));
        Self {
            config: Arc::new(config),
            scheduler,
            event_bus,
            tools,
            workspaces,
        }
    }
}
