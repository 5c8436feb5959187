//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which lays out temp/uploads/downloads
//! directories under a [`tempfile::TempDir`], a test configuration, and a
//! full [`AppContext`]. Conversions run through [`ShellTranscoder`], so no
//! real ffmpeg is needed. [`TestHarness::serve`] starts Axum on a random
//! port for HTTP-level testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mf_av::{ProcessInvocation, ToolRegistry, TranscodeOptions, WorkspaceBudget, WorkspaceManager};
use mf_core::config::Config;
use mf_pipeline::{JobRunner, Transcoder};
use mf_server::context::AppContext;
use mf_server::router::build_router;

/// Copies the input to the output.
pub const COPY_SCRIPT: &str = r#"cp "$1" "$2""#;

/// Runs `script` under `/bin/sh` with `$1` = input, `$2` = output and
/// `$3` = encoder name.
pub struct ShellTranscoder {
    script: String,
}

impl ShellTranscoder {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Transcoder for ShellTranscoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn build(
        &self,
        input: &Path,
        output: &Path,
        opts: &TranscodeOptions,
    ) -> mf_core::Result<ProcessInvocation> {
        let mut inv = ProcessInvocation::new("/bin/sh");
        inv.arg("-c")
            .arg(&self.script)
            .arg("sh")
            .arg(input.to_string_lossy().as_ref())
            .arg(output.to_string_lossy().as_ref())
            .arg(opts.codec.encoder());
        Ok(inv)
    }
}

/// Configuration rooted in `dir` with disk checks disabled and uploads
/// enabled.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.workspace.temp_root = dir.join("temp");
    config.workspace.output_root = dir.join("downloads");
    config.workspace.uploads_root = Some(dir.join("uploads"));
    config.workspace.min_free_bytes = 0;
    config.workspace.min_free_inodes = 0;
    config.conversion.verify_with_ffprobe = false;
    config.scheduler.cancel_grace_secs = 1;
    config
}

/// Test harness wrapping a fully-constructed [`AppContext`].
pub struct TestHarness {
    pub ctx: AppContext,
    pub dir: tempfile::TempDir,
}

impl TestHarness {
    /// Harness whose conversions copy the input to the output.
    pub fn new() -> Self {
        Self::with_script(COPY_SCRIPT, |_| {})
    }

    /// Harness that converts with `script`, after `configure` adjusts the
    /// test configuration.
    pub fn with_script(script: &str, configure: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        std::fs::create_dir(dir.path().join("uploads")).expect("failed to create uploads dir");
        let mut config = test_config(dir.path());
        configure(&mut config);
        std::fs::create_dir_all(&config.workspace.output_root)
            .expect("failed to create output dir");

        let ctx = AppContext::with_transcoder(
            config,
            Arc::new(ToolRegistry::default()),
            Arc::new(ShellTranscoder::new(script)),
        )
        .expect("failed to build context");

        Self { ctx, dir }
    }

    /// Harness around an arbitrary [`JobRunner`].
    pub fn with_runner(runner: Arc<dyn JobRunner>, configure: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = test_config(dir.path());
        configure(&mut config);
        let workspaces = Arc::new(
            WorkspaceManager::new(
                config.workspace.temp_root.clone(),
                WorkspaceBudget::from(&config.workspace),
            )
            .expect("failed to create workspace manager"),
        );
        let ctx = AppContext::with_runner(
            config,
            Arc::new(ToolRegistry::default()),
            workspaces,
            runner,
        );
        Self { ctx, dir }
    }

    /// Write an uploaded file and return its name relative to the uploads
    /// root.
    pub fn upload(&self, name: &str, contents: &[u8]) -> String {
        std::fs::write(self.dir.path().join("uploads").join(name), contents)
            .expect("failed to write upload");
        name.to_string()
    }

    /// Root under which job workspaces are created.
    pub fn temp_root(&self) -> PathBuf {
        self.ctx.config.workspace.temp_root.clone()
    }

    /// Number of directories left under the temp root.
    pub fn workspace_dirs(&self) -> usize {
        std::fs::read_dir(self.temp_root())
            .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()).count())
            .unwrap_or(0)
    }

    /// Start an Axum server on a random port and return its address.
    pub async fn serve(&self) -> SocketAddr {
        let app = build_router(self.ctx.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        addr
    }
}

/// Submit a job over HTTP and return `(status, body)`.
pub async fn submit(
    client: &reqwest::Client,
    addr: SocketAddr,
    body: serde_json::Value,
) -> (u16, serde_json::Value) {
    let resp = client
        .post(format!("http://{addr}/api/jobs"))
        .json(&body)
        .send()
        .await
        .expect("request failed");
    let status = resp.status().as_u16();
    let json = resp.json().await.unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Poll `GET /api/jobs/{id}` until the job reaches a terminal state.
pub async fn wait_terminal(
    client: &reqwest::Client,
    addr: SocketAddr,
    id: &str,
) -> serde_json::Value {
    let url = format!("http://{addr}/api/jobs/{id}");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let job: serde_json::Value = client
            .get(&url)
            .send()
            .await
            .expect("request failed")
            .json()
            .await
            .expect("invalid job body");
        if matches!(
            job["state"].as_str(),
            Some("succeeded" | "failed" | "cancelled")
        ) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} did not finish: {job}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until the job reports `state`.
pub async fn wait_state(
    client: &reqwest::Client,
    addr: SocketAddr,
    id: &str,
    state: &str,
) -> serde_json::Value {
    let url = format!("http://{addr}/api/jobs/{id}");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job: serde_json::Value = client
            .get(&url)
            .send()
            .await
            .expect("request failed")
            .json()
            .await
            .expect("invalid job body");
        if job["state"] == state {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} never reached {state}: {job}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
