//! Input acquisition: stage a job's input inside its workspace.
//!
//! Three sources are supported: a direct HTTP(S) download, a web page
//! resolved through yt-dlp, and a file already present under the uploads
//! root. Whatever the source, the staged file is validated before the
//! conversion starts: it must be non-empty, below the configured size
//! ceiling and, when a checksum was supplied, match it.
//!
//! Failures to obtain the input are reported as conversion errors (the input
//! is unusable); an empty or checksum-mismatched input is an integrity error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use mf_av::tools::YTDLP;
use mf_av::{ProcessInvocation, ProcessRunner, ToolRegistry, Workspace};
use mf_core::config::FetchConfig;
use mf_core::{Error, Result};

use crate::job::{resolve_upload, whole_seconds, InputSource, MediaInfo};

/// yt-dlp format selection: prefer 720p, then 480p, then whatever exists.
const FORMAT_LADDER: &str = "best[height<=720]/best[height<=480]/best";

/// Printed by yt-dlp once the file is in place: one JSON object per line.
const METADATA_TEMPLATE: &str = "after_move:%(.{title,thumbnail,duration,width,height})j";

/// Stem of the staged input file inside the workspace.
const INPUT_STEM: &str = "input";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const HASH_CHUNK: usize = 64 * 1024;

/// An input staged inside a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    pub path: PathBuf,
    /// Metadata reported by the extractor. Only page inputs carry it.
    pub media: Option<MediaInfo>,
}

/// Fetches or copies job inputs into workspaces.
#[derive(Debug, Clone)]
pub struct InputAcquirer {
    client: reqwest::Client,
    tools: Arc<ToolRegistry>,
    runner: ProcessRunner,
    fetch: FetchConfig,
    uploads_root: Option<PathBuf>,
    capture_limit: usize,
}

impl InputAcquirer {
    pub fn new(
        fetch: FetchConfig,
        uploads_root: Option<PathBuf>,
        tools: Arc<ToolRegistry>,
        runner: ProcessRunner,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(fetch.user_agent.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            tools,
            runner,
            fetch,
            uploads_root,
            capture_limit: 64 * 1024,
        })
    }

    /// Builder: bytes of yt-dlp output retained for error reports.
    pub fn with_capture_limit(mut self, bytes: usize) -> Self {
        self.capture_limit = bytes;
        self
    }

    /// Stage `source` inside `ws` and validate it.
    pub async fn acquire(
        &self,
        source: &InputSource,
        ws: &Workspace,
        checksum: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<StagedInput> {
        let (path, media) = match source {
            InputSource::Url(url) => (self.download(url, ws, cancel).await?, None),
            InputSource::Page(url) => self.extract(url, ws, cancel).await?,
            InputSource::Upload(path) => (self.copy_upload(path, ws).await?, None),
        };
        self.validate_input(&path, checksum).await?;
        tracing::debug!(job_id = %ws.job_id(), "input staged at {}", path.display());
        Ok(StagedInput { path, media })
    }

    // -- Direct download ----------------------------------------------------

    async fn download(
        &self,
        url: &str,
        ws: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let dest = ws.file(&input_file_name(url_extension(url).as_deref()))?;
        let budget = self.fetch.timeout();

        tracing::info!(job_id = %ws.job_id(), "Downloading {url}");
        tokio::select! {
            res = tokio::time::timeout(budget, self.stream_to_file(url, &dest)) => match res {
                Ok(inner) => inner?,
                Err(_) => return Err(Error::timeout("fetch", budget)),
            },
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
        Ok(dest)
    }

    async fn stream_to_file(&self, url: &str, dest: &Path) -> Result<()> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::conversion("fetch", format!("request to {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::conversion("fetch", format!("{url} returned HTTP {status}")));
        }
        if let Some(len) = resp.content_length() {
            self.check_size(len)?;
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| Error::conversion("fetch", format!("reading body of {url}: {e}")))?
        {
            written += chunk.len() as u64;
            self.check_size(written)?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::debug!("Downloaded {written} bytes from {url}");
        Ok(())
    }

    // -- Extractor download -------------------------------------------------

    async fn extract(
        &self,
        url: &str,
        ws: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, Option<MediaInfo>)> {
        let ytdlp = self.tools.require(YTDLP)?;

        let mut cmd = ProcessInvocation::new(&ytdlp.path);
        cmd.args(["--no-playlist", "--no-progress", "--no-part"]);
        // --print alone implies --simulate.
        cmd.args(["--no-simulate", "--print", METADATA_TEMPLATE]);
        cmd.args(["-f", FORMAT_LADDER]);
        cmd.args(["--max-filesize", &self.fetch.max_input_bytes.to_string()]);
        cmd.args(["--user-agent", &self.fetch.user_agent]);
        if let Some(ref cookies) = self.fetch.cookies_file {
            if cookies.exists() {
                cmd.arg("--cookies").arg(cookies.to_string_lossy().as_ref());
            }
        }
        let template = ws.path().join(format!("{INPUT_STEM}.%(ext)s"));
        cmd.arg("-o").arg(template.to_string_lossy().as_ref());
        cmd.arg("--").arg(url);
        cmd.current_dir(ws.path())
            .timeout(self.fetch.timeout())
            .capture_limit(self.capture_limit);

        tracing::info!(job_id = %ws.job_id(), "Extracting {url} with yt-dlp");
        let result = self.runner.run(&cmd, cancel).await?;
        if !result.success() {
            return Err(Error::conversion(
                YTDLP,
                format!("{}: {}", result.describe_exit(), result.stderr_tail(10)),
            ));
        }

        let staged = find_staged_input(ws.path())
            .await?
            .ok_or_else(|| Error::Integrity("yt-dlp finished but wrote no input file".into()))?;
        let media = parse_page_metadata(&result.stdout);
        if media.is_none() {
            tracing::debug!(job_id = %ws.job_id(), "yt-dlp printed no usable metadata");
        }
        Ok((staged, media))
    }

    // -- Uploaded file ------------------------------------------------------

    async fn copy_upload(&self, path: &Path, ws: &Workspace) -> Result<PathBuf> {
        let upload_err = |msg: String| Error::conversion("upload", msg);

        let root = self.uploads_root.as_deref();
        let lexical = resolve_upload(path, root).map_err(|e| upload_err(e.to_string()))?;
        let Some(root) = root else {
            return Err(upload_err("uploads are disabled".into()));
        };

        let canonical_root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| upload_err(format!("uploads directory unavailable: {e}")))?;
        let canonical = tokio::fs::canonicalize(&lexical)
            .await
            .map_err(|e| upload_err(format!("cannot read {}: {e}", path.display())))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(upload_err(format!(
                "{} resolves outside the uploads directory",
                path.display()
            )));
        }

        let meta = tokio::fs::metadata(&canonical).await?;
        if !meta.is_file() {
            return Err(upload_err(format!("{} is not a regular file", path.display())));
        }
        self.check_size(meta.len())?;

        let ext = canonical
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_string);
        let dest = ws.file(&input_file_name(ext.as_deref()))?;
        tokio::fs::copy(&canonical, &dest).await?;
        Ok(dest)
    }

    // -- Validation ---------------------------------------------------------

    async fn validate_input(&self, path: &Path, checksum: Option<&str>) -> Result<()> {
        let len = tokio::fs::metadata(path).await?.len();
        if len == 0 {
            return Err(Error::Integrity("input is empty".into()));
        }
        self.check_size(len)?;

        if let Some(expected) = checksum {
            let actual = sha256_file(path).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(Error::Integrity(format!(
                    "input checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }
        Ok(())
    }

    fn check_size(&self, len: u64) -> Result<()> {
        if len > self.fetch.max_input_bytes {
            return Err(Error::conversion(
                "fetch",
                format!(
                    "input is {len} bytes, above the {} byte limit",
                    self.fetch.max_input_bytes
                ),
            ));
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Deserialize)]
struct PageMetadata {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
}

/// The last JSON object yt-dlp printed, as [`MediaInfo`].
fn parse_page_metadata(stdout: &str) -> Option<MediaInfo> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with('{'))?;
    let meta: PageMetadata = serde_json::from_str(line).ok()?;
    Some(MediaInfo {
        title: meta.title.filter(|t| !t.is_empty()),
        thumbnail: meta.thumbnail,
        duration_secs: meta.duration.and_then(whole_seconds),
        width: meta.width,
        height: meta.height,
        video_codec: None,
    })
}

/// `input.<ext>` for short alphanumeric extensions, plain `input` otherwise.
fn input_file_name(ext: Option<&str>) -> String {
    match ext {
        Some(ext)
            if (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!("{INPUT_STEM}.{}", ext.to_ascii_lowercase())
        }
        _ => INPUT_STEM.to_string(),
    }
}

fn url_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?.to_string();
    Path::new(&last)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_string)
}

/// The first non-empty `input` / `input.*` file in `dir`.
async fn find_staged_input(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name != INPUT_STEM && !name.starts_with(&format!("{INPUT_STEM}.")) {
            continue;
        }
        let meta = entry.metadata().await?;
        if meta.is_file() && meta.len() > 0 {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_av::{WorkspaceBudget, WorkspaceManager};
    use mf_core::{ErrorKind, JobId};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: WorkspaceManager,
        uploads: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let uploads = dir.path().join("uploads");
            std::fs::create_dir(&uploads).unwrap();
            let manager = WorkspaceManager::new(
                dir.path().join("temp"),
                WorkspaceBudget {
                    max_workspaces: 8,
                    min_free_bytes: 0,
                    min_free_inodes: 0,
                },
            )
            .unwrap();
            Self {
                _dir: dir,
                manager,
                uploads,
            }
        }

        fn acquirer(&self, fetch: FetchConfig) -> InputAcquirer {
            InputAcquirer::new(
                fetch,
                Some(self.uploads.clone()),
                Arc::new(ToolRegistry::default()),
                ProcessRunner::default(),
            )
            .unwrap()
        }

        fn workspace(&self) -> Workspace {
            self.manager.acquire(JobId::new()).unwrap()
        }
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn downloads_into_workspace() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/clip.MP4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fake video".to_vec()))
            .mount(&server)
            .await;

        let fx = Fixture::new();
        let ws = fx.workspace();
        let url = format!("{}/media/clip.MP4", server.uri());
        let staged = fx
            .acquirer(FetchConfig::default())
            .acquire(&InputSource::Url(url), &ws, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(staged.path, ws.path().join("input.mp4"));
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"fake video");
        assert_eq!(staged.media, None);
    }

    #[tokio::test]
    async fn http_error_is_conversion_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fx = Fixture::new();
        let ws = fx.workspace();
        let err = fx
            .acquirer(FetchConfig::default())
            .acquire(
                &InputSource::Url(format!("{}/missing.mp4", server.uri())),
                &ws,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn empty_body_is_integrity_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let fx = Fixture::new();
        let ws = fx.workspace();
        let err = fx
            .acquirer(FetchConfig::default())
            .acquire(
                &InputSource::Url(format!("{}/empty.mp4", server.uri())),
                &ws,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityError);
    }

    #[tokio::test]
    async fn checksum_is_enforced() {
        let body = b"some media bytes".to_vec();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let fx = Fixture::new();
        let acquirer = fx.acquirer(FetchConfig::default());
        let source = InputSource::Url(format!("{}/a.mkv", server.uri()));

        let good = sha256_hex(&body);
        let ws = fx.workspace();
        assert!(acquirer
            .acquire(&source, &ws, Some(&good), &CancellationToken::new())
            .await
            .is_ok());

        let ws = fx.workspace();
        let err = acquirer
            .acquire(&source, &ws, Some(&"0".repeat(64)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityError);
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn oversized_input_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 1024]))
            .mount(&server)
            .await;

        let fx = Fixture::new();
        let ws = fx.workspace();
        let fetch = FetchConfig {
            max_input_bytes: 100,
            ..FetchConfig::default()
        };
        let err = fx
            .acquirer(fetch)
            .acquire(
                &InputSource::Url(format!("{}/big.mp4", server.uri())),
                &ws,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
    }

    #[tokio::test]
    async fn download_honours_cancellation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let fx = Fixture::new();
        let ws = fx.workspace();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = fx
            .acquirer(FetchConfig::default())
            .acquire(&InputSource::Url(format!("{}/slow.mp4", server.uri())), &ws, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn copies_upload_from_uploads_root() {
        let fx = Fixture::new();
        std::fs::write(fx.uploads.join("clip.webm"), b"uploaded").unwrap();
        let ws = fx.workspace();

        let staged = fx
            .acquirer(FetchConfig::default())
            .acquire(
                &InputSource::Upload(PathBuf::from("clip.webm")),
                &ws,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(staged.path, ws.path().join("input.webm"));
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"uploaded");
        assert!(fx.uploads.join("clip.webm").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn upload_symlink_escape_is_rejected() {
        let fx = Fixture::new();
        let outside = fx._dir.path().join("secret.mp4");
        std::fs::write(&outside, b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, fx.uploads.join("link.mp4")).unwrap();
        let ws = fx.workspace();

        let err = fx
            .acquirer(FetchConfig::default())
            .acquire(
                &InputSource::Upload(PathBuf::from("link.mp4")),
                &ws,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
        assert!(!ws.path().join("input.mp4").exists());
    }

    #[tokio::test]
    async fn page_without_ytdlp_is_spawn_error() {
        let fx = Fixture::new();
        let ws = fx.workspace();
        let err = fx
            .acquirer(FetchConfig::default())
            .acquire(
                &InputSource::Page("https://example.com/watch?v=1".into()),
                &ws,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnError);
    }

    /// A yt-dlp stand-in that writes the `-o` target and prints metadata.
    #[cfg(unix)]
    fn fake_ytdlp(dir: &Path, printed: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("yt-dlp");
        let body = format!(
            r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
printf 'page media' > "$(echo "$out" | sed 's/%(ext)s/mp4/')"
echo '{printed}'
"#
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn page_extraction_reports_metadata() {
        let fx = Fixture::new();
        let ws = fx.workspace();
        let ytdlp = fake_ytdlp(
            fx._dir.path(),
            r#"{"title": "Launch Day", "thumbnail": "https://img.example/1.jpg", "duration": 3725.4, "width": 1280, "height": 720}"#,
        );
        let acquirer = InputAcquirer::new(
            FetchConfig::default(),
            None,
            Arc::new(ToolRegistry::from_paths([(YTDLP, ytdlp)])),
            ProcessRunner::default(),
        )
        .unwrap();

        let staged = acquirer
            .acquire(
                &InputSource::Page("https://example.com/watch?v=1".into()),
                &ws,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(staged.path, ws.path().join("input.mp4"));
        let media = staged.media.unwrap();
        assert_eq!(media.title.as_deref(), Some("Launch Day"));
        assert_eq!(media.thumbnail.as_deref(), Some("https://img.example/1.jpg"));
        assert_eq!(media.duration_secs, Some(3725));
        assert_eq!((media.width, media.height), (Some(1280), Some(720)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn page_without_metadata_still_stages_input() {
        let fx = Fixture::new();
        let ws = fx.workspace();
        let ytdlp = fake_ytdlp(fx._dir.path(), "[download] done");
        let acquirer = InputAcquirer::new(
            FetchConfig::default(),
            None,
            Arc::new(ToolRegistry::from_paths([(YTDLP, ytdlp)])),
            ProcessRunner::default(),
        )
        .unwrap();

        let staged = acquirer
            .acquire(
                &InputSource::Page("https://example.com/watch?v=2".into()),
                &ws,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(staged.path.exists());
        assert_eq!(staged.media, None);
    }

    #[test]
    fn page_metadata_takes_last_json_line() {
        let out = "[info] extracting\n{\"title\": \"old\"}\n{\"title\": \"\", \"duration\": null, \"width\": 640}\n";
        let media = parse_page_metadata(out).unwrap();
        assert_eq!(media.title, None);
        assert_eq!(media.duration_secs, None);
        assert_eq!(media.width, Some(640));

        assert_eq!(parse_page_metadata("no json here"), None);
        assert_eq!(parse_page_metadata("{truncated"), None);
    }

    #[test]
    fn input_names() {
        assert_eq!(input_file_name(Some("MP4")), "input.mp4");
        assert_eq!(input_file_name(Some("toolongext")), "input");
        assert_eq!(input_file_name(Some("a/b")), "input");
        assert_eq!(input_file_name(None), "input");
        assert_eq!(url_extension("https://x.test/a/b.mkv?x=1").as_deref(), Some("mkv"));
        assert_eq!(url_extension("https://x.test/watch"), None);
    }
}
