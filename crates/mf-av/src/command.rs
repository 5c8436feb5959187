//! Process runner for external tools.
//!
//! A [`ProcessInvocation`] describes what to run. [`ProcessRunner::run`]
//! spawns it from an argument vector (never a shell string) in a fresh
//! process group and makes sure that, whatever the outcome, no member of
//! that group outlives the call.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mf_core::{Error, Result};

/// Default time budget: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of bytes retained per output stream.
const DEFAULT_CAPTURE_LIMIT: usize = 64 * 1024;

/// Default time between SIGTERM and SIGKILL on cancellation.
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the output pipes to reach EOF once the process
/// group has been dealt with.
const DRAIN_WAIT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// ProcessInvocation
// ---------------------------------------------------------------------------

/// A single external program execution request.
///
/// # Example
///
/// ```no_run
/// use mf_av::{ProcessInvocation, ProcessRunner};
/// use tokio_util::sync::CancellationToken;
/// use std::time::Duration;
///
/// # async fn example() -> mf_core::Result<()> {
/// let mut inv = ProcessInvocation::new("ffprobe");
/// inv.args(["-v", "quiet", "-print_format", "json", "-show_format"])
///     .arg("/path/to/video.mkv")
///     .timeout(Duration::from_secs(30));
///
/// let result = ProcessRunner::default()
///     .run(&inv, &CancellationToken::new())
///     .await?;
/// println!("{}", result.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProcessInvocation {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
    capture_limit: usize,
}

impl ProcessInvocation {
    /// Create a new invocation of the given program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Run the program from this directory.
    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Set how many trailing bytes of each output stream are retained.
    pub fn capture_limit(&mut self, bytes: usize) -> &mut Self {
        self.capture_limit = bytes;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn time_budget(&self) -> Duration {
        self.timeout
    }

    /// Short name used in logs and errors (the program's file name).
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

impl fmt::Display for ProcessInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProcessResult
// ---------------------------------------------------------------------------

/// Outcome of a process that ran to completion.
///
/// A non-zero exit code is data, not an error; callers decide what it means.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Exit code, `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Retained tail of standard output (lossy UTF-8).
    pub stdout: String,
    /// Retained tail of standard error (lossy UTF-8).
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed: Duration,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The last `max_lines` non-empty lines of stderr.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self
            .stderr
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }

    /// Human-readable description of how the process ended.
    pub fn describe_exit(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit status {code}"),
            (None, Some(sig)) => format!("terminated by signal {sig}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Spawns invocations and supervises them until they are fully gone.
///
/// The runner holds no per-call state; clones can be used from any number
/// of tasks at once.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    cancel_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_CANCEL_GRACE)
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    /// Create a runner that waits `cancel_grace` between SIGTERM and SIGKILL
    /// when a run is cancelled.
    pub fn new(cancel_grace: Duration) -> Self {
        Self { cancel_grace }
    }

    /// Run `inv` to completion.
    ///
    /// # Errors
    ///
    /// - [`Error::Spawn`] if the program is missing or not executable.
    /// - [`Error::Timeout`] if the time budget ran out. The whole process
    ///   group has been killed and the child reaped.
    /// - [`Error::Cancelled`] if `cancel` fired. The group received SIGTERM
    ///   and, after the grace period, SIGKILL.
    pub async fn run(
        &self,
        inv: &ProcessInvocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult> {
        let tool = inv.tool_name();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = inv.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::spawn(&tool, e.to_string()))?;

        let mut guard = ProcessGroupGuard::new(child.id());
        tracing::debug!(tool = %tool, pid = ?child.id(), "spawned: {inv}");

        let stdout = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain_tail(s, inv.capture_limit)));
        let stderr = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain_tail(s, inv.capture_limit)));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(inv.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = match status {
                    Ok(status) => status,
                    Err(e) => {
                        // The armed guard kills the group on return.
                        abort(stdout);
                        abort(stderr);
                        return Err(Error::Internal(format!(
                            "{tool}: lost track of child process: {e}"
                        )));
                    }
                };
                // Anything the tool left running in its group.
                guard.signal(GroupSignal::Kill);
                guard.disarm();

                let (stdout, stdout_truncated) = collect(stdout).await;
                let (stderr, stderr_truncated) = collect(stderr).await;
                let result = ProcessResult {
                    exit_code: status.code(),
                    signal: exit_signal(&status),
                    stdout,
                    stderr,
                    stdout_truncated,
                    stderr_truncated,
                    elapsed: started.elapsed(),
                };
                tracing::debug!(
                    tool = %tool,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "process finished: {}",
                    result.describe_exit()
                );
                Ok(result)
            }
            Outcome::TimedOut => {
                tracing::warn!(
                    tool = %tool,
                    timeout = ?inv.timeout,
                    "process exceeded its time budget; killing process group"
                );
                guard.signal(GroupSignal::Kill);
                let _ = child.start_kill();
                let _ = child.wait().await;
                guard.disarm();
                abort(stdout);
                abort(stderr);
                Err(Error::timeout(tool, inv.timeout))
            }
            Outcome::Cancelled => {
                tracing::info!(tool = %tool, "cancellation requested; sending SIGTERM");
                guard.signal(GroupSignal::Terminate);
                if tokio::time::timeout(self.cancel_grace, child.wait())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        tool = %tool,
                        grace = ?self.cancel_grace,
                        "process ignored SIGTERM; sending SIGKILL"
                    );
                    guard.signal(GroupSignal::Kill);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                // Group members that ignored SIGTERM while the leader exited.
                guard.signal(GroupSignal::Kill);
                guard.disarm();
                abort(stdout);
                abort(stderr);
                Err(Error::Cancelled)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Output draining
// ---------------------------------------------------------------------------

/// Read `reader` to EOF, keeping only the last `limit` bytes.
async fn drain_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut tail = Vec::new();
    let mut truncated = false;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                    truncated = true;
                }
            }
        }
    }
    (tail, truncated)
}

async fn collect(handle: Option<JoinHandle<(Vec<u8>, bool)>>) -> (String, bool) {
    let Some(mut handle) = handle else {
        return (String::new(), false);
    };
    match tokio::time::timeout(DRAIN_WAIT, &mut handle).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Err(_)) => (String::new(), false),
        Err(_) => {
            // A descendant outside the group still holds the pipe.
            handle.abort();
            (String::new(), true)
        }
    }
}

fn abort(handle: Option<JoinHandle<(Vec<u8>, bool)>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Process group handling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Kills the child's process group on drop unless disarmed.
///
/// This covers the case where the `run` future itself is dropped while the
/// process is still running.
struct ProcessGroupGuard {
    pgid: Option<i32>,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
            armed: true,
        }
    }

    fn signal(&self, sig: GroupSignal) {
        if let Some(pgid) = self.pgid {
            signal_group(pgid, sig);
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.signal(GroupSignal::Kill);
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: i32, sig: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match sig {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    // ESRCH means the group is already gone.
    if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
        if e != nix::errno::Errno::ESRCH {
            tracing::warn!(pgid, "killpg({signal}) failed: {e}");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _sig: GroupSignal) {}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
