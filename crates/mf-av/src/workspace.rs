//! Per-job workspace management.
//!
//! A [`Workspace`] is a uniquely named directory (`job-<id>`) under the temp
//! root, owned by exactly one job. The [`WorkspaceManager`] creates it when
//! the job starts, enforces the space and inode budgets, and removes it
//! again when the job reaches a terminal state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use mf_core::config::WorkspaceConfig;
use mf_core::paths::validate_component;
use mf_core::{Error, JobId, Result};

/// Prefix of every workspace directory name.
const WORKSPACE_PREFIX: &str = "job-";

/// Attempts made to remove a workspace before giving up.
const RELEASE_ATTEMPTS: usize = 3;

/// Pause between removal attempts.
const RELEASE_BACKOFF: Duration = Duration::from_millis(75);

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Limits checked before a workspace is created.
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceBudget {
    /// Maximum number of live workspaces.
    pub max_workspaces: usize,
    /// Free bytes that must remain on the temp filesystem.
    pub min_free_bytes: u64,
    /// Free inodes that must remain on the temp filesystem.
    pub min_free_inodes: u64,
}

impl From<&WorkspaceConfig> for WorkspaceBudget {
    fn from(cfg: &WorkspaceConfig) -> Self {
        Self {
            max_workspaces: cfg.max_workspaces,
            min_free_bytes: cfg.min_free_bytes,
            min_free_inodes: cfg.min_free_inodes,
        }
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// A job's private scratch directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    job_id: JobId,
    path: PathBuf,
}

impl Workspace {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file directly inside the workspace.
    ///
    /// `name` must be a single safe path component.
    pub fn file(&self, name: &str) -> Result<PathBuf> {
        Ok(self.path.join(validate_component(name)?))
    }
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Owns the temp root and every workspace under it.
pub struct WorkspaceManager {
    root: PathBuf,
    budget: WorkspaceBudget,
    active: Mutex<HashMap<JobId, PathBuf>>,
}

impl WorkspaceManager {
    /// Create a manager for `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>, budget: WorkspaceBudget) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            budget,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of workspaces currently held.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// The directory a job's workspace lives in, whether or not it exists.
    pub fn path_for(&self, job_id: JobId) -> Result<PathBuf> {
        let name = format!("{WORKSPACE_PREFIX}{job_id}");
        let path = self.root.join(validate_component(&name)?);
        if path.parent() != Some(self.root.as_path()) {
            return Err(Error::Internal(format!(
                "workspace path escapes temp root: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Create the workspace for `job_id`.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] if the job already holds a workspace, the
    /// live workspace budget is used up, or the temp filesystem is below its
    /// free space or free inode floor. Failing to stat the temp filesystem or
    /// to create the directory is reported the same way.
    pub fn acquire(&self, job_id: JobId) -> Result<Workspace> {
        let path = self.path_for(job_id)?;
        let mut active = self.active.lock();

        if active.contains_key(&job_id) {
            return Err(Error::ResourceExhausted(format!(
                "job {job_id} already holds a workspace"
            )));
        }
        if active.len() >= self.budget.max_workspaces {
            return Err(Error::ResourceExhausted(format!(
                "workspace limit reached ({} live)",
                active.len()
            )));
        }
        self.check_filesystem()?;

        // create_dir, not create_dir_all: a leftover directory is a collision.
        std::fs::create_dir(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::ResourceExhausted(format!(
                    "workspace directory already exists: {}",
                    path.display()
                ))
            } else {
                Error::ResourceExhausted(format!(
                    "cannot create workspace {}: {e}",
                    path.display()
                ))
            }
        })?;
        active.insert(job_id, path.clone());

        tracing::debug!(job_id = %job_id, path = %path.display(), "workspace acquired");
        Ok(Workspace { job_id, path })
    }

    /// Like [`acquire`](Self::acquire), but returns a lease that releases
    /// the workspace when dropped.
    pub fn lease(self: &Arc<Self>, job_id: JobId) -> Result<WorkspaceLease> {
        let workspace = self.acquire(job_id)?;
        Ok(WorkspaceLease {
            manager: Arc::clone(self),
            workspace,
            armed: true,
        })
    }

    /// Recursively remove the workspace of `job_id`.
    ///
    /// Idempotent: releasing a workspace that was already released, or never
    /// created, does nothing. Removal is retried a few times; a persistent
    /// failure is logged and the directory is left for the next orphan sweep.
    ///
    /// Blocks while the tree is deleted; async callers should go through
    /// [`WorkspaceLease::release_async`].
    pub fn release(&self, job_id: JobId) {
        let path = match self.active.lock().remove(&job_id) {
            Some(path) => path,
            None => match self.path_for(job_id) {
                Ok(path) => path,
                Err(_) => return,
            },
        };
        remove_with_retries(&path);
    }

    /// Remove `job-*` directories that no live job owns.
    ///
    /// Meant to run at startup, before any job is admitted, to clean up after
    /// a previous process that died mid-job.
    pub fn sweep_orphans(&self) -> Result<usize> {
        let active: Vec<PathBuf> = self.active.lock().values().cloned().collect();
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(WORKSPACE_PREFIX) || !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            if active.contains(&path) {
                continue;
            }
            if remove_with_retries(&path) {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("Removed {removed} orphaned workspace(s) from {}", self.root.display());
        }
        Ok(removed)
    }

    fn check_filesystem(&self) -> Result<()> {
        let Some(space) = free_space(&self.root)? else {
            return Ok(());
        };
        if space.bytes < self.budget.min_free_bytes {
            return Err(Error::ResourceExhausted(format!(
                "only {} bytes free under {} (need {})",
                space.bytes,
                self.root.display(),
                self.budget.min_free_bytes
            )));
        }
        if let Some(inodes) = space.inodes {
            if inodes < self.budget.min_free_inodes {
                return Err(Error::ResourceExhausted(format!(
                    "only {inodes} inodes free under {} (need {})",
                    self.root.display(),
                    self.budget.min_free_inodes
                )));
            }
        }
        Ok(())
    }
}

/// Returns `true` if the directory is gone afterwards.
fn remove_with_retries(path: &Path) -> bool {
    let mut last_err = None;
    for attempt in 0..RELEASE_ATTEMPTS {
        if attempt > 0 {
            std::thread::sleep(RELEASE_BACKOFF);
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "workspace released");
                return true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) => last_err = Some(e),
        }
    }
    if let Some(e) = last_err {
        tracing::warn!(path = %path.display(), "failed to remove workspace: {e}");
    }
    false
}

// ---------------------------------------------------------------------------
// WorkspaceLease
// ---------------------------------------------------------------------------

/// A held workspace that is released exactly once: explicitly through
/// [`release`](Self::release), or on drop.
pub struct WorkspaceLease {
    manager: Arc<WorkspaceManager>,
    workspace: Workspace,
    armed: bool,
}

impl WorkspaceLease {
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn release(mut self) {
        self.armed = false;
        self.manager.release(self.workspace.job_id);
    }

    /// Release on the blocking pool so a large tree does not stall the
    /// calling runtime worker.
    pub async fn release_async(mut self) {
        self.armed = false;
        let manager = Arc::clone(&self.manager);
        let job_id = self.workspace.job_id;
        if let Err(e) = tokio::task::spawn_blocking(move || manager.release(job_id)).await {
            tracing::warn!(job_id = %job_id, "workspace release task failed: {e}");
        }
    }
}

impl std::ops::Deref for WorkspaceLease {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        &self.workspace
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        if self.armed {
            self.manager.release(self.workspace.job_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Filesystem statistics
// ---------------------------------------------------------------------------

struct FreeSpace {
    bytes: u64,
    /// `None` on filesystems that do not report inode counts.
    inodes: Option<u64>,
}

#[cfg(unix)]
fn free_space(path: &Path) -> Result<Option<FreeSpace>> {
    use nix::sys::statvfs::statvfs;

    let stat = statvfs(path).map_err(|e| {
        Error::ResourceExhausted(format!("cannot stat temp root {}: {e}", path.display()))
    })?;
    let bytes = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
    let inodes = if stat.files() as u64 == 0 {
        None
    } else {
        Some(stat.files_available() as u64)
    };
    Ok(Some(FreeSpace { bytes, inodes }))
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> Result<Option<FreeSpace>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> WorkspaceBudget {
        WorkspaceBudget {
            max_workspaces: 4,
            min_free_bytes: 0,
            min_free_inodes: 0,
        }
    }

    fn manager(root: &Path) -> Arc<WorkspaceManager> {
        Arc::new(WorkspaceManager::new(root.join("temp"), budget()).unwrap())
    }

    #[test]
    fn acquire_creates_named_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let job_id = JobId::new();

        let ws = mgr.acquire(job_id).unwrap();
        assert!(ws.path().is_dir());
        assert_eq!(ws.path().parent(), Some(mgr.root()));
        assert_eq!(
            ws.path().file_name().unwrap().to_str().unwrap(),
            format!("job-{job_id}")
        );
        assert_eq!(mgr.active_count(), 1);
    }

    #[test]
    fn second_acquire_for_same_job_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let job_id = JobId::new();

        mgr.acquire(job_id).unwrap();
        let err = mgr.acquire(job_id).unwrap_err();
        assert_eq!(err.kind(), mf_core::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn workspace_budget_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        for _ in 0..4 {
            mgr.acquire(JobId::new()).unwrap();
        }
        let err = mgr.acquire(JobId::new()).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn free_space_floor_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(
            dir.path().join("temp"),
            WorkspaceBudget {
                min_free_bytes: u64::MAX,
                ..budget()
            },
        )
        .unwrap();
        let err = mgr.acquire(JobId::new()).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn missing_temp_root_is_resource_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        std::fs::remove_dir_all(mgr.root()).unwrap();

        let err = mgr.acquire(JobId::new()).unwrap_err();
        assert_eq!(err.kind(), mf_core::ErrorKind::ResourceExhausted);
        assert_eq!(mgr.active_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_temp_root_is_resource_exhausted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        std::fs::set_permissions(mgr.root(), std::fs::Permissions::from_mode(0o500)).unwrap();

        let result = mgr.acquire(JobId::new());
        std::fs::set_permissions(mgr.root(), std::fs::Permissions::from_mode(0o700)).unwrap();
        // root ignores directory permissions
        if let Err(err) = result {
            assert_eq!(err.kind(), mf_core::ErrorKind::ResourceExhausted);
        }
    }

    #[test]
    fn release_removes_contents_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let job_id = JobId::new();

        let ws = mgr.acquire(job_id).unwrap();
        std::fs::create_dir(ws.path().join("nested")).unwrap();
        std::fs::write(ws.file("input.mp4").unwrap(), b"data").unwrap();

        mgr.release(job_id);
        assert!(!ws.path().exists());
        assert_eq!(mgr.active_count(), 0);

        mgr.release(job_id);
        mgr.release(JobId::new());
    }

    #[test]
    fn released_job_can_acquire_again() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let job_id = JobId::new();
        mgr.acquire(job_id).unwrap();
        mgr.release(job_id);
        assert!(mgr.acquire(job_id).is_ok());
    }

    #[test]
    fn file_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let ws = mgr.acquire(JobId::new()).unwrap();
        assert!(ws.file("../escape").is_err());
        assert!(ws.file("a/b").is_err());
        assert!(ws.file("output.mkv").unwrap().starts_with(ws.path()));
    }

    #[test]
    fn lease_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let path = {
            let lease = mgr.lease(JobId::new()).unwrap();
            lease.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn explicit_lease_release() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let lease = mgr.lease(JobId::new()).unwrap();
        let path = lease.path().to_path_buf();
        lease.release();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn async_lease_release_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let lease = mgr.lease(JobId::new()).unwrap();
        let path = lease.path().to_path_buf();
        std::fs::create_dir(path.join("frames")).unwrap();
        std::fs::write(path.join("frames").join("0001.bin"), b"x").unwrap();

        lease.release_async().await;
        assert!(!path.exists());
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn removal_of_missing_directory_succeeds_without_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        assert!(remove_with_retries(&dir.path().join("gone")));
        assert!(started.elapsed() < RELEASE_BACKOFF);
    }

    #[cfg(unix)]
    #[test]
    fn persistent_removal_failure_backs_off_between_attempts() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("locked");
        let target = parent.join("job-x");
        std::fs::create_dir_all(target.join("inner")).unwrap();
        std::fs::write(target.join("inner").join("f"), b"x").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o500)).unwrap();

        let started = std::time::Instant::now();
        let removed = remove_with_retries(&target);
        let elapsed = started.elapsed();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o700)).unwrap();

        // root ignores directory permissions
        if !removed {
            assert!(elapsed >= RELEASE_BACKOFF * (RELEASE_ATTEMPTS as u32 - 1));
        }
    }

    #[test]
    fn sweep_removes_only_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        let live = mgr.acquire(JobId::new()).unwrap();
        let orphan = mgr.root().join(format!("job-{}", JobId::new()));
        std::fs::create_dir(&orphan).unwrap();
        std::fs::write(orphan.join("partial.mkv"), b"x").unwrap();
        let unrelated = mgr.root().join("keep-me");
        std::fs::create_dir(&unrelated).unwrap();

        assert_eq!(mgr.sweep_orphans().unwrap(), 1);
        assert!(!orphan.exists());
        assert!(live.path().exists());
        assert!(unrelated.exists());
    }
}
