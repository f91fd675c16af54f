//! Per-identity workspaces and the custodian that scrubs them.
//!
//! Learner code runs as an identity and may leave traps behind: directories
//! with mode 000, sticky bits, deep trees, files in shared scratch space.
//! Cleanup resets permissions on each owned directory before descending into
//! it, removes bottom-up, and never touches an entry owned by anybody else.

use crate::config::WorkerConfig;
use crate::identity::WorkerIdentity;
use anyhow::{Context, Result, bail};
use nix::unistd::{chown, Uid};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

const WORKERS_DIR_MODE: u32 = 0o755;
const WORKSPACE_MODE: u32 = 0o1770;
const OWNED_DIR_RESET_MODE: u32 = 0o700;

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub removed: usize,
    /// Entries left alone because another account owns them.
    pub skipped: usize,
    pub failed: usize,
}

impl PurgeReport {
    pub fn merge(&mut self, other: PurgeReport) {
        self.removed += other.removed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Remove everything under `root` owned by `owner`. `root` itself is kept.
///
/// Never fails: missing paths are ignored and other errors are counted in
/// the report.
pub fn purge(root: &Path, owner: Uid) -> PurgeReport {
    let mut report = PurgeReport::default();
    match fs::symlink_metadata(root) {
        Ok(meta) if meta.is_dir() => {
            if meta.uid() == owner.as_raw() {
                let mode = (meta.permissions().mode() | 0o700) & 0o7777;
                if let Err(e) = fs::set_permissions(root, fs::Permissions::from_mode(mode)) {
                    debug!(path = %root.display(), error = %e, "Could not reset workspace root mode");
                }
            }
            purge_children(root, owner, &mut report);
        }
        Ok(_) => warn!(path = %root.display(), "Workspace root is not a directory"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %root.display(), error = %e, "Cannot inspect workspace root");
            report.failed += 1;
        }
    }
    report
}

/// Remove entries directly inside each scratch directory that are owned by
/// `owner`, together with their owned contents.
pub fn sweep_scratch(dirs: &[PathBuf], owner: Uid) -> PurgeReport {
    let mut report = PurgeReport::default();
    for dir in dirs {
        purge_children(dir, owner, &mut report);
    }
    report
}

fn purge_children(dir: &Path, owner: Uid, report: &mut PurgeReport) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Cannot list directory during cleanup");
            report.failed += 1;
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot inspect entry during cleanup");
                report.failed += 1;
                continue;
            }
        };
        if meta.uid() != owner.as_raw() {
            debug!(path = %path.display(), owner = meta.uid(), "Skipping entry owned by another account");
            report.skipped += 1;
            continue;
        }
        remove_owned(&path, &meta, owner, report);
    }
}

fn remove_owned(path: &Path, meta: &fs::Metadata, owner: Uid, report: &mut PurgeReport) {
    // symlink_metadata: a symlink is never a directory here, so links are
    // unlinked rather than followed.
    let result = if meta.is_dir() {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(OWNED_DIR_RESET_MODE)) {
            debug!(path = %path.display(), error = %e, "Could not reset directory mode");
        }
        purge_children(path, owner, report);
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => report.removed += 1,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        // Left non-empty by entries of another owner; already counted.
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove entry");
            report.failed += 1;
        }
    }
}

/// Creates, and scrubs, the workspace of each identity.
pub struct WorkspaceCustodian {
    workers_dir: PathBuf,
    scratch_dirs: Vec<PathBuf>,
    worker_exe: PathBuf,
}

impl WorkspaceCustodian {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let worker_exe = std::env::current_exe().context("Cannot locate the worker executable")?;
        Ok(Self {
            workers_dir: config.workers_dir(),
            scratch_dirs: config.scratch_dirs.clone(),
            worker_exe,
        })
    }

    pub fn with_paths(workers_dir: PathBuf, scratch_dirs: Vec<PathBuf>, worker_exe: PathBuf) -> Self {
        Self {
            workers_dir,
            scratch_dirs,
            worker_exe,
        }
    }

    /// Create a clean workspace for `identity` and return its path.
    pub async fn prepare(&self, identity: &WorkerIdentity) -> Result<PathBuf> {
        let root = identity.root.clone();
        if !root.starts_with(&self.workers_dir) {
            bail!(
                "Workspace {} is outside of {}",
                root.display(),
                self.workers_dir.display()
            );
        }

        fs::create_dir_all(&root)
            .with_context(|| format!("No workspace directory for user: {}", identity.name))?;
        if let Err(e) = fs::set_permissions(&self.workers_dir, fs::Permissions::from_mode(WORKERS_DIR_MODE)) {
            debug!(path = %self.workers_dir.display(), error = %e, "Could not set workers dir mode");
        }
        if !identity.is_current_user() {
            chown(&root, None, Some(identity.gid))
                .with_context(|| format!("Failed to give {} group access to {}", identity.name, root.display()))?;
        }
        fs::set_permissions(&root, fs::Permissions::from_mode(WORKSPACE_MODE))
            .with_context(|| format!("Failed to set mode on {}", root.display()))?;

        self.purge(identity).await?;
        Ok(root)
    }

    /// Empty the identity's workspace and sweep its files from scratch space.
    ///
    /// The identity's entries are removed with the identity's own privileges.
    /// Files the worker materialised into the workspace are then removed by
    /// the worker account, which owns them.
    pub async fn purge(&self, identity: &WorkerIdentity) -> Result<PurgeReport> {
        let mut report = if identity.is_current_user() {
            let root = identity.root.clone();
            let scratch = self.scratch_dirs.clone();
            let owner = identity.uid;
            tokio::task::spawn_blocking(move || {
                let mut report = purge(&root, owner);
                report.merge(sweep_scratch(&scratch, owner));
                report
            })
            .await
            .context("Cleanup task panicked")?
        } else {
            self.purge_as(identity).await?
        };

        if !identity.is_current_user() {
            let root = identity.root.clone();
            let own = tokio::task::spawn_blocking(move || purge(&root, Uid::current()))
                .await
                .context("Cleanup task panicked")?;
            report.removed += own.removed;
            report.failed += own.failed;
        }

        info!(
            identity = %identity.name,
            removed = report.removed,
            skipped = report.skipped,
            failed = report.failed,
            "Workspace purged"
        );
        Ok(report)
    }

    async fn purge_as(&self, identity: &WorkerIdentity) -> Result<PurgeReport> {
        let prefix = identity.command_prefix();
        let mut cmd = Command::new(&prefix[0]);
        cmd.args(&prefix[1..])
            .arg(&self.worker_exe)
            .arg("purge")
            .arg("--root")
            .arg(&identity.root);
        for dir in &self.scratch_dirs {
            cmd.arg("--scratch").arg(dir);
        }

        let output = cmd
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run cleanup as {}", identity.name))?;
        if !output.status.success() {
            bail!(
                "Cleanup as {} exited with {}: {}",
                identity.name,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        serde_json::from_slice(&output.stdout).context("Cleanup produced an unreadable report")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn me() -> Uid {
        Uid::current()
    }

    fn someone_else() -> Uid {
        Uid::from_raw(Uid::current().as_raw() + 1)
    }

    #[test]
    fn test_other_identity_files_are_untouched() {
        let workers = tempfile::tempdir().unwrap();
        let folder = workers.path().join("B").join("folder");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("test.txt"), "created by A").unwrap();

        let report = purge(&workers.path().join("B"), someone_else());

        assert!(folder.join("test.txt").exists());
        assert_eq!(report.removed, 0);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_zero_permission_and_sticky_directories_are_removed() {
        let root = tempfile::tempdir().unwrap();
        let sticky = root.path().join("test_sticky");
        let pycache = root.path().join("__pycache__");
        fs::create_dir(&sticky).unwrap();
        fs::create_dir(&pycache).unwrap();
        fs::write(sticky.join("inner.txt"), "x").unwrap();
        fs::create_dir(sticky.join("nested")).unwrap();
        fs::set_permissions(sticky.join("nested"), fs::Permissions::from_mode(0o000)).unwrap();
        fs::set_permissions(&sticky, fs::Permissions::from_mode(0o1000)).unwrap();
        fs::set_permissions(&pycache, fs::Permissions::from_mode(0o000)).unwrap();

        let report = purge(root.path(), me());

        assert!(!sticky.exists());
        assert!(!pycache.exists());
        assert!(root.path().exists());
        assert_eq!(report.failed, 0);
        assert_eq!(report.removed, 4);
    }

    #[test]
    fn test_hidden_files_are_removed() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join(".hidden"), "x").unwrap();
        fs::write(root.path().join("visible"), "x").unwrap();

        purge(root.path(), me());

        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_symlinks_are_not_followed() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("keep.txt"), "x").unwrap();
        symlink(outside.path(), root.path().join("link")).unwrap();

        purge(root.path(), me());

        assert!(!root.path().join("link").exists());
        assert!(outside.path().join("keep.txt").exists());
    }

    #[test]
    fn test_missing_root_is_tolerated() {
        let report = purge(Path::new("/nonexistent/autotest/workspace"), me());
        assert_eq!(report, PurgeReport::default());
    }

    #[test]
    fn test_scratch_sweep_removes_owned_entries_only() {
        let scratch = tempfile::tempdir().unwrap();
        fs::write(scratch.path().join("test.txt"), "x").unwrap();
        fs::create_dir(scratch.path().join("folder")).unwrap();
        fs::write(scratch.path().join("folder").join("test.txt"), "x").unwrap();

        let untouched = sweep_scratch(&[scratch.path().to_path_buf()], someone_else());
        assert_eq!(untouched.removed, 0);
        assert!(scratch.path().join("folder").exists());

        let report = sweep_scratch(&[scratch.path().to_path_buf()], me());
        assert!(!scratch.path().join("test.txt").exists());
        assert!(!scratch.path().join("folder").exists());
        assert!(scratch.path().exists());
        assert_eq!(report.removed, 3);
    }

    #[tokio::test]
    async fn test_prepare_creates_clean_workspace() {
        let workspace = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let workers_dir = workspace.path().join("workers");
        let identity = WorkerIdentity::new(
            "me",
            Uid::current(),
            nix::unistd::Gid::current(),
            workers_dir.join("me"),
        );
        fs::create_dir_all(&identity.root).unwrap();
        fs::write(identity.root.join("leftover.py"), "x").unwrap();

        let custodian = WorkspaceCustodian::with_paths(
            workers_dir.clone(),
            vec![scratch.path().to_path_buf()],
            PathBuf::from("/bin/false"),
        );
        let root = custodian.prepare(&identity).await.unwrap();

        assert_eq!(root, identity.root);
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
        let mode = fs::metadata(&root).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, WORKSPACE_MODE);
    }

    #[tokio::test]
    async fn test_prepare_rejects_workspace_outside_workers_dir() {
        let workspace = tempfile::tempdir().unwrap();
        let identity = WorkerIdentity::new(
            "me",
            Uid::current(),
            nix::unistd::Gid::current(),
            PathBuf::from("/etc"),
        );
        let custodian = WorkspaceCustodian::with_paths(
            workspace.path().join("workers"),
            Vec::new(),
            PathBuf::from("/bin/false"),
        );

        assert!(custodian.prepare(&identity).await.is_err());
    }
}
