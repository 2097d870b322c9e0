//! Maintenance lock handling and holder metadata.
//!
//! The lock is an advisory marker file inside the object store root. It is
//! the only thing preventing two maintenance runs, possibly in different
//! processes (an interactive session and a background scheduler), from
//! repacking concurrently and racing on pack deletion.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::paths;
use crate::{Effect, Transience};

/// Identity of a lock holder, persisted as JSON inside the marker file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub holder_id: Uuid,
    pub pid: u32,
    pub started_at_ms: u64,
    pub version: String,
}

impl LockHolder {
    fn new(started_at_ms: u64) -> Self {
        Self {
            holder_id: Uuid::new_v4(),
            pid: std::process::id(),
            started_at_ms,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Decides whether a marker's recorded owner is still running.
///
/// Injectable so stale-marker recovery is testable without a process table.
pub trait Liveness: Send + Sync {
    fn is_alive(&self, holder: &LockHolder) -> bool;
}

/// Process-table probe.
///
/// Only proves death on Linux (`/proc/<pid>`); elsewhere it reports alive,
/// so a marker is never deleted unless the owner is known dead.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessLiveness;

impl Liveness for ProcessLiveness {
    fn is_alive(&self, holder: &LockHolder) -> bool {
        if holder.pid == std::process::id() {
            return true;
        }
        #[cfg(target_os = "linux")]
        {
            Path::new("/proc").join(holder.pid.to_string()).exists()
        }
        #[cfg(not(target_os = "linux"))]
        {
            true
        }
    }
}

/// Held maintenance lock. The marker is removed on every exit path: via
/// `release` for error surfacing, via `Drop` otherwise.
#[derive(Debug)]
pub struct MaintenanceLock {
    path: PathBuf,
    holder: LockHolder,
    released: bool,
}

impl MaintenanceLock {
    /// Attempt to acquire the maintenance lock for an object store.
    ///
    /// Creates the marker exclusively. If a marker already exists, its
    /// recorded owner is checked against `liveness`: a dead owner's marker
    /// is removed and creation retried exactly once; a live owner yields
    /// `LockError::Held`. Metadata that cannot be parsed is treated as a
    /// crashed acquisition (a live holder always has fully written
    /// metadata, synced before `try_acquire` returns).
    pub fn try_acquire(
        objects_root: &Path,
        liveness: &dyn Liveness,
    ) -> Result<Self, LockError> {
        ensure_dir(objects_root)?;
        let path = paths::maintenance_lock_path(objects_root);
        reject_symlink(&path)?;

        let holder = LockHolder::new(now_ms());

        let mut file = match open_new_lock_file(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                match Self::recover_stale(&path, liveness)? {
                    Some(file) => file,
                    None => {
                        let (existing, holder_error) = match read_holder(&path) {
                            Ok(holder) => (Some(holder), None),
                            Err(err) => (None, Some(err.to_string())),
                        };
                        return Err(LockError::Held {
                            path: Box::new(path),
                            holder: existing.map(Box::new),
                            holder_error,
                        });
                    }
                }
            }
            Err(err) => return Err(LockError::Io(err)),
        };

        write_holder(&mut file, &path, &holder)?;
        set_file_permissions(&path, 0o600)?;

        Ok(Self {
            path,
            holder,
            released: false,
        })
    }

    /// If the existing marker belongs to a dead owner, remove it and retry
    /// creation once. Returns the freshly created file, or `None` when the
    /// owner is live (or a racing acquirer won the retry).
    fn recover_stale(
        path: &Path,
        liveness: &dyn Liveness,
    ) -> Result<Option<fs::File>, LockError> {
        let stale = match read_holder(path) {
            Ok(holder) => {
                if liveness.is_alive(&holder) {
                    return Ok(None);
                }
                Some(holder)
            }
            // Unreadable metadata means a crash mid-acquire; no live owner
            // exists to protect.
            Err(LockError::HolderCorrupt { .. }) => None,
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        tracing::info!(
            path = %path.display(),
            stale_pid = stale.as_ref().map(|h| h.pid),
            "removing stale maintenance lock"
        );
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(LockError::Io(err)),
        }

        match open_new_lock_file(path) {
            Ok(file) => Ok(Some(file)),
            // Someone else re-created it between our delete and retry.
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(LockError::Io(err)),
        }
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker, surfacing removal errors. `Drop` covers every
    /// other exit path.
    pub fn release(mut self) -> Result<(), LockError> {
        if !self.released {
            fs::remove_file(&self.path)?;
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for MaintenanceLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Read the current lock holder, if any. Used by `pm status`.
pub fn read_lock_holder(objects_root: &Path) -> Result<Option<LockHolder>, LockError> {
    let path = paths::maintenance_lock_path(objects_root);
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(LockError::Symlink { path }),
        Ok(_) => Ok(Some(read_holder(&path)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LockError::Io(err)),
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("maintenance lock already held at {path:?}")]
    Held {
        path: Box<PathBuf>,
        holder: Option<Box<LockHolder>>,
        holder_error: Option<String>,
    },
    #[error("maintenance lock path is a symlink: {path:?}")]
    Symlink { path: PathBuf },
    #[error("lock metadata corrupted at {path:?}: {source}")]
    HolderCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl LockError {
    fn is_not_found(&self) -> bool {
        matches!(self, LockError::Io(err) if err.kind() == io::ErrorKind::NotFound)
    }

    pub fn transience(&self) -> Transience {
        match self {
            // The holder will finish; the next cadence tick may succeed.
            LockError::Held { .. } => Transience::Retryable,
            LockError::Symlink { .. } => Transience::Permanent,
            LockError::HolderCorrupt { .. } => Transience::Retryable,
            LockError::Io(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            LockError::Held { .. } | LockError::Symlink { .. } => Effect::None,
            LockError::HolderCorrupt { .. } => Effect::None,
            LockError::Io(_) => Effect::Unknown,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn ensure_dir(path: &Path) -> Result<(), LockError> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_symlink() {
                return Err(LockError::Symlink {
                    path: path.to_path_buf(),
                });
            }
            if !meta.is_dir() {
                return Err(LockError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("expected directory at {:?}", path),
                )));
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path)?;
        }
        Err(err) => return Err(LockError::Io(err)),
    }
    Ok(())
}

fn reject_symlink(path: &Path) -> Result<(), LockError> {
    if let Ok(meta) = fs::symlink_metadata(path)
        && meta.file_type().is_symlink()
    {
        return Err(LockError::Symlink {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn read_holder(path: &Path) -> Result<LockHolder, LockError> {
    reject_symlink(path)?;
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| LockError::HolderCorrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_holder(
    file: &mut fs::File,
    path: &Path,
    holder: &LockHolder,
) -> Result<(), LockError> {
    serde_json::to_writer(&mut *file, holder).map_err(|source| LockError::HolderCorrupt {
        path: path.to_path_buf(),
        source,
    })?;
    file.sync_all()?;
    Ok(())
}

fn open_new_lock_file(path: &Path) -> io::Result<fs::File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true).mode(0o600);
        options.open(path)
    }
    #[cfg(not(unix))]
    {
        fs::OpenOptions::new().write(true).create_new(true).open(path)
    }
}

fn set_file_permissions(path: &Path, mode: u32) -> Result<(), LockError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perm = fs::Permissions::from_mode(mode);
        fs::set_permissions(path, perm)?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AssumeAlive;
    impl Liveness for AssumeAlive {
        fn is_alive(&self, _holder: &LockHolder) -> bool {
            true
        }
    }

    struct AssumeDead;
    impl Liveness for AssumeDead {
        fn is_alive(&self, _holder: &LockHolder) -> bool {
            false
        }
    }

    fn temp_store() -> tempfile::TempDir {
        tempfile::TempDir::new().expect("tempdir")
    }

    #[test]
    fn acquire_writes_marker_and_release_removes_it() {
        let store = temp_store();
        let lock = MaintenanceLock::try_acquire(store.path(), &ProcessLiveness)
            .expect("acquire");
        let path = lock.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(lock.holder().pid, std::process::id());

        lock.release().expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_reports_held_with_holder() {
        let store = temp_store();
        let _lock = MaintenanceLock::try_acquire(store.path(), &AssumeAlive).expect("acquire");

        let err = MaintenanceLock::try_acquire(store.path(), &AssumeAlive)
            .expect_err("should be held");
        match err {
            LockError::Held { holder, .. } => {
                assert_eq!(holder.expect("holder meta").pid, std::process::id());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stale_marker_is_recovered() {
        let store = temp_store();
        {
            let lock =
                MaintenanceLock::try_acquire(store.path(), &AssumeAlive).expect("acquire");
            // Simulate a crash: forget the guard so the marker stays behind.
            std::mem::forget(lock);
        }
        assert!(paths::maintenance_lock_path(store.path()).exists());

        let lock = MaintenanceLock::try_acquire(store.path(), &AssumeDead)
            .expect("stale marker should be recovered");
        lock.release().expect("release");
    }

    #[test]
    fn corrupt_marker_counts_as_crashed_acquire() {
        let store = temp_store();
        fs::write(paths::maintenance_lock_path(store.path()), b"not json").expect("write");

        let lock = MaintenanceLock::try_acquire(store.path(), &AssumeAlive)
            .expect("corrupt marker should be recovered");
        lock.release().expect("release");
    }

    #[test]
    fn drop_releases_on_early_exit() {
        let store = temp_store();
        let path = paths::maintenance_lock_path(store.path());
        {
            let _lock =
                MaintenanceLock::try_acquire(store.path(), &ProcessLiveness).expect("acquire");
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn read_lock_holder_round_trips() {
        let store = temp_store();
        assert!(read_lock_holder(store.path()).expect("read").is_none());

        let lock = MaintenanceLock::try_acquire(store.path(), &ProcessLiveness)
            .expect("acquire");
        let holder = read_lock_holder(store.path())
            .expect("read")
            .expect("holder present");
        assert_eq!(holder.holder_id, lock.holder().holder_id);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_marker_is_rejected() {
        let store = temp_store();
        let target = store.path().join("target");
        fs::write(&target, b"{}").expect("write");
        std::os::unix::fs::symlink(&target, paths::maintenance_lock_path(store.path()))
            .expect("symlink");

        let err = MaintenanceLock::try_acquire(store.path(), &ProcessLiveness)
            .expect_err("symlink must be rejected");
        assert!(matches!(err, LockError::Symlink { .. }));
    }
}
