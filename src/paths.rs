//! Well-known paths: object-store internals plus XDG config/log locations.

use std::path::{Path, PathBuf};

/// Pack directory inside an object store root.
pub fn pack_dir(objects_root: &Path) -> PathBuf {
    objects_root.join("pack")
}

/// Marker file guarding the store against concurrent maintenance.
///
/// The path must be stable across every process sharing the enlistment;
/// all of them resolve it through this function.
pub fn maintenance_lock_path(objects_root: &Path) -> PathBuf {
    objects_root.join("maintenance.lock")
}

/// Lock marker owned by git's own multi-pack-index machinery.
///
/// A crashed `git multi-pack-index` invocation can leave this behind; the
/// pack compaction step deletes it before expiring.
pub fn multi_pack_index_lock_path(pack_root: &Path) -> PathBuf {
    pack_root.join("multi-pack-index.lock")
}

/// Base directory for configuration files.
///
/// Uses `PM_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/packmaint` or
/// `~/.config/packmaint`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PM_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("packmaint")
}

/// Base directory for log files.
///
/// Uses `PM_LOG_DIR` if set, otherwise `$XDG_STATE_HOME/packmaint/logs` or
/// `~/.local/state/packmaint/logs`.
pub fn log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PM_LOG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_STATE_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("state")
        })
        .join("packmaint")
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_dir_is_under_objects_root() {
        let root = Path::new("/repo/.git/objects");
        assert_eq!(pack_dir(root), PathBuf::from("/repo/.git/objects/pack"));
    }

    #[test]
    fn lock_paths_are_stable() {
        let root = Path::new("/cache/objects");
        assert_eq!(
            maintenance_lock_path(root),
            PathBuf::from("/cache/objects/maintenance.lock")
        );
        assert_eq!(
            multi_pack_index_lock_path(&pack_dir(root)),
            PathBuf::from("/cache/objects/pack/multi-pack-index.lock")
        );
    }
}
