//! Pack directory inspection.

use std::fs;
use std::io;
use std::path::Path;

/// Extension of the files the inspector counts.
pub const PACK_EXTENSION: &str = "pack";

/// Point-in-time view of the pack directory. Constructed fresh on each
/// inspection, never mutated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackDirectorySnapshot {
    pub total_size_bytes: u64,
    pub pack_count: u32,
}

/// Scan `pack_root` for `*.pack` files and sum their lengths.
///
/// A directory that does not exist yet yields a zero snapshot. A file that
/// vanishes between enumeration and stat (a race with a concurrent repack)
/// counts as zero-length for that entry rather than failing the scan.
pub fn snapshot(pack_root: &Path) -> io::Result<PackDirectorySnapshot> {
    let entries = match fs::read_dir(pack_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(PackDirectorySnapshot::default());
        }
        Err(err) => return Err(err),
    };

    let mut total_size_bytes = 0u64;
    let mut pack_count = 0u32;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(PACK_EXTENSION) {
            continue;
        }
        let len = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "pack vanished during scan");
                0
            }
            Err(err) => return Err(err),
        };
        total_size_bytes = total_size_bytes.saturating_add(len);
        pack_count = pack_count.saturating_add(1);
    }

    Ok(PackDirectorySnapshot {
        total_size_bytes,
        pack_count,
    })
}
