#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Temporary object store with a pack directory. Pack files are sparse
/// (`set_len`), so multi-hundred-MiB fixtures cost nothing on disk.
pub struct ObjectStoreFixture {
    _temp: TempDir,
    objects_root: PathBuf,
}

impl ObjectStoreFixture {
    pub fn new() -> std::io::Result<Self> {
        let temp = TempDir::new()?;
        let objects_root = temp.path().join("objects");
        fs::create_dir_all(objects_root.join("pack"))?;
        Ok(Self {
            _temp: temp,
            objects_root,
        })
    }

    pub fn objects_root(&self) -> &Path {
        &self.objects_root
    }

    pub fn pack_root(&self) -> PathBuf {
        self.objects_root.join("pack")
    }

    pub fn write_pack(&self, name: &str, len: u64) -> std::io::Result<PathBuf> {
        let path = self.pack_root().join(name);
        let file = fs::File::create(&path)?;
        file.set_len(len)?;
        Ok(path)
    }

    pub fn write_loose(&self, fanout: &str, rest: &str) -> std::io::Result<PathBuf> {
        let dir = self.objects_root.join(fanout);
        fs::create_dir_all(&dir)?;
        let path = dir.join(rest);
        fs::write(&path, b"loose")?;
        Ok(path)
    }

    /// Names of the pack files currently present, sorted.
    pub fn pack_names(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.pack_root())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("pack")
                && let Some(name) = path.file_name().and_then(|name| name.to_str())
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Sizes of the pack files currently present.
    pub fn pack_sizes(&self) -> std::io::Result<Vec<u64>> {
        let mut sizes = Vec::new();
        for entry in fs::read_dir(self.pack_root())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("pack") {
                sizes.push(entry.metadata()?.len());
            }
        }
        Ok(sizes)
    }
}

/// Remove every `*.pack` under `pack_root`. Used by scripted repack
/// closures to stand in for the external tool's consolidation.
pub fn remove_all_packs(pack_root: &Path) -> std::io::Result<u64> {
    let mut removed_bytes = 0u64;
    for entry in fs::read_dir(pack_root)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("pack") {
            removed_bytes += entry.metadata()?.len();
            fs::remove_file(&path)?;
        }
    }
    Ok(removed_bytes)
}
