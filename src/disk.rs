//! Free-space guard for the host volume.
//!
//! When free space drops below the configured threshold the guard empties the
//! configured scratch folders (output, input, camera pictures). The folders
//! themselves are kept.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::Configuration;
use crate::error::DiskReclaimError;

const GIB: u64 = 1 << 30;

/// Source of free-space readings; always measured fresh.
pub trait SpaceProbe {
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Space available to unprivileged writers on the volume holding `path`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeProbe;

impl SpaceProbe for VolumeProbe {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    pub free_gb: u64,
    pub purged: bool,
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct DiskGuard<P = VolumeProbe> {
    probe_path: PathBuf,
    threshold_gb: u64,
    folders: Vec<PathBuf>,
    probe: P,
}

impl DiskGuard<VolumeProbe> {
    pub fn from_config(cfg: &Configuration) -> Self {
        Self::with_probe(
            VolumeProbe,
            cfg.disk_probe_path.clone(),
            cfg.minimum_free_disk_gb,
            cfg.scratch_folders(),
        )
    }
}

impl<P: SpaceProbe> DiskGuard<P> {
    pub fn with_probe(
        probe: P,
        probe_path: PathBuf,
        threshold_gb: u64,
        folders: Vec<PathBuf>,
    ) -> Self {
        Self {
            probe_path,
            threshold_gb,
            folders,
            probe,
        }
    }

    /// Whole GiB free on the probed volume (floor).
    pub fn free_gb(&self) -> Result<u64, DiskReclaimError> {
        let bytes = self
            .probe
            .free_bytes(&self.probe_path)
            .map_err(|source| DiskReclaimError::Probe {
                path: self.probe_path.clone(),
                source,
            })?;
        Ok(bytes / GIB)
    }

    /// Purge scratch folders if free space is strictly below the threshold.
    ///
    /// # Errors
    /// The first entry that cannot be removed stops the purge and is
    /// returned; earlier removals stay done.
    pub fn check_and_reclaim(&self) -> Result<ReclaimReport, DiskReclaimError> {
        let free_gb = self.free_gb()?;
        if free_gb >= self.threshold_gb {
            debug!(free_gb, threshold_gb = self.threshold_gb, "disk space ok");
            return Ok(ReclaimReport {
                free_gb,
                purged: false,
                removed: 0,
            });
        }

        info!(
            free_gb,
            threshold_gb = self.threshold_gb,
            folders = self.folders.len(),
            "free disk space below threshold; purging scratch folders"
        );
        let mut removed = 0;
        for folder in &self.folders {
            let count = purge_contents(folder)?;
            info!(folder = %folder.display(), removed = count, "scratch folder purged");
            removed += count;
        }
        Ok(ReclaimReport {
            free_gb,
            purged: true,
            removed,
        })
    }
}

/// Remove everything inside `folder`, keeping `folder` itself.
///
/// Files and symlinks are unlinked (links are never followed); directories
/// are removed recursively. Other entry kinds are left alone.
pub fn purge_contents(folder: &Path) -> Result<usize, DiskReclaimError> {
    let remove_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| DiskReclaimError::Remove { path, source }
    };

    let mut removed = 0;
    for entry in fs::read_dir(folder).map_err(remove_err(folder))? {
        let entry = entry.map_err(remove_err(folder))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(remove_err(&path))?;
        if file_type.is_file() || file_type.is_symlink() {
            fs::remove_file(&path).map_err(remove_err(&path))?;
        } else if file_type.is_dir() {
            fs::remove_dir_all(&path).map_err(remove_err(&path))?;
        } else {
            debug!(path = %path.display(), "purge: skipping special file");
            continue;
        }
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purges_files_dirs_and_links_but_keeps_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("out");
        fs::create_dir_all(root.join("nested/deeper")).unwrap();
        fs::write(root.join("a.png"), b"x").unwrap();
        fs::write(root.join("nested/deeper/b.png"), b"x").unwrap();

        let outside = tmp.path().join("keep.txt");
        fs::write(&outside, b"keep").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let removed = purge_contents(&root).unwrap();
        assert_eq!(removed, if cfg!(unix) { 3 } else { 2 });
        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
        assert_eq!(fs::read(&outside).unwrap(), b"keep");
    }

    #[test]
    fn empty_folder_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(purge_contents(tmp.path()).unwrap(), 0);
    }

    #[test]
    fn missing_folder_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("gone");
        let err = purge_contents(&missing).unwrap_err();
        assert!(matches!(err, DiskReclaimError::Remove { ref path, .. } if *path == missing));
    }
}
