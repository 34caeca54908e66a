//! Destination filesystem capability probe.
//!
//! Snapshots preserve symbolic links found in backed-up data and share
//! unchanged files with the previous snapshot through hard links. Both are
//! exercised here, in a scratch directory under the data root, before
//! anything is written to a snapshot.

use super::copier::{ProgramMissing, TreeCopier};
use crate::utils::errors::{BackupError, Result};
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::Path;
use tracing::debug;

const SCRATCH_PREFIX: &str = ".capability-probe.";

/// Deliberately dangling, like hook links inside repository metadata.
const DANGLING_TARGET: &str = "/data/does/not/exist/hooks/";

pub fn verify(data_root: &Path, copier: &dyn TreeCopier) -> Result<()> {
    // Removed on drop, whichever way this function returns.
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(data_root)
        .map_err(|e| {
            BackupError::Environment(format!(
                "cannot create a scratch directory in {}: {}",
                data_root.display(),
                e
            ))
        })?;
    let src = scratch.path().join("src");
    let dest1 = scratch.path().join("dest1");
    let dest2 = scratch.path().join("dest2");

    fs::create_dir(&src)
        .and_then(|_| fs::write(src.join("testfile"), b""))
        .map_err(|e| {
            BackupError::Environment(format!("cannot write to {}: {}", data_root.display(), e))
        })?;

    if let Err(e) = symlink(DANGLING_TARGET, src.join("hooks")) {
        return Err(BackupError::Environment(format!(
            "the filesystem containing {} does not support symbolic links ({}).\n\
             Git repositories contain symbolic links that need to be preserved during a backup.",
            data_root.display(),
            e
        )));
    }

    let unsupported_links = |detail: String| {
        BackupError::Environment(format!(
            "the filesystem containing {} does not support hard links ({}).\n\
             Backup Utils uses hard links to store backup data efficiently.",
            data_root.display(),
            detail
        ))
    };

    let copy_failed = |e: std::io::Error| match ProgramMissing::find(&e) {
        Some(missing) => BackupError::Environment(format!(
            "cannot verify {}: {}",
            data_root.display(),
            missing
        )),
        None => unsupported_links(e.to_string()),
    };

    copier.copy_tree(&src, &dest1, None).map_err(copy_failed)?;
    copier.copy_tree(&src, &dest2, Some(&dest1)).map_err(copy_failed)?;

    let first = fs::symlink_metadata(dest1.join("testfile"))
        .map_err(|e| unsupported_links(e.to_string()))?;
    let second = fs::symlink_metadata(dest2.join("testfile"))
        .map_err(|e| unsupported_links(e.to_string()))?;
    if (first.dev(), first.ino()) != (second.dev(), second.ino()) {
        return Err(unsupported_links("linked copy did not share storage".into()));
    }

    let copied_link = fs::symlink_metadata(dest2.join("hooks"))
        .map_err(|e| unsupported_links(e.to_string()))?;
    if !copied_link.file_type().is_symlink() {
        return Err(unsupported_links("dangling symbolic link was not preserved".into()));
    }

    debug!(data_root = %data_root.display(), "Filesystem supports symbolic and hard links");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::copier::{HardLinkCopier, RsyncCopier};
    use std::io;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Copies without ever linking, like a filesystem without hard links.
    struct CopyOnly;

    impl TreeCopier for CopyOnly {
        fn copy_tree(&self, src: &Path, dest: &Path, _link_dest: Option<&Path>) -> io::Result<()> {
            HardLinkCopier.copy_tree(src, dest, None)
        }
    }

    struct Failing;

    impl TreeCopier for Failing {
        fn copy_tree(&self, _src: &Path, _dest: &Path, _link_dest: Option<&Path>) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "Operation not permitted"))
        }
    }

    fn leftovers(dir: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(fs::read_dir(dir)?.filter_map(|e| e.ok()).map(|e| e.path()).collect())
    }

    #[test]
    fn test_probe_passes_and_cleans_up() -> io::Result<()> {
        let data = TempDir::new()?;
        verify(data.path(), &HardLinkCopier).unwrap();
        assert!(leftovers(data.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_probe_rejects_unshared_storage() -> io::Result<()> {
        let data = TempDir::new()?;
        let err = verify(data.path(), &CopyOnly).unwrap_err();
        assert!(matches!(err, BackupError::Environment(_)));
        assert!(err.to_string().contains("hard links"));
        assert!(leftovers(data.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_copy_program_is_named() -> io::Result<()> {
        let data = TempDir::new()?;
        let err = verify(data.path(), &RsyncCopier::new("/nonexistent/bin/rsync")).unwrap_err();
        assert!(matches!(err, BackupError::Environment(_)));
        assert!(err.to_string().contains("not found in PATH"));
        assert!(!err.to_string().contains("hard links"));
        assert!(leftovers(data.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_probe_reports_copy_failure() -> io::Result<()> {
        let data = TempDir::new()?;
        let err = verify(data.path(), &Failing).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(leftovers(data.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_probe_missing_data_root() {
        let err = verify(Path::new("/nonexistent/backup/data"), &HardLinkCopier).unwrap_err();
        assert!(matches!(err, BackupError::Environment(_)));
    }
}
