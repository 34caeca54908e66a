//! Tree copies with hard links against a previous copy.
//!
//! This is the incremental scheme snapshots rely on: files unchanged since
//! the previous snapshot are hard links to it rather than new copies.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use walkdir::{DirEntry, WalkDir};

/// Copies `src` into `dest`, linking unchanged entries against `link_dest`.
pub trait TreeCopier: Send + Sync {
    fn copy_tree(&self, src: &Path, dest: &Path, link_dest: Option<&Path>) -> io::Result<()>;
}

/// The copy program could not be started at all.
#[derive(Debug, thiserror::Error)]
#[error("{} not found in PATH or the install bin directory", .0.display())]
pub struct ProgramMissing(pub PathBuf);

impl ProgramMissing {
    /// The `ProgramMissing` carried by `err`, if any.
    pub fn find(err: &io::Error) -> Option<&ProgramMissing> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<ProgramMissing>())
    }
}

/// `rsync -a --link-dest`, the mechanism the exporters use.
#[derive(Debug, Clone)]
pub struct RsyncCopier {
    program: PathBuf,
}

impl RsyncCopier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for RsyncCopier {
    fn default() -> Self {
        Self::new("rsync")
    }
}

impl TreeCopier for RsyncCopier {
    fn copy_tree(&self, src: &Path, dest: &Path, link_dest: Option<&Path>) -> io::Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-a");
        if let Some(prev) = link_dest {
            // rsync resolves relative link-dest paths against the destination.
            let prev = prev.canonicalize()?;
            cmd.arg(format!("--link-dest={}", prev.display()));
        }
        let status = cmd
            .arg(format!("{}/", src.display()))
            .arg(format!("{}/", dest.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    io::Error::new(io::ErrorKind::NotFound, ProgramMissing(self.program.clone()))
                }
                _ => e,
            })?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}", self.program.display(), status),
            ));
        }
        Ok(())
    }
}

/// In-process equivalent of `rsync -a --link-dest` that decides by content.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardLinkCopier;

impl HardLinkCopier {
    fn same_file(prev: &Path, src: &Path, src_len: u64) -> io::Result<bool> {
        match fs::symlink_metadata(prev) {
            Ok(meta) if meta.is_file() && meta.len() == src_len => Ok(fs::read(prev)? == fs::read(src)?),
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn same_link(prev: &Path, target: &Path) -> bool {
        fs::symlink_metadata(prev).is_ok_and(|m| m.file_type().is_symlink())
            && fs::read_link(prev).is_ok_and(|t| t == target)
    }

    fn copy_entry(entry: &DirEntry, root: &Path, dest: &Path, link_dest: Option<&Path>) -> io::Result<()> {
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let target = dest.join(relative);
        let previous = link_dest.map(|p| p.join(relative));
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            return fs::set_permissions(&target, entry.metadata()?.permissions());
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            return match previous {
                // Hard-linking the link itself, which may dangle.
                Some(prev) if Self::same_link(&prev, &link_target) => fs::hard_link(&prev, &target),
                _ => symlink(&link_target, &target),
            };
        }

        let len = entry.metadata()?.len();
        match previous {
            Some(prev) if Self::same_file(&prev, entry.path(), len)? => fs::hard_link(&prev, &target),
            _ => fs::copy(entry.path(), &target).map(|_| ()),
        }
    }
}

impl TreeCopier for HardLinkCopier {
    fn copy_tree(&self, src: &Path, dest: &Path, link_dest: Option<&Path>) -> io::Result<()> {
        fs::create_dir_all(dest)?;
        for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            Self::copy_entry(&entry, src, dest, link_dest)?;
        }
        Ok(())
    }
}
