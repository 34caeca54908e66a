//! Single-writer lock for a data directory.
//!
//! The lock is a plain file holding `"<snapshot> <pid>"`. Ownership is
//! decided by process liveness rather than advisory file locks, so a lock
//! left behind by a crash or a reboot is recognised as stale and replaced.

use super::SnapshotId;
use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const LOCK_FILE: &str = "in-progress";

const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub snapshot: String,
    pub pid: i32,
}

impl LockRecord {
    fn parse(content: &str) -> Option<Self> {
        let mut fields = content.split_whitespace();
        let snapshot = fields.next()?.to_string();
        let pid = fields.next()?.parse().ok().filter(|pid: &i32| *pid > 0)?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self { snapshot, pid })
    }

    fn render(&self) -> String {
        format!("{} {}\n", self.snapshot, self.pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Absent,
    /// Symlink left by an older release; its owner cannot be determined.
    Legacy,
    Held(LockRecord),
    Malformed(String),
}

/// Whether `pid` names a running process.
pub fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but belongs to another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn current_pid() -> i32 {
    std::process::id() as i32
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    host: String,
}

impl LockManager {
    /// `host` only appears in conflict diagnostics.
    pub fn new(data_root: &Path, host: impl Into<String>) -> Self {
        Self {
            path: data_root.join(LOCK_FILE),
            host: host.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> io::Result<LockState> {
        match fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(LockState::Legacy),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockState::Absent),
            Err(e) => return Err(e),
        }
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockState::Absent),
            Err(e) => return Err(e),
        };
        Ok(match LockRecord::parse(&content) {
            Some(record) => LockState::Held(record),
            None => LockState::Malformed(content),
        })
    }

    fn conflict(&self, reason: String) -> BackupError {
        BackupError::LockConflict(format!(
            "{}\nIf no backup is in progress anymore, please remove the {} file and try again.",
            reason,
            self.path.display()
        ))
    }

    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn scratch(&self, suffix: &str) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(&format!("{LOCK_FILE}."))
            .suffix(suffix)
            .tempfile_in(self.dir())
    }

    /// Move the lock aside and keep it only if it is still `stale`. Returns
    /// `false` when the moved file turned out to be someone else's record,
    /// which is put back.
    fn discard_stale(&self, stale: &LockRecord) -> io::Result<bool> {
        let aside = self.scratch(".stale")?;
        match fs::rename(&self.path, aside.path()) {
            Ok(()) => {}
            // Another acquirer moved it first.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        }
        let moved = fs::read_to_string(aside.path()).ok();
        if moved.as_deref().and_then(LockRecord::parse).as_ref() == Some(stale) {
            return Ok(true);
        }
        if let Err(e) = fs::hard_link(aside.path(), &self.path) {
            warn!("Failed to restore lock record {}: {}", self.path.display(), e);
        }
        Ok(false)
    }

    /// Publish `record` in one step; fails with `AlreadyExists` if a lock
    /// appeared meanwhile.
    fn publish(&self, record: &LockRecord) -> io::Result<()> {
        let mut staged = self.scratch(".tmp")?;
        staged.write_all(record.render().as_bytes())?;
        staged.as_file().sync_all()?;
        fs::hard_link(staged.path(), &self.path)
    }

    /// Take the lock for `snapshot` on behalf of this process.
    pub fn acquire(&self, snapshot: &SnapshotId) -> Result<LockGuard> {
        let record = LockRecord {
            snapshot: snapshot.to_string(),
            pid: current_pid(),
        };
        let contended =
            || self.conflict("Another backup is acquiring the lock concurrently.".to_string());

        for _ in 0..ACQUIRE_ATTEMPTS {
            match self.read()? {
                LockState::Absent => {}
                LockState::Legacy => {
                    return Err(self.conflict(
                        "Detected a backup already in progress from a previous version of ghe-backup."
                            .to_string(),
                    ))
                }
                LockState::Malformed(content) => {
                    return Err(self.conflict(format!(
                        "Unrecognized lock record '{}'; a backup may still be running.",
                        content.trim()
                    )))
                }
                LockState::Held(held) if process_alive(held.pid) => {
                    return Err(self.conflict(format!(
                        "A backup of {} may still be running on PID {}. \
                         If PID {} is not a process related to the backup utilities, it is safe to proceed.",
                        self.host, held.pid, held.pid
                    )))
                }
                LockState::Held(stale) => {
                    warn!(
                        snapshot = %stale.snapshot,
                        pid = stale.pid,
                        "Discarding stale lock left by a process that is no longer running"
                    );
                    if !self.discard_stale(&stale)? {
                        return Err(contended());
                    }
                }
            }

            match self.publish(&record) {
                Ok(()) => {
                    debug!(snapshot = %record.snapshot, pid = record.pid, "Acquired backup lock");
                    return Ok(LockGuard {
                        manager: self.clone(),
                        record,
                        released: false,
                    });
                }
                // Someone else published since we looked; re-examine.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(contended())
    }

    /// Remove the lock only if it still names `snapshot` and `pid`.
    /// Returns whether a record was removed.
    pub fn release(&self, snapshot: &SnapshotId, pid: i32) -> io::Result<bool> {
        match self.read()? {
            LockState::Held(record) if record.snapshot == snapshot.as_str() && record.pid == pid => {
                match fs::remove_file(&self.path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e),
                }
            }
            _ => Ok(false),
        }
    }
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Release now; later calls and the drop are no-ops.
    pub fn release(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let snapshot = SnapshotId::parse(&self.record.snapshot);
        if let Some(snapshot) = snapshot {
            if self.manager.release(&snapshot, self.record.pid)? {
                debug!(snapshot = %snapshot, "Released backup lock");
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release backup lock {}: {}", self.manager.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::process::Command;
    use tempfile::TempDir;

    fn id(s: &str) -> SnapshotId {
        SnapshotId::parse(s).unwrap()
    }

    fn dead_pid() -> i32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_parse_record() {
        assert_eq!(
            LockRecord::parse("20240101T000000 4242\n"),
            Some(LockRecord { snapshot: "20240101T000000".into(), pid: 4242 })
        );
        assert_eq!(LockRecord::parse("20240101T000000"), None);
        assert_eq!(LockRecord::parse("20240101T000000 -1"), None);
        assert_eq!(LockRecord::parse("a b c"), None);
    }

    #[test]
    fn test_acquire_writes_record_and_guard_releases() -> io::Result<()> {
        let data = TempDir::new()?;
        let manager = LockManager::new(data.path(), "github.example.com");
        let snapshot = id("20240101T000000");
        {
            let guard = manager.acquire(&snapshot).unwrap();
            assert_eq!(guard.record().pid, current_pid());
            let content = fs::read_to_string(manager.path())?;
            assert_eq!(content, format!("20240101T000000 {}\n", current_pid()));
        }
        assert_eq!(manager.read()?, LockState::Absent);
        Ok(())
    }

    #[test]
    fn test_second_acquire_conflicts() -> io::Result<()> {
        let data = TempDir::new()?;
        let manager = LockManager::new(data.path(), "github.example.com");
        let _held = manager.acquire(&id("20240101T000000")).unwrap();
        let err = manager.acquire(&id("20240101T000001")).unwrap_err();
        assert!(matches!(err, BackupError::LockConflict(_)));
        assert!(err.to_string().contains("github.example.com"));
        assert!(err.to_string().contains(&current_pid().to_string()));
        Ok(())
    }

    #[test]
    fn test_stale_lock_is_discarded() -> io::Result<()> {
        let data = TempDir::new()?;
        let manager = LockManager::new(data.path(), "h");
        let pid = dead_pid();
        assert!(!process_alive(pid));
        fs::write(manager.path(), format!("20200101T000000 {pid}\n"))?;

        let guard = manager.acquire(&id("20240101T000000")).unwrap();
        assert_eq!(guard.record().snapshot, "20240101T000000");
        Ok(())
    }

    #[test]
    fn test_legacy_lock_always_conflicts() -> io::Result<()> {
        let data = TempDir::new()?;
        let manager = LockManager::new(data.path(), "h");
        symlink("20200101T000000", manager.path())?;
        assert_eq!(manager.read()?, LockState::Legacy);
        let err = manager.acquire(&id("20240101T000000")).unwrap_err();
        assert!(matches!(err, BackupError::LockConflict(_)));
        assert!(fs::symlink_metadata(manager.path())?.file_type().is_symlink());
        Ok(())
    }

    #[test]
    fn test_malformed_lock_conflicts() -> io::Result<()> {
        let data = TempDir::new()?;
        let manager = LockManager::new(data.path(), "h");
        fs::write(manager.path(), "garbage")?;
        assert!(manager.acquire(&id("20240101T000000")).is_err());
        Ok(())
    }

    #[test]
    fn test_release_only_removes_own_record() -> io::Result<()> {
        let data = TempDir::new()?;
        let manager = LockManager::new(data.path(), "h");
        let newer = format!("20240101T000500 {}\n", current_pid());
        fs::write(manager.path(), &newer)?;

        assert!(!manager.release(&id("20240101T000000"), current_pid())?);
        assert!(!manager.release(&id("20240101T000500"), current_pid() + 1)?);
        assert_eq!(fs::read_to_string(manager.path())?, newer);
        Ok(())
    }

    #[test]
    fn test_release_twice_is_noop() -> io::Result<()> {
        let data = TempDir::new()?;
        let manager = LockManager::new(data.path(), "h");
        let snapshot = id("20240101T000000");
        let mut guard = manager.acquire(&snapshot).unwrap();
        guard.release()?;
        guard.release()?;
        assert!(!manager.release(&snapshot, current_pid())?);
        assert_eq!(manager.read()?, LockState::Absent);
        Ok(())
    }

    #[test]
    fn test_racing_acquirers_never_both_hold_stale_lock() -> io::Result<()> {
        use std::sync::Barrier;

        let stale_pid = dead_pid();
        for round in 0..200 {
            let data = TempDir::new()?;
            let manager = LockManager::new(data.path(), "h");
            fs::write(manager.path(), format!("20200101T000000 {stale_pid}\n"))?;

            let start = Barrier::new(2);
            let hold = Barrier::new(2);
            let ids = [id("20240101T000000"), id("20240101T000001")];
            let acquired: usize = std::thread::scope(|scope| {
                let handles: Vec<_> = ids
                    .iter()
                    .map(|snapshot| {
                        let manager = manager.clone();
                        let (start, hold) = (&start, &hold);
                        scope.spawn(move || {
                            start.wait();
                            let guard = manager.acquire(snapshot);
                            hold.wait();
                            guard.is_ok()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count()
            });
            assert!(acquired <= 1, "round {round}: both acquirers held the lock");

            let leftovers: Vec<_> = fs::read_dir(data.path())?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name())
                .collect();
            assert!(
                leftovers.iter().all(|name| name == LOCK_FILE),
                "round {round}: scratch files left: {leftovers:?}"
            );
        }
        Ok(())
    }

    #[test]
    fn test_lock_dir_holds_only_record_after_acquire() -> io::Result<()> {
        let data = TempDir::new()?;
        let manager = LockManager::new(data.path(), "h");
        fs::write(manager.path(), format!("20200101T000000 {}\n", dead_pid()))?;
        let _guard = manager.acquire(&id("20240101T000000")).unwrap();
        let names: Vec<_> = fs::read_dir(data.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(LOCK_FILE)]);
        Ok(())
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(current_pid()));
    }
}
