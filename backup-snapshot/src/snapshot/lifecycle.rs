//! Provisional → complete transitions of a snapshot directory.

use super::SnapshotId;
use crate::executor::StepOutcome;
use crate::utils::errors::{BackupError, Result};
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const INCOMPLETE_MARKER: &str = "incomplete";
pub const CURRENT_LINK: &str = "current";
pub const VERSION_FILE: &str = "version";
pub const STRATEGY_FILE: &str = "strategy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Provisional,
    StepsRunning,
    Complete,
    Failed,
}

#[derive(Debug)]
pub struct Snapshot {
    id: SnapshotId,
    dir: PathBuf,
    state: SnapshotState,
    outcomes: Vec<StepOutcome>,
}

impl Snapshot {
    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    pub fn mark_running(&mut self) {
        self.state = SnapshotState::StepsRunning;
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotLifecycle {
    data_root: PathBuf,
}

impl SnapshotLifecycle {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.data_root.join(id.as_str())
    }

    /// Create the snapshot directory and mark it incomplete.
    pub fn begin(&self, id: &SnapshotId) -> Result<Snapshot> {
        let dir = self.snapshot_dir(id);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(BackupError::SnapshotCollision(dir))
            }
            Err(e) => return Err(e.into()),
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(INCOMPLETE_MARKER))?;
        debug!("Created provisional snapshot {}", dir.display());

        Ok(Snapshot {
            id: id.clone(),
            dir,
            state: SnapshotState::Provisional,
            outcomes: Vec::new(),
        })
    }

    /// Record the remote release and strategy the snapshot was taken with.
    pub fn stamp(&self, snapshot: &Snapshot, version: &str, strategy: &str) -> Result<()> {
        fs::write(snapshot.dir.join(VERSION_FILE), format!("{version}\n"))?;
        fs::write(snapshot.dir.join(STRATEGY_FILE), format!("{strategy}\n"))?;
        Ok(())
    }

    /// Target of `current`, if any.
    pub fn current(&self) -> Option<PathBuf> {
        fs::read_link(self.data_root.join(CURRENT_LINK)).ok()
    }

    /// Settle the snapshot from its step outcomes. On full success the
    /// marker is removed, `current` is repointed and `prune` runs; otherwise
    /// the snapshot stays marked incomplete and `current` is untouched.
    pub async fn finalize<F, Fut>(
        &self,
        snapshot: &mut Snapshot,
        outcomes: Vec<StepOutcome>,
        prune: F,
    ) -> Result<SnapshotState>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        snapshot.outcomes.extend(outcomes);

        if !snapshot.failed_steps().is_empty() {
            snapshot.state = SnapshotState::Failed;
            return Ok(snapshot.state);
        }

        let marker = snapshot.dir.join(INCOMPLETE_MARKER);
        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.promote(&snapshot.id) {
            if let Err(restore) = fs::write(&marker, "") {
                warn!("Failed to restore {}: {}", marker.display(), restore);
            }
            return Err(e.into());
        }
        snapshot.state = SnapshotState::Complete;
        info!("Snapshot {} is now current", snapshot.id);

        if let Err(e) = prune().await {
            warn!("Pruning old snapshots failed: {:#}", e);
        }
        Ok(snapshot.state)
    }

    /// Repoint `current` through a rename so readers never see it missing.
    fn promote(&self, id: &SnapshotId) -> io::Result<()> {
        let link = self.data_root.join(CURRENT_LINK);
        let staging = self
            .data_root
            .join(format!("{}.{}.tmp", CURRENT_LINK, std::process::id()));
        match fs::remove_file(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        symlink(id.as_str(), &staging)?;
        if let Err(e) = fs::rename(&staging, &link) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        Ok(())
    }
}
