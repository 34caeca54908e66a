//! Per-run timing log under `<data>/benchmarks`.

use crate::snapshot::SnapshotId;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const BENCHMARK_DIR: &str = "benchmarks";

#[derive(Debug, Clone)]
pub struct Benchmark {
    path: Option<PathBuf>,
}

impl Benchmark {
    /// Recording is skipped if the directory cannot be created.
    pub fn init(data_root: &Path, snapshot: &SnapshotId) -> Self {
        let dir = data_root.join(BENCHMARK_DIR);
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("Benchmarks disabled, cannot create {}: {}", dir.display(), e);
            return Self::disabled();
        }
        Self {
            path: Some(dir.join(format!("benchmark.{snapshot}.log"))),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, name: &str, elapsed: Duration) {
        let Some(path) = &self.path else {
            return;
        };
        let line = format!("{} took {}s\n", name, elapsed.as_secs());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("Failed to record benchmark for {}: {}", name, e);
        }
    }
}
