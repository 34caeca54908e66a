//! Step execution.
//!
//! Steps run strictly in order with the snapshot directory as working
//! directory. A failed step is recorded and the run moves on; only
//! cancellation stops the sequence.

pub mod benchmark;
pub mod plan;
pub mod step;

use crate::process::Toolkit;
use crate::utils::errors::{BackupError, Result};
use benchmark::Benchmark;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use step::{Step, StepOutcome};

pub struct StepRunner<'a> {
    toolkit: &'a Toolkit,
    workdir: PathBuf,
    benchmark: &'a Benchmark,
    cancel: CancellationToken,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        toolkit: &'a Toolkit,
        workdir: &Path,
        benchmark: &'a Benchmark,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            toolkit,
            workdir: workdir.to_path_buf(),
            benchmark,
            cancel,
        }
    }

    /// Run every step and return their outcomes in execution order.
    pub async fn run(&self, steps: &[Step]) -> Result<Vec<StepOutcome>> {
        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            if self.cancel.is_cancelled() {
                return Err(BackupError::Interrupted);
            }
            info!("Backing up {} ...", step.name);
            let started = Instant::now();
            let success = match self.run_step(step).await {
                Ok(success) => success,
                Err(BackupError::Interrupted) => return Err(BackupError::Interrupted),
                Err(e) => {
                    warn!(step = %step.name, "Step could not be started: {}", e);
                    false
                }
            };
            let elapsed = started.elapsed();
            self.benchmark.record(&step.name, elapsed);
            if !success {
                warn!(step = %step.name, "Error backing up {}", step.name);
            }
            outcomes.push(StepOutcome {
                name: step.name.clone(),
                success,
                elapsed,
            });
        }
        Ok(outcomes)
    }

    async fn run_step(&self, step: &Step) -> Result<bool> {
        let mut cmd = self.toolkit.command(&step.program);
        cmd.args(&step.args).current_dir(&self.workdir);
        match &step.stdout_file {
            Some(file) => cmd.stdout(Stdio::from(File::create(self.workdir.join(file))?)),
            None => cmd.stdout(self.toolkit.verbose().stdio()?),
        };
        let mut child = cmd.spawn()?;
        tokio::select! {
            status = child.wait() => Ok(status?.success()),
            _ = self.cancel.cancelled() => Err(BackupError::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::toolkit::SHARE_DIR;
    use crate::snapshot::SnapshotId;
    use crate::utils::logger::VerboseChannel;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(root: &Path, name: &str, body: &str) {
        let dir = root.join(SHARE_DIR);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_steps() -> std::io::Result<()> {
        let install = TempDir::new()?;
        let data = TempDir::new()?;
        script(install.path(), "step-ok", "echo ok > \"$1\"");
        script(install.path(), "step-fail", "exit 1");

        let toolkit = Toolkit::new(install.path(), VerboseChannel::Discard);
        let id = SnapshotId::parse("20240101T000000").unwrap();
        let bench = Benchmark::init(data.path(), &id);
        let runner = StepRunner::new(&toolkit, data.path(), &bench, CancellationToken::new());
        let steps = vec![
            Step::new("first", "step-ok").arg("first.out"),
            Step::new("second", "step-fail"),
            Step::new("third", "step-ok").arg("third.out"),
            Step::new("missing", "no-such-collaborator-anywhere"),
        ];

        let outcomes = runner.run(&steps).await.unwrap();
        let flags: Vec<_> = outcomes.iter().map(|o| (o.name.as_str(), o.success)).collect();
        assert_eq!(
            flags,
            vec![("first", true), ("second", false), ("third", true), ("missing", false)]
        );
        assert_eq!(step::failed_names(&outcomes), vec!["second", "missing"]);
        assert!(data.path().join("first.out").exists());
        assert!(data.path().join("third.out").exists());

        let log = fs::read_to_string(bench.path().unwrap())?;
        assert_eq!(log.lines().count(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_stdout_capture_file() -> std::io::Result<()> {
        let install = TempDir::new()?;
        let data = TempDir::new()?;
        script(install.path(), "ghe-backup-redis", "printf REDIS");

        let toolkit = Toolkit::new(install.path(), VerboseChannel::Discard);
        let bench = Benchmark::disabled();
        let runner = StepRunner::new(&toolkit, data.path(), &bench, CancellationToken::new());
        let outcomes = runner
            .run(&[Step::new("redis", "ghe-backup-redis").stdout_to("redis.rdb")])
            .await
            .unwrap();
        assert!(step::all_succeeded(&outcomes));
        assert_eq!(fs::read_to_string(data.path().join("redis.rdb"))?, "REDIS");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_run_is_interrupted() -> std::io::Result<()> {
        let install = TempDir::new()?;
        let data = TempDir::new()?;
        let toolkit = Toolkit::new(install.path(), VerboseChannel::Discard);
        let bench = Benchmark::disabled();
        let cancel = CancellationToken::new();
        let runner = StepRunner::new(&toolkit, data.path(), &bench, cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = runner.run(&[Step::new("slow", "sleep").arg("30")]).await;
        assert!(matches!(result, Err(BackupError::Interrupted)));
        Ok(())
    }
}
