//! One backup run, from capability probe to lock release.

use crate::config::Configuration;
use crate::executor::benchmark::Benchmark;
use crate::executor::plan::{self, PlanContext};
use crate::executor::step::{self, Step, StepOutcome};
use crate::executor::StepRunner;
use crate::fs::{capability, RsyncCopier, TreeCopier};
use crate::process::Toolkit;
use crate::remote::VersionNegotiator;
use crate::snapshot::{LockManager, SnapshotId, SnapshotLifecycle, SnapshotState};
use crate::utils::errors::{BackupError, Result};
use std::collections::HashMap;
use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_STRATEGY: &str = "rsync";

/// Outcome of a run that reached the step phase.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub snapshot: SnapshotId,
    pub host: String,
    pub state: SnapshotState,
    pub outcomes: Vec<StepOutcome>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == SnapshotState::Complete
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        step::failed_names(&self.outcomes)
    }

    pub fn summary(&self) -> String {
        if self.succeeded() {
            format!("Completed backup of {} in snapshot {}", self.host, self.snapshot)
        } else {
            format!(
                "Error: Snapshot incomplete. Some steps failed: {}.",
                self.failed_steps().join(", ")
            )
        }
    }
}

/// Cleans up the remote session multiplexer however the run ends.
struct SessionGuard {
    toolkit: Toolkit,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let program = self.toolkit.resolve("ghe-ssh");
        let result = Command::new(&program)
            .arg("--clean")
            .envs(self.toolkit.env().iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if !status.success() => debug!("ghe-ssh --clean exited with {}", status),
            Ok(_) => {}
            Err(e) => debug!("ghe-ssh --clean could not run: {}", e),
        }
    }
}

pub struct Orchestrator {
    config: Configuration,
    toolkit: Toolkit,
    copier: Arc<dyn TreeCopier>,
    negotiator: VersionNegotiator,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Configuration, cancel: CancellationToken) -> Self {
        let inherited: HashMap<String, String> = std::env::vars().collect();
        let toolkit = Toolkit::new(&config.install_root, config.verbose_channel())
            .with_env(config.collaborator_env());
        let negotiator = VersionNegotiator::new(config.remote_root_dir.clone()).inherit_from(&inherited);
        let copier = Arc::new(RsyncCopier::new(toolkit.resolve("rsync")));
        Self {
            config,
            toolkit,
            copier,
            negotiator,
            cancel,
        }
    }

    /// Replace the copier used by the capability probe.
    pub fn with_copier(mut self, copier: Arc<dyn TreeCopier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_negotiator(mut self, negotiator: VersionNegotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub async fn run(&self) -> Result<RunReport> {
        self.run_with(plan::standard).await
    }

    /// Run with a custom step plan.
    pub async fn run_with<F>(&self, make_plan: F) -> Result<RunReport>
    where
        F: FnOnce(&PlanContext<'_>) -> Vec<Step>,
    {
        let started = Instant::now();
        let data_dir = self.config.data_dir.clone();
        info!(source = %self.config.source.display(), "Using configuration");
        if self.config.data_dir_created {
            info!("Created data directory {}", data_dir.display());
        }

        let copier = Arc::clone(&self.copier);
        let probe_root = data_dir.clone();
        tokio::task::spawn_blocking(move || capability::verify(&probe_root, copier.as_ref()))
            .await
            .map_err(|e| BackupError::Io(io::Error::new(io::ErrorKind::Other, e)))??;

        let id = SnapshotId::now();
        let _lock = LockManager::new(&data_dir, self.config.hostname.clone()).acquire(&id)?;
        let _session = SessionGuard {
            toolkit: self.toolkit.clone(),
        };

        let lifecycle = SnapshotLifecycle::new(&data_dir);
        let mut snapshot = lifecycle.begin(&id)?;
        let benchmark = Benchmark::init(&data_dir, &id);

        let remote = self
            .negotiator
            .ensure(&self.config.hostname, &self.toolkit, &self.cancel)
            .await?;
        let host = remote.host.clone();

        let mut toolkit = self.toolkit.clone().with_env(remote.env()).with_env([
            ("GHE_SNAPSHOT_TIMESTAMP".to_string(), id.to_string()),
            ("GHE_SNAPSHOT_DIR".to_string(), snapshot.dir().display().to_string()),
        ]);

        let local = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let banner = format!(
            "Starting backup from {} with backup-utils v{} in snapshot {}",
            local,
            env!("CARGO_PKG_VERSION"),
            id
        );
        info!("{}", banner);
        self.remote_log(&toolkit, &host, &banner).await;

        let strategy = self.strategy(&toolkit).await?;
        toolkit = toolkit.with_env([("GHE_BACKUP_STRATEGY".to_string(), strategy.clone())]);
        lifecycle.stamp(&snapshot, &remote.raw_version, &strategy)?;

        if let Err(e) = toolkit
            .run_advisory("ghe-backup-store-version", std::iter::empty::<&str>(), &self.cancel)
            .await
        {
            warn!("Failed to store backup-utils version on {}: {:#}", host, e);
        }

        snapshot.mark_running();
        let steps = make_plan(&PlanContext {
            host: &host,
            strategy: &strategy,
            skip_pages: self.config.skip_pages,
            run_fsck: self.config.run_fsck,
            snapshot_dir: snapshot.dir(),
        });
        let outcomes = StepRunner::new(&toolkit, snapshot.dir(), &benchmark, self.cancel.clone())
            .run(&steps)
            .await?;

        let state = lifecycle
            .finalize(&mut snapshot, outcomes, || self.prune(&toolkit))
            .await?;

        if state == SnapshotState::Complete {
            let dir = snapshot.dir().display().to_string();
            if let Err(e) = toolkit
                .run_advisory("ghe-detect-leaked-ssh-keys", ["-s", dir.as_str()], &self.cancel)
                .await
            {
                warn!("Leaked SSH key scan failed: {:#}", e);
            }
        }

        let elapsed = started.elapsed();
        benchmark.record("ghe-backup", elapsed);
        let report = RunReport {
            snapshot: id,
            host: host.clone(),
            state,
            outcomes: snapshot.outcomes().to_vec(),
            elapsed,
        };
        self.remote_log(&toolkit, &host, &report.summary()).await;
        Ok(report)
    }

    /// `GHE_BACKUP_STRATEGY`, else what `ghe-backup-strategy` reports.
    async fn strategy(&self, toolkit: &Toolkit) -> Result<String> {
        if let Some(strategy) = &self.config.backup_strategy {
            return Ok(strategy.clone());
        }
        let output = match toolkit
            .capture("ghe-backup-strategy", std::iter::empty::<&str>(), &self.cancel)
            .await
        {
            Ok(output) => output,
            Err(BackupError::Interrupted) => return Err(BackupError::Interrupted),
            Err(e) => {
                debug!("ghe-backup-strategy unavailable: {}", e);
                return Ok(DEFAULT_STRATEGY.to_string());
            }
        };
        let reported = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() || reported.is_empty() {
            return Ok(DEFAULT_STRATEGY.to_string());
        }
        Ok(reported)
    }

    async fn prune(&self, toolkit: &Toolkit) -> anyhow::Result<()> {
        if self.config.pruning_scheduled {
            info!("Pruning is scheduled separately, skipping");
            return Ok(());
        }
        info!("Pruning snapshots beyond the newest {}", self.config.num_snapshots);
        toolkit
            .run_advisory("ghe-prune-snapshots", std::iter::empty::<&str>(), &self.cancel)
            .await
    }

    async fn remote_log(&self, toolkit: &Toolkit, host: &str, message: &str) {
        if let Err(e) = toolkit
            .run_advisory("ghe-ssh", [host, "--", "logger", "-t", "backup-utils", message], &self.cancel)
            .await
        {
            debug!("Remote log entry not written: {:#}", e);
        }
    }
}
