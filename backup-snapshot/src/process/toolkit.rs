//! Collaborator resolution and invocation.
//!
//! Collaborators are external executables (exporters, host check, pruning,
//! remote shell helper). They are looked up in the installation's share and
//! bin directories first and on `PATH` otherwise, and every invocation
//! receives the run context as environment variables.

use crate::utils::errors::{BackupError, Result};
use crate::utils::logger::VerboseChannel;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SHARE_DIR: &str = "share/github-backup-utils";

#[derive(Debug, Clone)]
pub struct Toolkit {
    search_dirs: Vec<PathBuf>,
    env: Vec<(String, String)>,
    verbose: VerboseChannel,
}

impl Toolkit {
    pub fn new(install_root: &Path, verbose: VerboseChannel) -> Self {
        Self {
            search_dirs: vec![install_root.join(SHARE_DIR), install_root.join("bin")],
            env: Vec::new(),
            verbose,
        }
    }

    /// Add or replace context variables passed to every collaborator.
    pub fn with_env<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match self.env.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => self.env.push((key, value)),
            }
        }
        self
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn verbose(&self) -> &VerboseChannel {
        &self.verbose
    }

    /// Installed collaborator path, or the bare name for a `PATH` lookup.
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.search_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(name))
    }

    /// A command for `program` carrying the run context. Resolves bare
    /// collaborator names; explicit paths are used as given.
    pub fn command<S: AsRef<OsStr>>(&self, program: S) -> Command {
        let program = program.as_ref();
        let resolved = match program.to_str() {
            Some(name) if !name.contains('/') => self.resolve(name),
            _ => PathBuf::from(program),
        };
        let mut cmd = Command::new(resolved);
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    /// Run a collaborator and capture its standard output.
    pub async fn capture<I, S>(&self, name: &str, args: I, cancel: &CancellationToken) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(name);
        cmd.args(args).stdout(Stdio::piped());
        debug!(collaborator = name, "Running collaborator");
        tokio::select! {
            output = cmd.output() => Ok(output?),
            _ = cancel.cancelled() => Err(BackupError::Interrupted),
        }
    }

    /// Run a collaborator whose output only matters in verbose mode.
    pub async fn run<I, S>(&self, name: &str, args: I, cancel: &CancellationToken) -> Result<ExitStatus>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(name);
        cmd.args(args).stdout(self.verbose.stdio()?);
        debug!(collaborator = name, "Running collaborator");
        let mut child = cmd.spawn()?;
        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = cancel.cancelled() => Err(BackupError::Interrupted),
        }
    }

    /// Run a collaborator whose failure is only worth a warning.
    pub async fn run_advisory<I, S>(&self, name: &str, args: I, cancel: &CancellationToken) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let status = self.run(name, args, cancel).await?;
        if !status.success() {
            anyhow::bail!("{} exited with {}", name, status);
        }
        Ok(())
    }
}
