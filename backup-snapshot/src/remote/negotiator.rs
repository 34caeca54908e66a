//! Remote version negotiation.
//!
//! The host check runs at most once per process tree: the outcome is cached
//! for this process and exported to every collaborator, and a process that
//! inherits `GHE_REMOTE_VERSION` reuses it instead of probing again.

use super::version::{DataLayout, PathFixup, RemoteVersion, VersionParseError};
use crate::process::Toolkit;
use crate::utils::errors::{BackupError, Result};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const HOST_CHECK: &str = "ghe-host-check";

/// Everything derived from the remote version, fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedRemote {
    /// Effective host; the host check may have corrected the port.
    pub host: String,
    /// Version string as reported.
    pub raw_version: String,
    pub version: RemoteVersion,
    pub layout: DataLayout,
    pub data_dir: String,
    pub user_data_dir: String,
    pub path_fixup: PathFixup,
}

impl NegotiatedRemote {
    pub fn new(
        host: impl Into<String>,
        raw_version: impl Into<String>,
        remote_root: &str,
    ) -> std::result::Result<Self, VersionParseError> {
        let raw_version = raw_version.into();
        let version: RemoteVersion = raw_version.parse()?;
        let layout = DataLayout::for_version(&version);
        Ok(Self {
            host: host.into(),
            data_dir: format!("{}/data", remote_root.trim_end_matches('/')),
            user_data_dir: layout.user_data_dir(remote_root),
            path_fixup: PathFixup::for_version(&version),
            raw_version,
            version,
            layout,
        })
    }

    /// Rebuild from variables exported by a parent process.
    pub fn from_env(env: &HashMap<String, String>) -> Option<std::result::Result<Self, VersionParseError>> {
        let raw = env.get("GHE_REMOTE_VERSION").filter(|v| !v.is_empty())?;
        let host = env.get("GHE_HOSTNAME").filter(|h| !h.is_empty())?;
        let root = env.get("GHE_REMOTE_ROOT_DIR").map(String::as_str).unwrap_or("");
        Some(Self::new(host.clone(), raw.clone(), root))
    }

    /// Variables exported to collaborators.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("GHE_HOSTNAME".to_string(), self.host.clone()),
            ("GHE_REMOTE_VERSION".to_string(), self.raw_version.clone()),
            ("GHE_VERSION_MAJOR".to_string(), self.version.major.to_string()),
            ("GHE_VERSION_MINOR".to_string(), self.version.minor.to_string()),
            ("GHE_VERSION_PATCH".to_string(), self.version.patch.to_string()),
            ("GHE_REMOTE_DATA_DIR".to_string(), self.data_dir.clone()),
            ("GHE_REMOTE_DATA_USER_DIR".to_string(), self.user_data_dir.clone()),
        ]
    }
}

/// Extract `(host, version)` from the host check's report. The last
/// non-empty line reads `Connect <host> OK (<version>)`.
pub fn parse_host_check(report: &str) -> Option<(String, String)> {
    let last = report.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    let rest = last.strip_prefix("Connect ")?;
    let (host, tail) = rest.split_once(" OK")?;
    let open = tail.find('(')?;
    let close = tail[open..].find(')')? + open;
    let version = tail[open + 1..close].trim();
    if host.is_empty() || version.is_empty() {
        return None;
    }
    Some((host.trim().to_string(), version.to_string()))
}

pub struct VersionNegotiator {
    remote_root: String,
    inherited: Option<NegotiatedRemote>,
    negotiated: OnceCell<NegotiatedRemote>,
}

impl VersionNegotiator {
    pub fn new(remote_root: impl Into<String>) -> Self {
        Self {
            remote_root: remote_root.into(),
            inherited: None,
            negotiated: OnceCell::new(),
        }
    }

    /// Reuse a negotiation exported by a parent process, if any.
    pub fn inherit_from(mut self, env: &HashMap<String, String>) -> Self {
        self.inherited = NegotiatedRemote::from_env(env).and_then(|r| r.ok());
        self
    }

    /// Negotiated remote, if `ensure` has already succeeded.
    pub fn get(&self) -> Option<&NegotiatedRemote> {
        self.negotiated.get()
    }

    /// Probe the remote on first call; later calls return the cached result.
    pub async fn ensure(
        &self,
        host: &str,
        toolkit: &Toolkit,
        cancel: &CancellationToken,
    ) -> Result<&NegotiatedRemote> {
        self.negotiated
            .get_or_try_init(|| async {
                if let Some(inherited) = &self.inherited {
                    debug!(version = %inherited.raw_version, "Using inherited remote version");
                    return Ok(inherited.clone());
                }
                self.probe(host, toolkit, cancel).await
            })
            .await
    }

    async fn probe(
        &self,
        host: &str,
        toolkit: &Toolkit,
        cancel: &CancellationToken,
    ) -> Result<NegotiatedRemote> {
        let output = match toolkit.capture(HOST_CHECK, [host], cancel).await {
            Ok(output) => output,
            Err(BackupError::Io(e)) => {
                return Err(BackupError::RemoteProbe(format!("cannot run {HOST_CHECK}: {e}")))
            }
            Err(e) => return Err(e),
        };
        let report = String::from_utf8_lossy(&output.stdout);
        for line in report.lines() {
            debug!("{}", line);
        }
        if !output.status.success() {
            return Err(BackupError::RemoteProbe(format!(
                "{HOST_CHECK} {host} exited with {}",
                output.status
            )));
        }

        let (effective_host, raw_version) = parse_host_check(&report).ok_or_else(|| {
            BackupError::RemoteProbe(format!("unrecognized {HOST_CHECK} report for {host}"))
        })?;
        let remote = NegotiatedRemote::new(effective_host, raw_version, &self.remote_root)
            .map_err(|e| BackupError::RemoteProbe(e.to_string()))?;

        info!(host = %remote.host, version = %remote.version, "Connected to remote appliance");
        Ok(remote)
    }
}
