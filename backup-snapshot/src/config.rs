//! Configuration bootstrap.
//!
//! The configuration file is a flat list of shell-style `GHE_KEY=value`
//! assignments. The first file found among an ordered list of candidates
//! wins; its values are layered over the process environment with the
//! `config` crate, except `GHE_HOSTNAME`, where the environment wins.

use crate::utils::errors::{BackupError, Result};
use crate::utils::logger::VerboseChannel;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "backup.config";

/// Present only on the appliance itself.
const APPLIANCE_SENTINEL: &str = "etc/github/enterprise-release";

const DEFAULT_NUM_SNAPSHOTS: u32 = 10;
const DEFAULT_COOLDOWN_SECS: u64 = 600;

/// Where a configuration candidate comes from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    Explicit,
    InstallRoot,
    UserHome,
    System,
}

impl fmt::Display for CandidateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CandidateOrigin::Explicit => "GHE_BACKUP_CONFIG",
            CandidateOrigin::InstallRoot => "install root",
            CandidateOrigin::UserHome => "user home",
            CandidateOrigin::System => "system",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigCandidate {
    pub origin: CandidateOrigin,
    pub path: PathBuf,
}

/// Settings as read from the environment and the config file, before
/// validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    hostname: Option<String>,
    data_dir: Option<String>,
    num_snapshots: Option<String>,
    verbose: Option<String>,
    verbose_log: Option<String>,
    debug: Option<String>,
    backup_strategy: Option<String>,
    skip_pages: Option<String>,
    backup_fsck: Option<String>,
    allow_replica_backup: Option<String>,
    create_data_dir: Option<String>,
    fs_root: Option<String>,
    remote_root_dir: Option<String>,
    cooldown_period: Option<String>,
    verbose_ssh: Option<String>,
    extra_ssh_opts: Option<String>,
    pruning_scheduled: Option<String>,
}

/// Key/value assignments parsed from the chosen config file.
#[derive(Debug, Clone)]
struct AssignmentFile {
    origin: String,
    entries: Vec<(String, String)>,
}

impl AssignmentFile {
    fn read(path: &Path) -> Result<Self> {
        let iter = dotenvy::from_path_iter(path).map_err(|e| {
            BackupError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                BackupError::Config(format!("Invalid assignment in {}: {}", path.display(), e))
            })?;
            entries.push((key, value));
        }
        Ok(Self {
            origin: path.display().to_string(),
            entries,
        })
    }
}

impl config::Source for AssignmentFile {
    fn clone_into_box(&self) -> Box<dyn config::Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> std::result::Result<config::Map<String, config::Value>, config::ConfigError> {
        let mut map = config::Map::new();
        for (key, value) in &self.entries {
            if let Some(name) = key.strip_prefix("GHE_") {
                map.insert(
                    name.to_lowercase(),
                    config::Value::new(Some(&self.origin), value.clone()),
                );
            }
        }
        Ok(map)
    }
}

/// Immutable configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Config file the values were loaded from.
    pub source: PathBuf,
    pub install_root: PathBuf,
    pub hostname: String,
    /// Absolute data-store root.
    pub data_dir: PathBuf,
    pub data_dir_created: bool,
    pub num_snapshots: u32,
    pub verbose: bool,
    pub verbose_log: Option<PathBuf>,
    pub debug: bool,
    pub backup_strategy: Option<String>,
    pub skip_pages: bool,
    pub run_fsck: bool,
    pub allow_replica: bool,
    pub fs_root: PathBuf,
    pub remote_root_dir: String,
    pub cooldown: Duration,
    pub verbose_ssh: bool,
    pub extra_ssh_opts: Option<String>,
    pub pruning_scheduled: bool,
}

impl Configuration {
    pub fn verbose_channel(&self) -> VerboseChannel {
        VerboseChannel::new(self.verbose, self.verbose_log.as_deref())
    }

    /// Console log level implied by the debug flag.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    /// Environment handed to every collaborator process.
    pub fn collaborator_env(&self) -> Vec<(String, String)> {
        let yes_no = |b: bool| if b { "yes" } else { "no" }.to_string();
        let mut env = vec![
            ("GHE_BACKUP_CONFIG".to_string(), self.source.display().to_string()),
            ("GHE_BACKUP_ROOT".to_string(), self.install_root.display().to_string()),
            ("GHE_HOSTNAME".to_string(), self.hostname.clone()),
            ("GHE_DATA_DIR".to_string(), self.data_dir.display().to_string()),
            ("GHE_NUM_SNAPSHOTS".to_string(), self.num_snapshots.to_string()),
            ("GHE_SKIP_PAGES".to_string(), yes_no(self.skip_pages)),
            ("GHE_BACKUP_FSCK".to_string(), yes_no(self.run_fsck)),
            ("GHE_ALLOW_REPLICA_BACKUP".to_string(), yes_no(self.allow_replica)),
            ("GHE_REMOTE_ROOT_DIR".to_string(), self.remote_root_dir.clone()),
            ("GHE_COOLDOWN_PERIOD".to_string(), self.cooldown.as_secs().to_string()),
            ("GHE_PRUNING_SCHEDULED".to_string(), yes_no(self.pruning_scheduled)),
        ];
        if self.verbose {
            env.push(("GHE_VERBOSE".to_string(), "true".to_string()));
        }
        if let Some(log) = &self.verbose_log {
            env.push(("GHE_VERBOSE_LOG".to_string(), log.display().to_string()));
        }
        if self.debug {
            env.push(("GHE_DEBUG".to_string(), "true".to_string()));
        }
        if self.verbose_ssh {
            env.push(("GHE_VERBOSE_SSH".to_string(), "true".to_string()));
        }
        if let Some(opts) = &self.extra_ssh_opts {
            env.push(("GHE_EXTRA_SSH_OPTS".to_string(), opts.clone()));
        }
        env
    }
}

/// Resolves, loads and validates the configuration.
pub struct ConfigBootstrap {
    env: HashMap<String, String>,
    install_root: PathBuf,
    home: Option<PathBuf>,
    force_verbose: bool,
}

impl ConfigBootstrap {
    /// Bootstrap from the current process environment.
    pub fn from_process() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        let install_root = install_root(&env);
        Self::new(env, install_root)
    }

    pub fn new(env: HashMap<String, String>, install_root: PathBuf) -> Self {
        let home = env
            .get("HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .or_else(dirs::home_dir);
        Self {
            env,
            install_root,
            home,
            force_verbose: false,
        }
    }

    /// Force verbose output regardless of configuration (`-v`).
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.force_verbose = verbose;
        self
    }

    fn env_value(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn fs_root(&self) -> PathBuf {
        PathBuf::from(self.env_value("GHE_FS_ROOT").unwrap_or("/"))
    }

    /// Candidate config files in priority order.
    pub fn candidates(&self) -> Vec<ConfigCandidate> {
        let mut candidates = Vec::with_capacity(4);
        if let Some(explicit) = self.env_value("GHE_BACKUP_CONFIG") {
            candidates.push(ConfigCandidate {
                origin: CandidateOrigin::Explicit,
                path: PathBuf::from(explicit),
            });
        }
        candidates.push(ConfigCandidate {
            origin: CandidateOrigin::InstallRoot,
            path: self.install_root.join(CONFIG_FILE_NAME),
        });
        if let Some(home) = &self.home {
            candidates.push(ConfigCandidate {
                origin: CandidateOrigin::UserHome,
                path: home.join(".github-backup-utils").join(CONFIG_FILE_NAME),
            });
        }
        candidates.push(ConfigCandidate {
            origin: CandidateOrigin::System,
            path: self
                .fs_root()
                .join("etc/github-backup-utils")
                .join(CONFIG_FILE_NAME),
        });
        candidates
    }

    /// First existing candidate, or a `Config` error listing every path tried.
    pub fn resolve(&self) -> Result<ConfigCandidate> {
        let candidates = self.candidates();
        if let Some(found) = candidates.iter().find(|c| c.path.is_file()) {
            return Ok(found.clone());
        }
        let tried: Vec<String> = candidates
            .iter()
            .map(|c| format!(" - {}", c.path.display()))
            .collect();
        Err(BackupError::Config(format!(
            "No backup configuration file found. Tried:\n{}",
            tried.join("\n")
        )))
    }

    fn merge(&self, file: AssignmentFile) -> Result<RawSettings> {
        let env_source: config::Map<String, String> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let origin = file.origin.clone();
        config::Config::builder()
            .add_source(config::Environment::with_prefix("GHE").source(Some(env_source)))
            .add_source(file)
            .set_override_option("hostname", self.env_value("GHE_HOSTNAME").map(str::to_string))
            .and_then(|builder| builder.build())
            .and_then(|merged| merged.try_deserialize::<RawSettings>())
            .map_err(|e| BackupError::Config(format!("Invalid configuration in {}: {}", origin, e)))
    }

    /// Load and validate the configuration, then check the local
    /// environment and make sure the data directory exists.
    pub fn load(&self) -> Result<Configuration> {
        let candidate = self.resolve()?;
        let raw = self.merge(AssignmentFile::read(&candidate.path)?)?;
        let create = non_empty(raw.create_data_dir.clone()).map_or(true, |v| is_yes(&v));
        let mut config = self.validate(candidate.path, raw)?;
        check_not_on_appliance(&config.fs_root)?;
        config.data_dir_created = ensure_data_dir(&config.data_dir, create)?;
        Ok(config)
    }

    fn validate(&self, source: PathBuf, raw: RawSettings) -> Result<Configuration> {
        let hostname = non_empty(raw.hostname)
            .ok_or_else(|| BackupError::Config("GHE_HOSTNAME not set in config file.".into()))?;
        let data_dir = non_empty(raw.data_dir)
            .ok_or_else(|| BackupError::Config("GHE_DATA_DIR not set in config file.".into()))?;

        let num_snapshots = match non_empty(raw.num_snapshots) {
            Some(v) => v.trim().parse().map_err(|_| {
                BackupError::Config(format!("GHE_NUM_SNAPSHOTS must be a non-negative integer, got '{v}'"))
            })?,
            None => DEFAULT_NUM_SNAPSHOTS,
        };
        let cooldown_secs = match non_empty(raw.cooldown_period) {
            Some(v) => v.trim().parse().map_err(|_| {
                BackupError::Config(format!("GHE_COOLDOWN_PERIOD must be a number of seconds, got '{v}'"))
            })?,
            None => DEFAULT_COOLDOWN_SECS,
        };

        Ok(Configuration {
            source,
            data_dir: absolute_data_dir(&self.install_root, Path::new(&data_dir)),
            install_root: self.install_root.clone(),
            hostname,
            data_dir_created: false,
            num_snapshots,
            verbose: self.force_verbose || raw.verbose.as_deref().is_some_and(|v| !v.is_empty()),
            verbose_log: non_empty(raw.verbose_log).map(PathBuf::from),
            debug: raw.debug.as_deref().is_some_and(is_yes),
            backup_strategy: non_empty(raw.backup_strategy),
            skip_pages: raw.skip_pages.as_deref().is_some_and(is_yes),
            run_fsck: raw.backup_fsck.as_deref().is_some_and(is_yes),
            allow_replica: raw.allow_replica_backup.as_deref().is_some_and(is_yes),
            fs_root: non_empty(raw.fs_root).map_or_else(|| PathBuf::from("/"), PathBuf::from),
            remote_root_dir: raw.remote_root_dir.unwrap_or_default(),
            cooldown: Duration::from_secs(cooldown_secs),
            verbose_ssh: raw.verbose_ssh.as_deref().is_some_and(is_yes),
            extra_ssh_opts: non_empty(raw.extra_ssh_opts),
            pruning_scheduled: raw.pruning_scheduled.as_deref().is_some_and(is_yes),
        })
    }
}

/// Installation root: `GHE_BACKUP_ROOT`, else the parent of the directory
/// holding the executable.
pub fn install_root(env: &HashMap<String, String>) -> PathBuf {
    if let Some(root) = env.get("GHE_BACKUP_ROOT").filter(|r| !r.is_empty()) {
        return PathBuf::from(root);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(Path::parent).map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn is_yes(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "true" | "1" | "on"
    )
}

/// Resolve relative paths against the install root and canonicalize when
/// the path exists.
fn absolute_data_dir(install_root: &Path, data_dir: &Path) -> PathBuf {
    let joined = if data_dir.is_absolute() {
        data_dir.to_path_buf()
    } else {
        install_root.join(data_dir)
    };
    joined
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexically(&joined))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn check_not_on_appliance(fs_root: &Path) -> Result<()> {
    if fs_root.join(APPLIANCE_SENTINEL).exists() {
        return Err(BackupError::Environment(
            "Backup Utils cannot be run on the GitHub Enterprise host.\n       \
             The backup utilities should be run on a host dedicated to\n       \
             long-term permanent storage and must have network connectivity\n       \
             with the GitHub Enterprise appliance."
                .into(),
        ));
    }
    Ok(())
}

/// Returns whether the directory was created by this call.
fn ensure_data_dir(data_dir: &Path, create: bool) -> Result<bool> {
    let mut created = false;
    if !data_dir.is_dir() && create {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            BackupError::Environment(format!(
                "Cannot create the backup data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;
        created = true;
    }
    if !data_dir.is_dir() {
        return Err(BackupError::DataDirMissing(data_dir.to_path_buf()));
    }
    Ok(created)
}
