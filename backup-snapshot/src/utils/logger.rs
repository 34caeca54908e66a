//! Logging configuration using tracing.
//!
//! Console output always goes to stdout/stderr. Verbose diagnostics go
//! through a [`VerboseChannel`], which is also handed to collaborator
//! processes so their progress output ends up in the same place.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Destination for verbose output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerboseChannel {
    Discard,
    Stdout,
    File(PathBuf),
}

impl VerboseChannel {
    pub fn new(verbose: bool, log_file: Option<&Path>) -> Self {
        match (verbose, log_file) {
            (false, _) => VerboseChannel::Discard,
            (true, Some(path)) => VerboseChannel::File(path.to_path_buf()),
            (true, None) => VerboseChannel::Stdout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, VerboseChannel::Discard)
    }

    fn open_log(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// A stdio handle for a child process's verbose output.
    pub fn stdio(&self) -> io::Result<Stdio> {
        Ok(match self {
            VerboseChannel::Discard => Stdio::null(),
            VerboseChannel::Stdout => Stdio::inherit(),
            VerboseChannel::File(path) => Stdio::from(Self::open_log(path)?),
        })
    }
}

/// Console level: the stdout channel is the console itself, so verbose
/// output there just lowers the console threshold.
fn console_level<'a>(level: &'a str, channel: &VerboseChannel) -> &'a str {
    match channel {
        VerboseChannel::Stdout => "debug",
        _ => level,
    }
}

/// Initialize logging with the specified console level and verbose channel.
pub fn init(level: &str, channel: &VerboseChannel) -> anyhow::Result<()> {
    let level = console_level(level, channel);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_writer(io::stderr.with_max_level(tracing::Level::WARN).or_else(io::stdout))
        .with_filter(filter);

    let verbose_file = match channel {
        VerboseChannel::File(path) => {
            let file = VerboseChannel::open_log(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        VerboseChannel::Discard | VerboseChannel::Stdout => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(verbose_file)
        .try_init()?;

    Ok(())
}
