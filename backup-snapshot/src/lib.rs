//! Snapshot orchestration engine for appliance backups.
//!
//! A run loads configuration, verifies the destination filesystem, takes
//! the data directory lock, negotiates the remote version, runs the export
//! steps into a fresh snapshot and promotes it to `current` when every step
//! succeeded.

pub mod config;
pub mod executor;
pub mod fs;
pub mod orchestrator;
pub mod process;
pub mod remote;
pub mod snapshot;
pub mod utils;

pub use config::{ConfigBootstrap, Configuration};
pub use orchestrator::{Orchestrator, RunReport};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
