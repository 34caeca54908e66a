//! Error types for the snapshot engine.
//!
//! Every fatal condition maps to one process exit code. Step failures are
//! not errors: they are recorded as failed outcomes and reported at the end.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Environment(String),

    #[error("GHE_DATA_DIR {} does not exist.", .0.display())]
    DataDirMissing(PathBuf),

    #[error("{0}")]
    LockConflict(String),

    #[error(
        "snapshot directory {} already exists; another backup started within the same second",
        .0.display()
    )]
    SnapshotCollision(PathBuf),

    #[error("could not establish the remote appliance version: {0}")]
    RemoteProbe(String),

    #[error("backup interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Config(_) => 2,
            BackupError::DataDirMissing(_) => 8,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(BackupError::Config("x".into()).exit_code(), 2);
        assert_eq!(BackupError::DataDirMissing(PathBuf::from("/d")).exit_code(), 8);
        assert_eq!(BackupError::LockConflict("x".into()).exit_code(), 1);
        assert_eq!(BackupError::Environment("x".into()).exit_code(), 1);
        assert_eq!(BackupError::RemoteProbe("x".into()).exit_code(), 1);
        assert_eq!(BackupError::Interrupted.exit_code(), 1);
    }

    #[test]
    fn test_data_dir_message_names_path() {
        let err = BackupError::DataDirMissing(PathBuf::from("/backups/data"));
        assert_eq!(err.to_string(), "GHE_DATA_DIR /backups/data does not exist.");
    }
}
