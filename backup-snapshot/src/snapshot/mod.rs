//! Snapshot identity, locking and lifecycle.
//!
//! Layout of a data directory:
//!
//! ```text
//! <data>/<timestamp>/     one snapshot; holds `incomplete` until promoted
//! <data>/current          symlink to the latest complete snapshot
//! <data>/in-progress      lock record "<timestamp> <pid>"
//! ```

pub mod lifecycle;
pub mod lock;

use chrono::{DateTime, NaiveDateTime, TimeZone};
use std::fmt;

pub use lifecycle::{Snapshot, SnapshotLifecycle, SnapshotState};
pub use lock::{LockGuard, LockManager};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Second-granularity timestamp naming a snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn now() -> Self {
        Self::at(&chrono::Local::now())
    }

    pub fn at<Tz: TimeZone>(time: &DateTime<Tz>) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self(time.format(TIMESTAMP_FORMAT).to_string())
    }

    /// Accepts only well-formed timestamps.
    pub fn parse(value: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
            .ok()
            .map(|_| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
