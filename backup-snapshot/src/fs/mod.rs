//! Destination filesystem operations.

pub mod capability;
pub mod copier;

pub use copier::{HardLinkCopier, RsyncCopier, TreeCopier};
