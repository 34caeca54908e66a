//! Remote appliance version handling.

pub mod negotiator;
pub mod version;

pub use negotiator::{NegotiatedRemote, VersionNegotiator};
pub use version::{DataLayout, PathFixup, RemoteVersion};
