//! Collaborator processes and signal handling.

pub mod shutdown;
pub mod toolkit;

pub use toolkit::Toolkit;
