//! Build sessions and the manager that owns them.
//!
//! A [`BuildSession`] is the per-build state: its graph, status, cancellation
//! token and rollback report. The [`BuildManager`] is the only registry of
//! sessions and the entry point for launching, cancelling, querying and
//! archiving builds.

mod build;
mod manager;

pub use build::{BuildSession, BuildStatusReport, StageReport};
pub use manager::{BuildManager, BuildRequest};
