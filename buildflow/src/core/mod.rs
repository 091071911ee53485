//! Core domain model types for buildflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Stage, build, and termination status enums
//! - Build event records
//! - Output handles for captured stage logs

mod event;
mod output;
mod status;

pub use event::{BuildEvent, EventKind};
pub use output::OutputHandle;
pub use status::{BuildStatus, StageStatus, TerminationReason};
