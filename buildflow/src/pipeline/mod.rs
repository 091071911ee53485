//! Stage definitions, the stage graph and the scheduler.
//!
//! This module provides:
//! - Typed stage definitions and a JSON loader
//! - The default Linux From Scratch preset
//! - The validated stage graph and its state machine
//! - The scheduler that drives a graph to a settled state

mod definition;
mod graph;
mod loader;
mod presets;
mod scheduler;


pub use definition::{ResourceCost, StageDefinition};
pub use graph::{StageGraph, StageInstance, StatusCounts};
pub use loader::{definitions_from_json_file, definitions_from_json_str, definitions_to_json};
pub use presets::lfs_default;
pub use scheduler::{BuildOutcome, ResourceBudget, Scheduler, SchedulerLimits};
