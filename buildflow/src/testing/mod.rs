//! Testing utilities for buildflow.
//!
//! This module provides:
//! - Stage definition fixtures (chains, the diamond, random DAGs)
//! - A fast-cleanup engine configuration and manager
//! - Assertions over status reports and event streams

pub mod assertions;
pub mod fixtures;

pub use assertions::{
    assert_concurrency_within, assert_dependencies_completed_first, assert_precedes,
    assert_stage_status, assert_terminal_statuses, max_running,
};
pub use fixtures::{chain, diamond, random_dag, shell_stage, stage, test_config, test_manager};
