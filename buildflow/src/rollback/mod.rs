//! Rollback and cleanup after a build that did not succeed.

mod engine;

pub use engine::{RollbackEngine, RollbackEntry, RollbackOutcome, RollbackReport};
