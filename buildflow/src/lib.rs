//! # Buildflow
//!
//! An orchestration engine for long-running, multi-stage, privileged
//! operating-system bootstrap builds such as Linux From Scratch.
//!
//! Buildflow provides:
//!
//! - **Validated stage graphs**: typed definitions checked for cycles, unknown
//!   and duplicate stages before anything runs
//! - **Dependency-aware scheduling**: a concurrency limit and a memory budget,
//!   with failures skipping every dependent
//! - **Process supervision**: each stage in its own process group, with prompt
//!   detection, timeouts and orphan cleanup
//! - **Out-of-band elevation**: credentials delivered to elevated stages on
//!   stdin and erased when the build ends
//! - **Rollback**: completed stages undone in reverse dependency order on
//!   failure or cancellation
//! - **Events**: a sequenced event stream per build
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use buildflow::prelude::*;
//!
//! let manager = BuildManager::new(EngineConfig::default().with_env_overrides()?)?;
//! let build_id = manager
//!     .start_build(BuildRequest::new(lfs_default()).with_credential(secret))
//!     .await?;
//!
//! let report = manager.wait(&build_id).await?;
//! println!("{}: {}/{}", report.status, report.completed_count, report.total_count);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod credentials;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod rollback;
pub mod session;
pub mod supervisor;
pub mod utils;

#[cfg(test)]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::EngineConfig;
    pub use crate::core::{BuildEvent, BuildStatus, EventKind, StageStatus, TerminationReason};
    pub use crate::errors::{
        BuildflowError, ConfigError, CredentialError, GraphError, RollbackError,
        StageExecutionError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        definitions_from_json_file, definitions_from_json_str, lfs_default, ResourceCost,
        StageDefinition, StageGraph,
    };
    pub use crate::rollback::{RollbackOutcome, RollbackReport};
    pub use crate::session::{BuildManager, BuildRequest, BuildStatusReport};
    pub use secrecy::SecretString;
}
