//! Error types for the buildflow engine.
//!
//! The taxonomy follows the propagation policy of the engine: configuration
//! errors surface synchronously from `start_build`, stage execution errors are
//! contained and converted into graph state, rollback errors are recorded but
//! never escalated, and orphan process errors are logged by the cleanup path.

use crate::core::StageStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for buildflow operations.
#[derive(Debug, Error)]
pub enum BuildflowError {
    /// The stage definitions do not form a valid graph.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A graph transition was rejected.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// A credential operation failed.
    #[error("{0}")]
    Credential(#[from] CredentialError),

    /// A build with this identity is already registered.
    #[error("Build '{0}' is already running")]
    AlreadyRunning(String),

    /// No build with this identity is registered.
    #[error("Unknown build '{0}'")]
    UnknownBuild(String),

    /// The build has not reached a terminal status yet.
    #[error("Build '{0}' is still running")]
    StillRunning(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata about a configuration error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "CONFIG-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("summary".to_string(), serde_json::json!(self.summary));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        if !self.context.is_empty() {
            map.insert("context".to_string(), serde_json::json!(self.context));
        }
        map
    }
}

/// Errors raised while validating stage definitions into a graph.
///
/// These are fatal before any execution begins; no partial state is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The dependency relation contains a cycle.
    #[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
    CycleDetected {
        /// The stages forming the cycle, first stage repeated at the end.
        cycle_path: Vec<String>,
    },

    /// A stage depends on a name that is not in the graph.
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// The declaring stage.
        stage: String,
        /// The missing dependency.
        dependency: String,
    },

    /// Two stages share a name.
    #[error("Duplicate stage name '{name}'")]
    DuplicateStageName {
        /// The colliding name.
        name: String,
    },

    /// A stage lists itself as a dependency.
    #[error("Stage '{stage}' cannot depend on itself")]
    SelfDependency {
        /// The offending stage.
        stage: String,
    },

    /// The graph has no stages.
    #[error("Stage graph has no stages")]
    EmptyGraph,

    /// A scheduling limit is unusable (e.g. a concurrency limit of zero).
    #[error("Invalid limit '{name}': {reason}")]
    InvalidLimit {
        /// The limit name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A prompt signature is not a valid regular expression.
    #[error("Invalid prompt signature '{pattern}': {reason}")]
    InvalidSignature {
        /// The pattern.
        pattern: String,
        /// The regex compiler's message.
        reason: String,
    },
}

impl ConfigError {
    /// Creates a cycle error from a path.
    #[must_use]
    pub fn cycle(cycle_path: Vec<String>) -> Self {
        Self::CycleDetected { cycle_path }
    }

    /// Creates an unknown dependency error.
    #[must_use]
    pub fn unknown_dependency(stage: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::UnknownDependency {
            stage: stage.into(),
            dependency: dependency.into(),
        }
    }

    /// Creates a duplicate name error.
    #[must_use]
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::DuplicateStageName { name: name.into() }
    }

    /// Creates an invalid limit error.
    #[must_use]
    pub fn invalid_limit(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLimit {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Returns diagnostic info with a stable code and fix hint.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::CycleDetected { cycle_path } => ErrorInfo::new("CONFIG-CYCLE", self.to_string())
                .with_fix_hint("Remove one of the dependencies in the cycle to break it.")
                .with_context_entry("cycle", cycle_path.join(" -> ")),
            Self::UnknownDependency { stage, dependency } => {
                ErrorInfo::new("CONFIG-MISSING-DEP", self.to_string())
                    .with_fix_hint("Check the dependency list for typos in stage names.")
                    .with_context_entry("stage", stage)
                    .with_context_entry("dependency", dependency)
            }
            Self::DuplicateStageName { name } => ErrorInfo::new("CONFIG-DUPLICATE", self.to_string())
                .with_fix_hint("Stage names must be unique within a build.")
                .with_context_entry("stage", name),
            Self::SelfDependency { stage } => ErrorInfo::new("CONFIG-SELF-DEP", self.to_string())
                .with_context_entry("stage", stage),
            Self::EmptyGraph => ErrorInfo::new("CONFIG-EMPTY", self.to_string())
                .with_fix_hint("Add at least one stage before starting a build."),
            Self::InvalidLimit { name, .. } => ErrorInfo::new("CONFIG-LIMIT", self.to_string())
                .with_context_entry("limit", name),
            Self::InvalidSignature { pattern, .. } => {
                ErrorInfo::new("CONFIG-SIGNATURE", self.to_string())
                    .with_fix_hint("Prompt signatures use Rust regex syntax.")
                    .with_context_entry("pattern", pattern)
            }
        }
    }
}

/// A stage-local failure. Contained by the scheduler and converted into graph
/// state; never raised across the scheduler boundary.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageExecutionError {
    /// The command exited with a non-zero code (or was killed by a signal).
    #[error("Stage '{stage}' exited with {}", exit_code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")))]
    NonZeroExit {
        /// The stage name.
        stage: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// The child printed an interactive prompt and was terminated.
    #[error("Stage '{stage}' blocked on an interactive prompt: {signature}")]
    BlockedOnPrompt {
        /// The stage name.
        stage: String,
        /// The signature that matched.
        signature: String,
    },

    /// The wall-clock or idle timeout elapsed.
    #[error("Stage '{stage}' timed out after {seconds:.1}s")]
    Timeout {
        /// The stage name.
        stage: String,
        /// The elapsed time in seconds.
        seconds: f64,
    },

    /// The stage requires elevation but no credential was provided.
    #[error("Stage '{stage}' requires elevation but no credential was provided")]
    MissingElevation {
        /// The stage name.
        stage: String,
    },

    /// The stage was terminated because the build was cancelled.
    #[error("Stage '{stage}' was cancelled")]
    Cancelled {
        /// The stage name.
        stage: String,
    },

    /// The process could not be spawned.
    #[error("Stage '{stage}' could not be started: {reason}")]
    SpawnFailed {
        /// The stage name.
        stage: String,
        /// The OS error.
        reason: String,
    },

    /// The stage's declared cost can never fit the resource budget.
    #[error("Stage '{stage}' needs {required_mb} MB but the budget is {budget_mb} MB")]
    ExceedsResourceBudget {
        /// The stage name.
        stage: String,
        /// Declared memory cost.
        required_mb: u64,
        /// Total memory budget.
        budget_mb: u64,
    },
}

impl StageExecutionError {
    /// Returns the stage this error belongs to.
    #[must_use]
    pub fn stage(&self) -> &str {
        match self {
            Self::NonZeroExit { stage, .. }
            | Self::BlockedOnPrompt { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::MissingElevation { stage }
            | Self::Cancelled { stage }
            | Self::SpawnFailed { stage, .. }
            | Self::ExceedsResourceBudget { stage, .. } => stage,
        }
    }

    /// Returns a stable kind name for events and persistence.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::BlockedOnPrompt { .. } => "blocked_on_prompt",
            Self::Timeout { .. } => "timeout",
            Self::MissingElevation { .. } => "missing_elevation",
            Self::Cancelled { .. } => "cancelled",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::ExceedsResourceBudget { .. } => "exceeds_resource_budget",
        }
    }
}

/// A rollback command failed. Recorded in the rollback report, never escalated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Rollback of stage '{stage}' failed: {reason}")]
pub struct RollbackError {
    /// The stage whose rollback failed.
    pub stage: String,
    /// The exit code of the rollback command, if any.
    pub exit_code: Option<i32>,
    /// Description of the failure.
    pub reason: String,
}

impl RollbackError {
    /// Creates a new rollback error.
    #[must_use]
    pub fn new(stage: impl Into<String>, exit_code: Option<i32>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            exit_code,
            reason: reason.into(),
        }
    }
}

/// A process group outlived the stage that owned it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Process group {pgid} of build '{build_id}' outlived its owner")]
pub struct OrphanProcessError {
    /// The build the process belonged to.
    pub build_id: String,
    /// The surviving process group id.
    pub pgid: i32,
}

/// Errors from the credential broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// No credential was handed to the broker for this build.
    #[error("No elevation credential was provided for build '{build_id}'")]
    NotProvided {
        /// The build id.
        build_id: String,
    },
}

/// Errors from graph state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// No stage with the given name exists.
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    /// The requested transition is not allowed from the current status.
    #[error("Stage '{stage}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The stage name.
        stage: String,
        /// Current status.
        from: StageStatus,
        /// Requested status.
        to: StageStatus,
    },
}
