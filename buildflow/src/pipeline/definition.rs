//! Stage definitions as produced by the configuration loader.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Estimated resources a stage holds while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceCost {
    /// Memory charged against the build's memory budget, in megabytes.
    #[serde(default)]
    pub memory_mb: u64,
    /// CPU cores the stage may use; exported as `MAKEFLAGS=-j<n>` when above one.
    #[serde(default)]
    pub cpu_cores: u32,
}

impl ResourceCost {
    /// Creates a cost with only a memory estimate.
    #[must_use]
    pub fn memory(memory_mb: u64) -> Self {
        Self {
            memory_mb,
            cpu_cores: 0,
        }
    }

    /// Sets the CPU core count.
    #[must_use]
    pub fn with_cpu_cores(mut self, cpu_cores: u32) -> Self {
        self.cpu_cores = cpu_cores;
        self
    }
}

/// One stage of the build: an opaque command with declared dependencies.
///
/// Immutable once a build starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique name within the graph.
    pub name: String,
    /// Advisory sequence hint, used only to break ties between ready stages.
    #[serde(default)]
    pub order: i64,
    /// Shell command run via `sh -c`.
    pub command: String,
    /// Names of stages that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Shell command that undoes this stage, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_command: Option<String>,
    /// Whether the command must run with elevated privileges.
    #[serde(default)]
    pub requires_elevation: bool,
    /// Resource estimate for admission control.
    #[serde(default)]
    pub resources: ResourceCost,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory for the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Wall-clock timeout override, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StageDefinition {
    /// Creates a new stage definition with no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: 0,
            command: command.into(),
            dependencies: Vec::new(),
            rollback_command: None,
            requires_elevation: false,
            resources: ResourceCost::default(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout_secs: None,
        }
    }

    /// Sets the order hint.
    #[must_use]
    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Sets the rollback command.
    #[must_use]
    pub fn with_rollback(mut self, command: impl Into<String>) -> Self {
        self.rollback_command = Some(command.into());
        self
    }

    /// Marks the stage as requiring elevation.
    #[must_use]
    pub fn elevated(mut self) -> Self {
        self.requires_elevation = true;
        self
    }

    /// Sets the resource estimate.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceCost) -> Self {
        self.resources = resources;
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets the wall-clock timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Returns the per-stage timeout override.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Returns true if the stage declares a rollback command.
    #[must_use]
    pub fn has_rollback(&self) -> bool {
        self.rollback_command
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}
