//! Stage, build, and termination status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of one stage within one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for dependencies.
    #[default]
    Pending,
    /// All dependencies completed; waiting for capacity.
    Ready,
    /// The stage's process is running.
    Running,
    /// The stage exited successfully.
    Completed,
    /// The stage failed.
    Failed,
    /// The stage completed and was later undone by its rollback command.
    RolledBack,
    /// The stage never ran because a dependency failed or the build halted.
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageStatus {
    /// Returns true if the stage will not run (again) in this build.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::RolledBack | Self::Skipped
        )
    }

    /// Returns true if the stage has not started yet.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }

    /// Returns true if the stage's outcome propagates as Skipped to dependents.
    #[must_use]
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use StageStatus::{Completed, Failed, Pending, Ready, RolledBack, Running, Skipped};
        matches!(
            (self, next),
            (Pending, Ready | Running | Skipped | Failed)
                | (Ready, Running | Skipped | Failed)
                | (Running, Completed | Failed)
                | (Completed, RolledBack)
        )
    }
}

/// The overall status of a build session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Stages are still being scheduled.
    #[default]
    Running,
    /// Every stage completed.
    Success,
    /// At least one stage failed or was skipped.
    Failed,
    /// The build was cancelled by request.
    Cancelled,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl BuildStatus {
    /// Returns true for Success, Failed and Cancelled.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Why a supervised process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The process exited on its own.
    Exited,
    /// A blocking interactive prompt was detected in the output.
    BlockedOnPrompt,
    /// The wall-clock or idle timeout elapsed.
    Timeout,
    /// The build was cancelled while the process ran.
    Cancelled,
    /// Elevation was required but no credential was available; nothing spawned.
    MissingElevation,
    /// The process could not be spawned.
    SpawnFailed,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited => write!(f, "exited"),
            Self::BlockedOnPrompt => write!(f, "blocked_on_prompt"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::MissingElevation => write!(f, "missing_elevation"),
            Self::SpawnFailed => write!(f, "spawn_failed"),
        }
    }
}

impl TerminationReason {
    /// Returns true if the supervisor killed the process.
    #[must_use]
    pub fn was_forced(&self) -> bool {
        matches!(self, Self::BlockedOnPrompt | Self::Timeout | Self::Cancelled)
    }
}
