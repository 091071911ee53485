//! Build event records emitted to subscribers and persistence collaborators.

use super::{BuildStatus, StageStatus, TerminationReason};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A build session was created.
    #[serde(rename = "build.started")]
    BuildStarted,
    /// A build reached its terminal status and finished cleanup.
    #[serde(rename = "build.finished")]
    BuildFinished,
    /// Cancellation was requested for a build.
    #[serde(rename = "build.cancel_requested")]
    CancelRequested,
    /// A stage's dependencies all completed.
    #[serde(rename = "stage.ready")]
    StageReady,
    /// A stage's process was spawned.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// The supervisor forcibly terminated a stage's process.
    #[serde(rename = "stage.terminated")]
    StageTerminated,
    /// A stage completed successfully.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A stage failed.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A stage was skipped without running.
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    /// A rollback command started.
    #[serde(rename = "rollback.started")]
    RollbackStarted,
    /// A rollback command succeeded.
    #[serde(rename = "rollback.completed")]
    RollbackCompleted,
    /// A rollback command failed.
    #[serde(rename = "rollback.failed")]
    RollbackFailed,
    /// Lingering processes were terminated.
    #[serde(rename = "cleanup.performed")]
    CleanupPerformed,
}

impl EventKind {
    /// Returns the dotted event type name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildStarted => "build.started",
            Self::BuildFinished => "build.finished",
            Self::CancelRequested => "build.cancel_requested",
            Self::StageReady => "stage.ready",
            Self::StageStarted => "stage.started",
            Self::StageTerminated => "stage.terminated",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::StageSkipped => "stage.skipped",
            Self::RollbackStarted => "rollback.started",
            Self::RollbackCompleted => "rollback.completed",
            Self::RollbackFailed => "rollback.failed",
            Self::CleanupPerformed => "cleanup.performed",
        }
    }
}

/// One record of the event stream.
///
/// Delivery is at-least-once; `(build_id, sequence)` identifies a record so
/// consumers can drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    /// The build this event belongs to.
    pub build_id: String,
    /// Monotonic per-build sequence number, assigned by the event bus.
    #[serde(default)]
    pub sequence: u64,
    /// The event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The stage, for stage and rollback events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    /// The stage status after this event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StageStatus>,
    /// The build status, for build events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_status: Option<BuildStatus>,
    /// When the event occurred (ISO 8601).
    pub timestamp: String,
    /// Exit code of the stage or rollback process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Supervisor classification of how the process ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
    /// The last lines of output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
    /// Free-form detail (failure reason, skip cause, pid).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub detail: HashMap<String, serde_json::Value>,
}

impl BuildEvent {
    /// Creates a new event stamped with the current time.
    #[must_use]
    pub fn new(build_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            build_id: build_id.into(),
            sequence: 0,
            kind,
            stage_name: None,
            status: None,
            build_status: None,
            timestamp: crate::utils::iso_timestamp(),
            exit_code: None,
            termination: None,
            log_excerpt: None,
            detail: HashMap::new(),
        }
    }

    /// Creates a stage event carrying the stage's new status.
    #[must_use]
    pub fn stage(
        build_id: impl Into<String>,
        kind: EventKind,
        stage_name: impl Into<String>,
        status: StageStatus,
    ) -> Self {
        let mut event = Self::new(build_id, kind);
        event.stage_name = Some(stage_name.into());
        event.status = Some(status);
        event
    }

    /// Creates a build-level event.
    #[must_use]
    pub fn build(build_id: impl Into<String>, kind: EventKind, status: BuildStatus) -> Self {
        let mut event = Self::new(build_id, kind);
        event.build_status = Some(status);
        event
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Sets the termination reason.
    #[must_use]
    pub fn with_termination(mut self, reason: TerminationReason) -> Self {
        self.termination = Some(reason);
        self
    }

    /// Sets the log excerpt. Empty excerpts are dropped.
    #[must_use]
    pub fn with_log_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        let excerpt = excerpt.into();
        if !excerpt.is_empty() {
            self.log_excerpt = Some(excerpt);
        }
        self
    }

    /// Adds a detail field.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.detail.insert(key.into(), value);
        self
    }

    /// Returns the dotted event type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.kind.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_event() {
        let event = BuildEvent::stage("lfs-1", EventKind::StageStarted, "prepare_host", StageStatus::Running);
        assert_eq!(event.event_type(), "stage.started");
        assert_eq!(event.stage_name.as_deref(), Some("prepare_host"));
        assert_eq!(event.status, Some(StageStatus::Running));
        assert!(event.timestamp.contains('T'));
    }

    #[test]
    fn test_empty_excerpt_dropped() {
        let event = BuildEvent::new("lfs-1", EventKind::StageFailed).with_log_excerpt("");
        assert!(event.log_excerpt.is_none());
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = BuildEvent::stage("lfs-1", EventKind::StageFailed, "build_toolchain", StageStatus::Failed)
            .with_exit_code(Some(2))
            .with_termination(TerminationReason::Exited)
            .with_detail("error", serde_json::json!("make failed"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage.failed");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["exit_code"], 2);
        assert!(json.get("log_excerpt").is_none());

        let back: BuildEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
