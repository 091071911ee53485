//! Per-build state.

use crate::cancellation::CancellationToken;
use crate::core::{BuildStatus, StageStatus, TerminationReason};
use crate::pipeline::{BuildOutcome, StageGraph};
use crate::rollback::RollbackReport;
use crate::utils::{now_utc, Timestamp};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// One stage in a status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Current status.
    pub status: StageStatus,
    /// Exit code, if it ran.
    pub exit_code: Option<i32>,
    /// How its process ended.
    pub termination: Option<TerminationReason>,
    /// Why it failed or was skipped.
    pub reason: Option<String>,
    /// Run time in seconds.
    pub duration_secs: Option<f64>,
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStatusReport {
    /// The build.
    pub build_id: String,
    /// Build status.
    pub status: BuildStatus,
    /// Stages that completed, including those later rolled back.
    pub completed_count: usize,
    /// Stages in the graph.
    pub total_count: usize,
    /// Per-stage detail in declaration order.
    pub stages: Vec<StageReport>,
    /// True once rollback and cleanup have finished.
    pub settled: bool,
    /// Fingerprint of the stage definitions.
    pub config_hash: String,
    /// When the build started.
    pub started_at: Timestamp,
    /// When the build settled.
    pub finished_at: Option<Timestamp>,
}

impl BuildStatusReport {
    /// Returns a stage's status.
    #[must_use]
    pub fn stage_status(&self, name: &str) -> Option<StageStatus> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.status)
    }
}

/// The live state of one build.
#[derive(Debug)]
pub struct BuildSession {
    build_id: String,
    graph: Arc<RwLock<StageGraph>>,
    status: RwLock<BuildStatus>,
    cancel: Arc<CancellationToken>,
    config_hash: String,
    started_at: Timestamp,
    finished_at: RwLock<Option<Timestamp>>,
    outcome: RwLock<Option<BuildOutcome>>,
    rollback: RwLock<Option<RollbackReport>>,
    settled: watch::Sender<bool>,
}

impl BuildSession {
    /// Creates a Running session over a loaded graph.
    #[must_use]
    pub fn new(build_id: impl Into<String>, graph: StageGraph, config_hash: impl Into<String>) -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            build_id: build_id.into(),
            graph: Arc::new(RwLock::new(graph)),
            status: RwLock::new(BuildStatus::Running),
            cancel: Arc::new(CancellationToken::new()),
            config_hash: config_hash.into(),
            started_at: now_utc(),
            finished_at: RwLock::new(None),
            outcome: RwLock::new(None),
            rollback: RwLock::new(None),
            settled,
        }
    }

    /// The build id.
    #[must_use]
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// The shared graph.
    #[must_use]
    pub fn graph(&self) -> &Arc<RwLock<StageGraph>> {
        &self.graph
    }

    /// The build's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Current build status.
    #[must_use]
    pub fn status(&self) -> BuildStatus {
        *self.status.read()
    }

    /// Fingerprint of the stage definitions.
    #[must_use]
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// True once rollback and cleanup have finished.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }

    /// Marks the build Cancelled and fires the token.
    ///
    /// Returns false if the build had already reached a terminal status.
    pub fn request_cancel(&self, reason: &str) -> bool {
        let mut status = self.status.write();
        if status.is_terminal() {
            return false;
        }
        *status = BuildStatus::Cancelled;
        drop(status);
        self.cancel.cancel(reason);
        true
    }

    /// Moves a Running build to `terminal`. Returns the status in effect
    /// afterwards, which is Cancelled if a cancel won the race.
    pub fn finish(&self, terminal: BuildStatus) -> BuildStatus {
        let mut status = self.status.write();
        if *status == BuildStatus::Running {
            *status = terminal;
        }
        *status
    }

    /// Records the scheduler's outcome.
    pub fn set_outcome(&self, outcome: BuildOutcome) {
        *self.outcome.write() = Some(outcome);
    }

    /// The scheduler's outcome, once known.
    #[must_use]
    pub fn outcome(&self) -> Option<BuildOutcome> {
        self.outcome.read().clone()
    }

    /// Records the rollback report.
    pub fn set_rollback_report(&self, report: RollbackReport) {
        *self.rollback.write() = Some(report);
    }

    /// The rollback report, if rollback ran.
    #[must_use]
    pub fn rollback_report(&self) -> Option<RollbackReport> {
        self.rollback.read().clone()
    }

    /// Marks rollback and cleanup finished and wakes waiters.
    pub fn mark_settled(&self) {
        *self.finished_at.write() = Some(now_utc());
        self.settled.send_replace(true);
    }

    /// Completes once the session has settled.
    pub async fn settled(&self) {
        let mut rx = self.settled.subscribe();
        // The sender lives as long as the session, so this only returns on settle.
        let _ = rx.wait_for(|settled| *settled).await;
    }

    /// Builds a status snapshot.
    #[must_use]
    pub fn report(&self) -> BuildStatusReport {
        let graph = self.graph.read();
        let counts = graph.counts();
        let stages = graph
            .instances()
            .map(|i| StageReport {
                name: i.name().to_string(),
                status: i.status,
                exit_code: i.exit_code,
                termination: i.termination,
                reason: i.reason.clone(),
                duration_secs: i.duration_secs(),
            })
            .collect();

        BuildStatusReport {
            build_id: self.build_id.clone(),
            status: self.status(),
            completed_count: counts.completed + counts.rolled_back,
            total_count: graph.len(),
            stages,
            settled: self.is_settled(),
            config_hash: self.config_hash.clone(),
            started_at: self.started_at,
            finished_at: *self.finished_at.read(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::diamond;

    fn session() -> BuildSession {
        BuildSession::new("lfs-1", StageGraph::load(diamond()).unwrap(), "abc")
    }

    #[test]
    fn test_new_session_report() {
        let report = session().report();
        assert_eq!(report.status, BuildStatus::Running);
        assert_eq!(report.total_count, 4);
        assert_eq!(report.completed_count, 0);
        assert!(!report.settled);
        assert_eq!(report.stage_status("a"), Some(StageStatus::Pending));
    }

    #[test]
    fn test_cancel_is_idempotent_and_immediate() {
        let session = session();
        assert!(session.request_cancel("user"));
        assert_eq!(session.status(), BuildStatus::Cancelled);
        assert!(session.cancel_token().is_cancelled());
        assert!(!session.request_cancel("again"));
    }

    #[test]
    fn test_cancel_wins_over_finish() {
        let session = session();
        session.request_cancel("user");
        assert_eq!(session.finish(BuildStatus::Success), BuildStatus::Cancelled);
    }

    #[test]
    fn test_cancel_after_terminal_is_noop() {
        let session = session();
        assert_eq!(session.finish(BuildStatus::Failed), BuildStatus::Failed);
        assert!(!session.request_cancel("late"));
        assert!(!session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_settled_wakes_waiter() {
        let session = Arc::new(session());
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.settled().await })
        };
        session.mark_settled();
        waiter.await.unwrap();
        assert!(session.report().finished_at.is_some());
    }
}
