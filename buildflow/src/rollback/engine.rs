//! Reverse-order rollback of completed stages and forced process cleanup.

use crate::cancellation::CancellationToken;
use crate::core::{BuildEvent, EventKind, StageStatus};
use crate::credentials::CredentialBroker;
use crate::errors::RollbackError;
use crate::events::EventSink;
use crate::pipeline::StageGraph;
use crate::supervisor::{CleanupReport, ExecutionRequest, Invocation, ProcessSupervisor};
use crate::utils::{now_utc, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What happened to one stage during rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// The rollback command succeeded; the stage is RolledBack.
    RolledBack,
    /// The stage declares no rollback command; it stays Completed.
    NoCommand,
    /// The rollback command failed; the stage stays Completed.
    Failed,
}

/// One rollback attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEntry {
    /// The stage rolled back.
    pub stage: String,
    /// The outcome.
    pub outcome: RollbackOutcome,
    /// Exit code of the rollback command.
    pub exit_code: Option<i32>,
    /// The failure, when the outcome is Failed.
    pub error: Option<RollbackError>,
}

/// Result of rolling back one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// The build.
    pub build_id: String,
    /// One entry per Completed stage, in the order attempted.
    pub entries: Vec<RollbackEntry>,
    /// When rollback began.
    pub started_at: Timestamp,
    /// When rollback ended.
    pub finished_at: Timestamp,
}

impl RollbackReport {
    /// Returns the stages in the order rollback was attempted.
    #[must_use]
    pub fn order(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.stage.as_str()).collect()
    }

    /// Returns the rollback failures.
    #[must_use]
    pub fn failures(&self) -> Vec<&RollbackError> {
        self.entries.iter().filter_map(|e| e.error.as_ref()).collect()
    }

    /// Returns true if no rollback command failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.outcome != RollbackOutcome::Failed)
    }
}

/// Undoes completed stages and kills lingering processes.
pub struct RollbackEngine {
    supervisor: Arc<ProcessSupervisor>,
    broker: Arc<CredentialBroker>,
    events: Arc<dyn EventSink>,
    rollback_timeout: Duration,
}

impl RollbackEngine {
    /// Creates an engine whose rollback commands are bounded by `rollback_timeout`.
    #[must_use]
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        broker: Arc<CredentialBroker>,
        events: Arc<dyn EventSink>,
        rollback_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            broker,
            events,
            rollback_timeout,
        }
    }

    /// Rolls back every Completed stage in reverse topological order, one at
    /// a time. Each stage gets exactly one attempt; failures are recorded and
    /// never stop the remaining rollbacks.
    pub async fn rollback(&self, build_id: &str, graph: &Arc<RwLock<StageGraph>>) -> RollbackReport {
        let started_at = now_utc();
        let order = graph.read().rollback_order();
        info!(build_id = %build_id, stages = order.len(), "Starting rollback");

        // Rollback must run even when the build itself was cancelled.
        let cancel = CancellationToken::new();
        let mut entries = Vec::with_capacity(order.len());

        for stage in order {
            let Some(definition) = graph.read().get(&stage).map(|i| i.definition.clone()) else {
                continue;
            };
            let Some(command) = definition.rollback_command.clone().filter(|_| definition.has_rollback()) else {
                entries.push(RollbackEntry {
                    stage,
                    outcome: RollbackOutcome::NoCommand,
                    exit_code: None,
                    error: None,
                });
                continue;
            };

            self.events
                .emit(&BuildEvent::stage(build_id, EventKind::RollbackStarted, &stage, StageStatus::Completed))
                .await;

            let mut invocation = Invocation::for_command(&definition, &command);
            if definition.requires_elevation {
                match self.broker.acquire(build_id) {
                    Ok(credential) => {
                        invocation = self.broker.inject(
                            invocation,
                            &credential,
                            &self.supervisor.config().non_interactive_env,
                        );
                    }
                    Err(e) => {
                        let error = RollbackError::new(&stage, None, e.to_string());
                        entries.push(self.record_failure(build_id, &stage, error, "").await);
                        continue;
                    }
                }
            }

            let request = ExecutionRequest::new(build_id, &stage, invocation)
                .with_timeout(Some(self.rollback_timeout))
                .with_log_name(format!("{stage}.rollback.log"))
                .quiet();
            let result = self.supervisor.execute(request, &cancel).await;

            if result.is_success() {
                if let Err(e) = graph.write().mark(&stage, StageStatus::RolledBack) {
                    warn!(build_id = %build_id, stage = %stage, error = %e, "Could not mark stage rolled back");
                }
                info!(build_id = %build_id, stage = %stage, "Stage rolled back");
                self.events
                    .emit(
                        &BuildEvent::stage(build_id, EventKind::RollbackCompleted, &stage, StageStatus::RolledBack)
                            .with_exit_code(result.exit_code),
                    )
                    .await;
                entries.push(RollbackEntry {
                    stage,
                    outcome: RollbackOutcome::RolledBack,
                    exit_code: result.exit_code,
                    error: None,
                });
            } else {
                let reason = result
                    .error(&stage)
                    .map_or_else(|| "rollback failed".to_string(), |e| e.to_string());
                let error = RollbackError::new(&stage, result.exit_code, reason);
                entries.push(
                    self.record_failure(build_id, &stage, error, result.log_excerpt())
                        .await,
                );
            }
        }

        let report = RollbackReport {
            build_id: build_id.to_string(),
            entries,
            started_at,
            finished_at: now_utc(),
        };
        info!(
            build_id = %build_id,
            attempted = report.entries.len(),
            failed = report.failures().len(),
            "Rollback finished"
        );
        report
    }

    /// Terminates every process group still registered to the build.
    /// Idempotent.
    pub async fn force_cleanup(&self, build_id: &str) -> CleanupReport {
        let report = self.supervisor.registry().terminate_build(build_id).await;
        if !report.is_empty() {
            self.events
                .emit(
                    &BuildEvent::new(build_id, EventKind::CleanupPerformed)
                        .with_detail("terminated", serde_json::json!(report.terminated))
                        .with_detail("killed", serde_json::json!(report.killed)),
                )
                .await;
        }
        report
    }

    async fn record_failure(
        &self,
        build_id: &str,
        stage: &str,
        error: RollbackError,
        excerpt: &str,
    ) -> RollbackEntry {
        warn!(build_id = %build_id, stage = %stage, error = %error, "Rollback failed");
        self.events
            .emit(
                &BuildEvent::stage(build_id, EventKind::RollbackFailed, stage, StageStatus::Completed)
                    .with_exit_code(error.exit_code)
                    .with_log_excerpt(excerpt)
                    .with_detail("error", serde_json::json!(error.reason)),
            )
            .await;
        RollbackEntry {
            stage: stage.to_string(),
            outcome: RollbackOutcome::Failed,
            exit_code: error.exit_code,
            error: Some(error),
        }
    }
}

impl std::fmt::Debug for RollbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackEngine")
            .field("rollback_timeout", &self.rollback_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::StageDefinition;
    use crate::supervisor::{ProcessRegistry, PromptDetector, SupervisorConfig};
    use pretty_assertions::assert_eq;

    fn engine(sink: Arc<CollectingEventSink>) -> RollbackEngine {
        let supervisor = Arc::new(ProcessSupervisor::new(
            SupervisorConfig {
                kill_grace: Duration::from_millis(200),
                ..SupervisorConfig::default()
            },
            PromptDetector::default(),
            Arc::new(ProcessRegistry::new(Duration::from_millis(200))),
            sink.clone(),
        ));
        RollbackEngine::new(supervisor, Arc::new(CredentialBroker::new()), sink, Duration::from_secs(5))
    }

    fn completed_graph(definitions: Vec<StageDefinition>) -> Arc<RwLock<StageGraph>> {
        let mut graph = StageGraph::load(definitions).unwrap();
        for name in graph
            .topological_order()
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
        {
            graph.mark(&name, StageStatus::Running).unwrap();
            graph.mark(&name, StageStatus::Completed).unwrap();
        }
        Arc::new(RwLock::new(graph))
    }

    #[tokio::test]
    async fn test_rollback_reverse_order_with_mixed_outcomes() {
        let sink = Arc::new(CollectingEventSink::new());
        let engine = engine(sink.clone());
        let graph = completed_graph(vec![
            StageDefinition::new("a", "true").with_rollback("true"),
            StageDefinition::new("b", "true").with_dependency("a"),
            StageDefinition::new("c", "true").with_dependency("b").with_rollback("exit 7"),
        ]);

        let report = engine.rollback("lfs-1", &graph).await;

        assert_eq!(report.order(), vec!["c", "b", "a"]);
        assert_eq!(report.entries[0].outcome, RollbackOutcome::Failed);
        assert_eq!(report.entries[0].exit_code, Some(7));
        assert_eq!(report.entries[1].outcome, RollbackOutcome::NoCommand);
        assert_eq!(report.entries[2].outcome, RollbackOutcome::RolledBack);
        assert!(!report.is_clean());

        let graph = graph.read();
        assert_eq!(graph.status("a"), Some(StageStatus::RolledBack));
        assert_eq!(graph.status("b"), Some(StageStatus::Completed));
        assert_eq!(graph.status("c"), Some(StageStatus::Completed));
        assert_eq!(sink.events_of_type("rollback.failed").len(), 1);
        assert_eq!(sink.events_of_type("rollback.completed").len(), 1);
    }

    #[tokio::test]
    async fn test_elevated_rollback_without_credential_is_recorded() {
        let sink = Arc::new(CollectingEventSink::new());
        let engine = engine(sink);
        let graph = completed_graph(vec![StageDefinition::new("mount", "true")
            .with_rollback("umount /mnt/lfs")
            .elevated()]);

        let report = engine.rollback("lfs-1", &graph).await;
        assert_eq!(report.failures().len(), 1);
        assert_eq!(graph.read().status("mount"), Some(StageStatus::Completed));
    }

    #[tokio::test]
    async fn test_force_cleanup_with_nothing_registered() {
        let sink = Arc::new(CollectingEventSink::new());
        let engine = engine(sink.clone());
        assert!(engine.force_cleanup("lfs-1").await.is_empty());
        assert!(engine.force_cleanup("lfs-1").await.is_empty());
        assert!(sink.is_empty());
    }
}
