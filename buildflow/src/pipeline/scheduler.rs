//! The build scheduler.
//!
//! One control flow per build admits ready stages, spawns one task per
//! admitted stage and suspends on the set of in-flight tasks and the
//! cancellation token. Every completion updates the graph and may admit more
//! stages.

use super::graph::StageGraph;
use crate::cancellation::CancellationToken;
use crate::core::{BuildEvent, BuildStatus, EventKind, StageStatus, TerminationReason};
use crate::credentials::CredentialBroker;
use crate::errors::StageExecutionError;
use crate::events::EventSink;
use crate::supervisor::{ExecutionRequest, Invocation, ProcessSupervisor, StageResult};
use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Memory available to concurrently running stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    /// Total megabytes; `None` means unlimited.
    pub memory_mb: Option<u64>,
}

impl ResourceBudget {
    /// No memory limit.
    #[must_use]
    pub fn unlimited() -> Self {
        Self { memory_mb: None }
    }

    /// A memory limit in megabytes.
    #[must_use]
    pub fn memory(memory_mb: u64) -> Self {
        Self {
            memory_mb: Some(memory_mb),
        }
    }

    fn fits(&self, reserved: u64, cost: u64) -> bool {
        self.memory_mb
            .map_or(true, |budget| reserved.saturating_add(cost) <= budget)
    }
}

/// Per-build scheduling limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerLimits {
    /// Maximum stages running at once. At least one.
    pub concurrency_limit: usize,
    /// Memory budget.
    pub budget: ResourceBudget,
    /// Default wall-clock timeout for stages without their own.
    pub stage_timeout: Option<Duration>,
    /// Idle-output timeout.
    pub idle_timeout: Option<Duration>,
}

impl SchedulerLimits {
    /// Creates limits with no budget and no timeouts.
    #[must_use]
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit,
            budget: ResourceBudget::unlimited(),
            stage_timeout: None,
            idle_timeout: None,
        }
    }

    /// Sets the memory budget.
    #[must_use]
    pub fn with_budget(mut self, budget: ResourceBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Sets the default stage timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Result of scheduling a whole graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildOutcome {
    /// Success iff every stage completed.
    pub status: BuildStatus,
    /// Stages that completed.
    pub completed: usize,
    /// Stages in the graph.
    pub total: usize,
    /// Stage failures in the order observed.
    pub failures: Vec<StageExecutionError>,
    /// Stages that never ran.
    pub skipped: Vec<String>,
}

impl BuildOutcome {
    /// Returns true if the build succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }
}

struct StageCompletion {
    name: String,
    cost: u64,
    result: StageResult,
}

enum Admission {
    Deferred,
    Refused(StageExecutionError, TerminationReason),
}

/// Drives one build's graph to a settled state.
pub struct Scheduler {
    supervisor: Arc<ProcessSupervisor>,
    broker: Arc<CredentialBroker>,
    events: Arc<dyn EventSink>,
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        broker: Arc<CredentialBroker>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            supervisor,
            broker,
            events,
        }
    }

    /// Runs the graph until no stage is Pending, Ready or Running.
    pub async fn run(
        &self,
        build_id: &str,
        graph: &Arc<RwLock<StageGraph>>,
        limits: SchedulerLimits,
        cancel: &Arc<CancellationToken>,
    ) -> BuildOutcome {
        let limit = limits.concurrency_limit.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut reserved_mb: u64 = 0;
        let mut halted = false;
        let mut failures = Vec::new();
        let mut skipped = Vec::new();

        info!(
            build_id = %build_id,
            stages = graph.read().len(),
            concurrency_limit = limit,
            memory_budget_mb = ?limits.budget.memory_mb,
            "Scheduling build"
        );

        loop {
            if !halted && !cancel.is_cancelled() {
                self.emit_ready(build_id, graph).await;

                let ready = graph.read().ready_set();
                for name in ready {
                    if in_flight.len() >= limit {
                        break;
                    }
                    match self.admit(build_id, graph, &name, limits, reserved_mb) {
                        Ok((cost, request)) => {
                            reserved_mb += cost;
                            in_flight.push(spawn_stage(
                                Arc::clone(&self.supervisor),
                                request,
                                Arc::clone(cancel),
                                cost,
                            ));
                        }
                        Err(Admission::Deferred) => {}
                        Err(Admission::Refused(error, termination)) => {
                            self.fail_unstarted(build_id, graph, &name, &error, termination, &mut skipped)
                                .await;
                            failures.push(error);
                            halted = true;
                            break;
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                if halted || cancel.is_cancelled() {
                    let reason = if cancel.is_cancelled() {
                        "build cancelled"
                    } else {
                        "build halted after a stage failure"
                    };
                    let names = graph.write().skip_remaining(reason);
                    self.emit_skipped(build_id, &names, reason).await;
                    skipped.extend(names);
                    break;
                }

                let ready = graph.read().ready_set();
                let Some(first) = ready.first() else {
                    break;
                };
                // Nothing runs and nothing fits: the stage can never be admitted.
                let error = self.budget_error(graph, first, limits.budget);
                self.fail_unstarted(build_id, graph, first, &error, TerminationReason::SpawnFailed, &mut skipped)
                    .await;
                failures.push(error);
                halted = true;
                continue;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled(), if !halted => {
                    info!(build_id = %build_id, in_flight = in_flight.len(), "Cancellation observed; draining");
                    halted = true;
                }
                Some(completion) = in_flight.next() => {
                    let StageCompletion { name, cost, result } = completion;
                    reserved_mb = reserved_mb.saturating_sub(cost);
                    if let Some(error) = self.complete(build_id, graph, &name, result, &mut skipped).await {
                        failures.push(error);
                        halted = true;
                    }
                }
            }
        }

        let (status, completed, total) = {
            let graph = graph.read();
            let status = if cancel.is_cancelled() {
                BuildStatus::Cancelled
            } else if graph.all_completed() {
                BuildStatus::Success
            } else {
                BuildStatus::Failed
            };
            (status, graph.counts().completed, graph.len())
        };

        info!(
            build_id = %build_id,
            status = %status,
            completed,
            total,
            failures = failures.len(),
            "Build settled"
        );

        BuildOutcome {
            status,
            completed,
            total,
            failures,
            skipped,
        }
    }

    /// Tries to start one ready stage.
    fn admit(
        &self,
        build_id: &str,
        graph: &Arc<RwLock<StageGraph>>,
        name: &str,
        limits: SchedulerLimits,
        reserved_mb: u64,
    ) -> Result<(u64, ExecutionRequest), Admission> {
        let Some(definition) = graph.read().get(name).map(|i| i.definition.clone()) else {
            return Err(Admission::Deferred);
        };

        let cost = definition.resources.memory_mb;
        if !limits.budget.fits(reserved_mb, cost) {
            debug!(build_id = %build_id, stage = %name, cost, reserved_mb, "Stage deferred by memory budget");
            return Err(Admission::Deferred);
        }

        let mut invocation = Invocation::for_stage(&definition);
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
                    warn!(build_id = %build_id, stage = %name, error = %e, "Elevation unavailable");
                    return Err(Admission::Refused(
                        StageExecutionError::MissingElevation {
                            stage: name.to_string(),
                        },
                        TerminationReason::MissingElevation,
                    ));
                }
            }
        }

        if let Err(e) = graph.write().mark(name, StageStatus::Running) {
            warn!(build_id = %build_id, stage = %name, error = %e, "Stage not admitted");
            return Err(Admission::Deferred);
        }

        let request = ExecutionRequest::new(build_id, name, invocation)
            .with_timeout(definition.timeout().or(limits.stage_timeout))
            .with_idle_timeout(limits.idle_timeout);
        Ok((cost, request))
    }

    /// Applies a finished stage to the graph. Returns the failure, if any.
    async fn complete(
        &self,
        build_id: &str,
        graph: &Arc<RwLock<StageGraph>>,
        name: &str,
        result: StageResult,
        skipped: &mut Vec<String>,
    ) -> Option<StageExecutionError> {
        let error = result.error(name);
        let newly_skipped = {
            let mut graph = graph.write();
            if let Err(e) = graph.record_execution(
                name,
                result.exit_code,
                result.terminated_reason,
                result.output.clone(),
            ) {
                warn!(build_id = %build_id, stage = %name, error = %e, "Could not record stage result");
            }
            let marked = match &error {
                None => graph.mark(name, StageStatus::Completed),
                Some(error) => graph.mark_failed(name, error.to_string()),
            };
            marked.unwrap_or_else(|e| {
                warn!(build_id = %build_id, stage = %name, error = %e, "Invalid stage transition");
                Vec::new()
            })
        };

        let event = match &error {
            None => {
                info!(build_id = %build_id, stage = %name, duration_ms = result.duration.as_millis() as u64, "Stage completed");
                BuildEvent::stage(build_id, EventKind::StageCompleted, name, StageStatus::Completed)
            }
            Some(error) => {
                warn!(build_id = %build_id, stage = %name, error = %error, "Stage failed");
                BuildEvent::stage(build_id, EventKind::StageFailed, name, StageStatus::Failed)
                    .with_termination(result.terminated_reason)
                    .with_detail("error", serde_json::json!(error.to_string()))
                    .with_detail("kind", serde_json::json!(error.kind()))
            }
        };
        self.events
            .emit(
                &event
                    .with_exit_code(result.exit_code)
                    .with_log_excerpt(result.log_excerpt()),
            )
            .await;

        let cause = format!("dependency '{name}' failed");
        self.emit_skipped(build_id, &newly_skipped, &cause).await;
        skipped.extend(newly_skipped);
        error
    }

    /// Fails a stage that never spawned and skips its dependents.
    async fn fail_unstarted(
        &self,
        build_id: &str,
        graph: &Arc<RwLock<StageGraph>>,
        name: &str,
        error: &StageExecutionError,
        termination: TerminationReason,
        skipped: &mut Vec<String>,
    ) {
        let newly_skipped = {
            let mut graph = graph.write();
            let newly = graph.mark_failed(name, error.to_string()).unwrap_or_default();
            if let Err(e) = graph.record_execution(name, None, termination, Default::default()) {
                debug!(stage = %name, error = %e, "Could not record termination");
            }
            newly
        };

        warn!(build_id = %build_id, stage = %name, error = %error, "Stage failed before spawning");
        self.events
            .emit(
                &BuildEvent::stage(build_id, EventKind::StageFailed, name, StageStatus::Failed)
                    .with_termination(termination)
                    .with_detail("error", serde_json::json!(error.to_string()))
                    .with_detail("kind", serde_json::json!(error.kind())),
            )
            .await;

        let cause = format!("dependency '{name}' failed");
        self.emit_skipped(build_id, &newly_skipped, &cause).await;
        skipped.extend(newly_skipped);
    }

    fn budget_error(
        &self,
        graph: &Arc<RwLock<StageGraph>>,
        name: &str,
        budget: ResourceBudget,
    ) -> StageExecutionError {
        let required_mb = graph
            .read()
            .get(name)
            .map_or(0, |i| i.definition.resources.memory_mb);
        StageExecutionError::ExceedsResourceBudget {
            stage: name.to_string(),
            required_mb,
            budget_mb: budget.memory_mb.unwrap_or(0),
        }
    }

    async fn emit_ready(&self, build_id: &str, graph: &Arc<RwLock<StageGraph>>) {
        let promoted = graph.write().promote_ready();
        for name in promoted {
            self.events
                .emit(&BuildEvent::stage(build_id, EventKind::StageReady, &name, StageStatus::Ready))
                .await;
        }
    }

    async fn emit_skipped(&self, build_id: &str, names: &[String], reason: &str) {
        for name in names {
            debug!(build_id = %build_id, stage = %name, reason, "Stage skipped");
            self.events
                .emit(
                    &BuildEvent::stage(build_id, EventKind::StageSkipped, name, StageStatus::Skipped)
                        .with_detail("reason", serde_json::json!(reason)),
                )
                .await;
        }
    }
}

/// Spawns the supervised process on its own task.
fn spawn_stage(
    supervisor: Arc<ProcessSupervisor>,
    request: ExecutionRequest,
    cancel: Arc<CancellationToken>,
    cost: u64,
) -> impl Future<Output = StageCompletion> + Send + 'static {
    let name = request.stage.clone();
    tokio::spawn(async move { supervisor.execute(request, &cancel).await }).map(move |joined| {
        let result = joined.unwrap_or_else(|e| {
            StageResult::not_spawned(
                TerminationReason::SpawnFailed,
                Some(format!("stage task failed: {e}")),
            )
        });
        StageCompletion { name, cost, result }
    })
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_fits() {
        let budget = ResourceBudget::memory(4096);
        assert!(budget.fits(0, 4096));
        assert!(budget.fits(2048, 2048));
        assert!(!budget.fits(2048, 2049));
        assert!(ResourceBudget::unlimited().fits(u64::MAX, u64::MAX));
    }

    #[test]
    fn test_limits_builder() {
        let limits = SchedulerLimits::new(2)
            .with_budget(ResourceBudget::memory(1024))
            .with_stage_timeout(Some(Duration::from_secs(60)));
        assert_eq!(limits.concurrency_limit, 2);
        assert_eq!(limits.budget.memory_mb, Some(1024));
        assert_eq!(limits.idle_timeout, None);
    }
}
