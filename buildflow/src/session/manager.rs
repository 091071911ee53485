//! The build manager.
//!
//! [`BuildManager`] owns every [`BuildSession`] together with the shared
//! broker, supervisor, registry and event bus. Each started build gets one
//! driver task that runs the scheduler, rolls back on failure or cancel,
//! cleans up lingering processes and then marks the session settled.

use super::build::{BuildSession, BuildStatusReport};
use crate::config::EngineConfig;
use crate::core::{BuildEvent, BuildStatus, EventKind};
use crate::credentials::CredentialBroker;
use crate::errors::{BuildflowError, ConfigError};
use crate::events::{EventBus, EventSink};
use crate::observability::build_span;
use crate::pipeline::{ResourceBudget, Scheduler, SchedulerLimits, StageDefinition, StageGraph};
use crate::rollback::{RollbackEngine, RollbackReport};
use crate::supervisor::{CleanupReport, ProcessRegistry, ProcessSupervisor, PromptDetector};
use crate::utils::{config_fingerprint, generate_build_id};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use secrecy::SecretString;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn, Instrument};

/// Everything needed to launch one build.
pub struct BuildRequest {
    /// Explicit build id; generated when absent.
    pub build_id: Option<String>,
    /// Stage definitions in declaration order.
    pub definitions: Vec<StageDefinition>,
    /// Overrides the engine's default concurrency limit.
    pub concurrency_limit: Option<usize>,
    /// Overrides the engine's default memory budget.
    pub memory_budget_mb: Option<u64>,
    /// Elevation secret handed over before the build starts.
    pub credential: Option<SecretString>,
}

impl BuildRequest {
    /// Creates a request with engine defaults.
    #[must_use]
    pub fn new(definitions: Vec<StageDefinition>) -> Self {
        Self {
            build_id: None,
            definitions,
            concurrency_limit: None,
            memory_budget_mb: None,
            credential: None,
        }
    }

    /// Uses a fixed build id.
    #[must_use]
    pub fn with_build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = Some(build_id.into());
        self
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Sets the memory budget in megabytes.
    #[must_use]
    pub fn with_memory_budget(mut self, memory_mb: u64) -> Self {
        self.memory_budget_mb = Some(memory_mb);
        self
    }

    /// Attaches the elevation credential.
    #[must_use]
    pub fn with_credential(mut self, secret: SecretString) -> Self {
        self.credential = Some(secret);
        self
    }
}

impl std::fmt::Debug for BuildRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRequest")
            .field("build_id", &self.build_id)
            .field("stages", &self.definitions.len())
            .field("concurrency_limit", &self.concurrency_limit)
            .field("memory_budget_mb", &self.memory_budget_mb)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// The pieces a driver task needs, shared across builds.
struct Driver {
    scheduler: Scheduler,
    rollback: RollbackEngine,
    broker: Arc<CredentialBroker>,
    bus: Arc<EventBus>,
}

impl Driver {
    async fn drive(&self, session: Arc<BuildSession>, limits: SchedulerLimits) {
        let build_id = session.build_id().to_string();
        let outcome = self
            .scheduler
            .run(&build_id, session.graph(), limits, session.cancel_token())
            .await;
        let status = session.finish(outcome.status);
        session.set_outcome(outcome);

        if matches!(status, BuildStatus::Failed | BuildStatus::Cancelled) {
            let report = self.rollback.rollback(&build_id, session.graph()).await;
            session.set_rollback_report(report);
        }

        let cleanup = self.rollback.force_cleanup(&build_id).await;
        if !cleanup.is_empty() {
            warn!(build_id = %build_id, killed = cleanup.killed.len(), "Killed lingering process groups");
        }
        self.broker.release(&build_id);

        let report = session.report();
        self.bus
            .publish(
                BuildEvent::build(&build_id, EventKind::BuildFinished, status)
                    .with_detail("completed_count", serde_json::json!(report.completed_count))
                    .with_detail("total_count", serde_json::json!(report.total_count)),
            )
            .await;
        session.mark_settled();
        info!(build_id = %build_id, status = %status, "Build finished");
    }
}

/// Registry of builds and the entry point for controlling them.
pub struct BuildManager {
    config: EngineConfig,
    sessions: DashMap<String, Arc<BuildSession>>,
    registry: Arc<ProcessRegistry>,
    bus: Arc<EventBus>,
    driver: Arc<Driver>,
}

impl BuildManager {
    /// Creates a manager from a validated configuration.
    pub fn new(config: EngineConfig) -> Result<Self, BuildflowError> {
        config.validate()?;
        let detector = PromptDetector::new(config.prompt_signatures.as_slice()).map_err(|e| {
            ConfigError::InvalidSignature {
                pattern: first_invalid(&config.prompt_signatures),
                reason: e.to_string(),
            }
        })?;

        let mut registry = ProcessRegistry::new(config.kill_grace());
        if let Some(dir) = &config.state_dir {
            registry = registry.with_state_dir(dir);
        }
        let registry = Arc::new(registry);
        let bus = Arc::new(EventBus::new(config.event_channel_capacity));
        let events: Arc<dyn EventSink> = bus.clone();
        let broker = Arc::new(CredentialBroker::with_elevation(config.elevation.clone()));
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.supervisor_config(),
            detector,
            Arc::clone(&registry),
            Arc::clone(&events),
        ));

        let driver = Arc::new(Driver {
            scheduler: Scheduler::new(Arc::clone(&supervisor), Arc::clone(&broker), Arc::clone(&events)),
            rollback: RollbackEngine::new(supervisor, Arc::clone(&broker), events, config.rollback_timeout()),
            broker,
            bus: Arc::clone(&bus),
        });

        Ok(Self {
            config,
            sessions: DashMap::new(),
            registry,
            bus,
            driver,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates the request, registers a session and starts its driver task.
    ///
    /// Only configuration problems and id collisions are reported here; stage
    /// failures become graph state.
    pub async fn start_build(&self, request: BuildRequest) -> Result<String, BuildflowError> {
        let BuildRequest {
            build_id,
            definitions,
            concurrency_limit,
            memory_budget_mb,
            credential,
        } = request;

        let concurrency_limit = concurrency_limit.unwrap_or(self.config.concurrency_limit);
        if concurrency_limit == 0 {
            return Err(ConfigError::invalid_limit("concurrency_limit", "must be at least 1").into());
        }
        let memory_budget_mb = memory_budget_mb.or(self.config.memory_budget_mb);
        if memory_budget_mb == Some(0) {
            return Err(ConfigError::invalid_limit("memory_budget_mb", "must be positive when set").into());
        }

        let config_hash = config_fingerprint(&serde_json::to_vec(&definitions)?);
        let graph = StageGraph::load(definitions)?;
        let build_id = build_id.unwrap_or_else(generate_build_id);

        let session = match self.sessions.entry(build_id.clone()) {
            Entry::Occupied(_) => return Err(BuildflowError::AlreadyRunning(build_id)),
            Entry::Vacant(slot) => {
                let session = Arc::new(BuildSession::new(&build_id, graph, config_hash));
                slot.insert(Arc::clone(&session));
                session
            }
        };

        if let Some(secret) = credential {
            self.driver.broker.provide(&build_id, secret);
        }

        let limits = SchedulerLimits::new(concurrency_limit)
            .with_budget(memory_budget_mb.map_or_else(ResourceBudget::unlimited, ResourceBudget::memory))
            .with_stage_timeout(self.config.stage_timeout())
            .with_idle_timeout(self.config.idle_timeout());

        info!(
            build_id = %build_id,
            stages = session.report().total_count,
            config_hash = %session.config_hash(),
            concurrency_limit,
            "Build started"
        );
        self.bus
            .publish(
                BuildEvent::build(&build_id, EventKind::BuildStarted, BuildStatus::Running)
                    .with_detail("config_hash", serde_json::json!(session.config_hash())),
            )
            .await;

        let driver = Arc::clone(&self.driver);
        let span = build_span(&build_id);
        tokio::spawn(async move { driver.drive(session, limits).await }.instrument(span));
        Ok(build_id)
    }

    /// Requests cancellation. Idempotent; cancelling a finished build is a
    /// no-op.
    pub async fn cancel_build(&self, build_id: &str) -> Result<(), BuildflowError> {
        let session = self.session(build_id)?;
        if session.request_cancel("cancelled by request") {
            info!(build_id = %build_id, "Cancellation requested");
            self.bus
                .publish(BuildEvent::build(build_id, EventKind::CancelRequested, BuildStatus::Cancelled))
                .await;
        }
        Ok(())
    }

    /// Terminates every process group still registered to the build.
    /// Idempotent.
    pub async fn force_cleanup(&self, build_id: &str) -> Result<CleanupReport, BuildflowError> {
        self.session(build_id)?;
        Ok(self.driver.rollback.force_cleanup(build_id).await)
    }

    /// Returns a status snapshot.
    pub fn get_status(&self, build_id: &str) -> Result<BuildStatusReport, BuildflowError> {
        Ok(self.session(build_id)?.report())
    }

    /// Waits until the build has settled and returns its final status.
    pub async fn wait(&self, build_id: &str) -> Result<BuildStatusReport, BuildflowError> {
        let session = self.session(build_id)?;
        session.settled().await;
        Ok(session.report())
    }

    /// Subscribes to events of every build.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.bus.subscribe()
    }

    /// Registers an event sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.bus.add_sink(sink);
    }

    /// Returns the rollback report, if rollback ran.
    pub fn rollback_report(&self, build_id: &str) -> Result<Option<RollbackReport>, BuildflowError> {
        Ok(self.session(build_id)?.rollback_report())
    }

    /// Removes a settled session and returns its final status.
    pub fn archive(&self, build_id: &str) -> Result<BuildStatusReport, BuildflowError> {
        let session = self.session(build_id)?;
        if !session.is_settled() {
            return Err(BuildflowError::StillRunning(build_id.to_string()));
        }
        self.sessions.remove(build_id);
        self.bus.forget(build_id);
        info!(build_id = %build_id, "Build archived");
        Ok(session.report())
    }

    /// Kills process groups recorded by a previous engine in `state_dir`.
    pub async fn recover_orphans(&self, state_dir: &Path) -> Result<Vec<CleanupReport>, BuildflowError> {
        ProcessRegistry::recover(state_dir, self.registry.grace()).await
    }

    /// Ids of every session not yet archived.
    #[must_use]
    pub fn build_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn session(&self, build_id: &str) -> Result<Arc<BuildSession>, BuildflowError> {
        self.sessions
            .get(build_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| BuildflowError::UnknownBuild(build_id.to_string()))
    }
}

fn first_invalid(patterns: &[String]) -> String {
    patterns
        .iter()
        .find(|p| regex::Regex::new(p).is_err())
        .cloned()
        .unwrap_or_default()
}

impl std::fmt::Debug for BuildManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildManager")
            .field("builds", &self.sessions.len())
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::stage;

    #[test]
    fn test_invalid_signature_rejected() {
        let config = EngineConfig {
            prompt_signatures: vec![r"ok".to_string(), r"(unclosed".to_string()],
            ..EngineConfig::default()
        };
        let err = BuildManager::new(config).unwrap_err();
        match err {
            BuildflowError::Config(ConfigError::InvalidSignature { pattern, .. }) => {
                assert_eq!(pattern, "(unclosed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_start_rejects_bad_graph_and_limit() {
        let manager = BuildManager::new(EngineConfig::default()).unwrap();

        let err = manager
            .start_build(BuildRequest::new(vec![stage("a", &["missing"])]))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildflowError::Config(ConfigError::UnknownDependency { .. })));

        let err = manager
            .start_build(BuildRequest::new(vec![stage("a", &[])]).with_concurrency_limit(0))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildflowError::Config(ConfigError::InvalidLimit { .. })));
        assert!(manager.build_ids().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_build() {
        let manager = BuildManager::new(EngineConfig::default()).unwrap();
        assert!(matches!(manager.get_status("nope"), Err(BuildflowError::UnknownBuild(_))));
        assert!(matches!(manager.cancel_build("nope").await, Err(BuildflowError::UnknownBuild(_))));
        assert!(matches!(manager.archive("nope"), Err(BuildflowError::UnknownBuild(_))));
    }

    #[test]
    fn test_request_debug_redacts_credential() {
        let request = BuildRequest::new(Vec::new()).with_credential(SecretString::from("hunter2".to_string()));
        let rendered = format!("{request:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }
}
