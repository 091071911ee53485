//! Supervised execution of one stage process.

use super::detector::PromptDetector;
use super::invocation::Invocation;
use super::output::{LineAssembler, OutputWriter};
use super::registry::ProcessRegistry;
use super::signals::{group_alive, signal_group};
use crate::cancellation::CancellationToken;
use crate::core::{BuildEvent, EventKind, OutputHandle, StageStatus, TerminationReason};
use crate::errors::{OrphanProcessError, StageExecutionError};
use crate::events::EventSink;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;
const MIN_DRAIN: Duration = Duration::from_millis(100);

/// Supervisor settings shared by every stage of every build.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Lines kept in memory for the log excerpt.
    pub excerpt_lines: usize,
    /// Directory for per-stage log files; `<log_dir>/<build_id>/<stage>.log`.
    pub log_dir: Option<PathBuf>,
    /// Environment exported to every child.
    pub non_interactive_env: BTreeMap<String, String>,
}

/// Environment that keeps common tools from prompting.
#[must_use]
pub fn default_non_interactive_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()),
        ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
    ])
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
            excerpt_lines: 40,
            log_dir: None,
            non_interactive_env: default_non_interactive_env(),
        }
    }
}

/// One process to run under supervision.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The owning build.
    pub build_id: String,
    /// The stage this process belongs to.
    pub stage: String,
    /// What to spawn.
    pub invocation: Invocation,
    /// Wall-clock limit.
    pub timeout: Option<Duration>,
    /// Limit on time without any output.
    pub idle_timeout: Option<Duration>,
    /// Log file name within the build's log directory.
    pub log_name: String,
    /// Whether to emit `stage.started` and `stage.terminated` events.
    pub emit_stage_events: bool,
}

impl ExecutionRequest {
    /// Creates a request with no timeouts.
    #[must_use]
    pub fn new(build_id: impl Into<String>, stage: impl Into<String>, invocation: Invocation) -> Self {
        let stage = stage.into();
        Self {
            build_id: build_id.into(),
            log_name: format!("{stage}.log"),
            stage,
            invocation,
            timeout: None,
            idle_timeout: None,
            emit_stage_events: true,
        }
    }

    /// Sets the wall-clock timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the log file name.
    #[must_use]
    pub fn with_log_name(mut self, name: impl Into<String>) -> Self {
        self.log_name = name.into();
        self
    }

    /// Suppresses stage lifecycle events.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.emit_stage_events = false;
        self
    }
}

/// What the supervisor observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Exit code, absent when killed by a signal or never spawned.
    pub exit_code: Option<i32>,
    /// Time from spawn to reap.
    pub duration: Duration,
    /// How the process ended.
    pub terminated_reason: TerminationReason,
    /// The prompt signature that matched, if any.
    pub matched_signature: Option<String>,
    /// Captured output.
    pub output: OutputHandle,
    /// Spawn error text.
    pub error: Option<String>,
}

impl StageResult {
    /// A result for a process that was never spawned.
    #[must_use]
    pub fn not_spawned(reason: TerminationReason, error: Option<String>) -> Self {
        Self {
            exit_code: None,
            duration: Duration::ZERO,
            terminated_reason: reason,
            matched_signature: None,
            output: OutputHandle::default(),
            error,
        }
    }

    /// Exit code 0 and exited on its own.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.terminated_reason == TerminationReason::Exited && self.exit_code == Some(0)
    }

    /// The last lines of output.
    #[must_use]
    pub fn log_excerpt(&self) -> &str {
        &self.output.excerpt
    }

    /// Converts a non-successful result into a stage error.
    #[must_use]
    pub fn error(&self, stage: &str) -> Option<StageExecutionError> {
        if self.is_success() {
            return None;
        }
        let stage = stage.to_string();
        Some(match self.terminated_reason {
            TerminationReason::Exited => StageExecutionError::NonZeroExit {
                stage,
                exit_code: self.exit_code,
            },
            TerminationReason::BlockedOnPrompt => StageExecutionError::BlockedOnPrompt {
                stage,
                signature: self.matched_signature.clone().unwrap_or_default(),
            },
            TerminationReason::Timeout => StageExecutionError::Timeout {
                stage,
                seconds: self.duration.as_secs_f64(),
            },
            TerminationReason::Cancelled => StageExecutionError::Cancelled { stage },
            TerminationReason::MissingElevation => StageExecutionError::MissingElevation { stage },
            TerminationReason::SpawnFailed => StageExecutionError::SpawnFailed {
                stage,
                reason: self.error.clone().unwrap_or_default(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout = 0,
    Stderr = 1,
}

/// Runs stage processes: spawn, stream, detect, time out, terminate, reap.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    detector: PromptDetector,
    registry: Arc<ProcessRegistry>,
    events: Arc<dyn EventSink>,
}

impl ProcessSupervisor {
    /// Creates a supervisor.
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        detector: PromptDetector,
        registry: Arc<ProcessRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            detector,
            registry,
            events,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Returns the process registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Runs one process to completion or forced termination.
    ///
    /// Never fails: spawn errors and forced terminations are reported in the
    /// returned [`StageResult`].
    pub async fn execute(&self, request: ExecutionRequest, cancel: &CancellationToken) -> StageResult {
        if cancel.is_cancelled() {
            return StageResult::not_spawned(TerminationReason::Cancelled, None);
        }

        let started = Instant::now();
        let mut child = match self.spawn(&request.invocation) {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    build_id = %request.build_id,
                    stage = %request.stage,
                    program = %request.invocation.program,
                    error = %e,
                    "Failed to spawn stage process"
                );
                return StageResult::not_spawned(TerminationReason::SpawnFailed, Some(e.to_string()));
            }
        };

        let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return StageResult::not_spawned(
                TerminationReason::SpawnFailed,
                Some("child exited before its pid was read".to_string()),
            );
        };
        self.registry.register(&request.build_id, pgid).await;
        info!(
            build_id = %request.build_id,
            stage = %request.stage,
            pgid,
            command = %request.invocation.display(),
            "Stage process started"
        );
        if request.emit_stage_events {
            self.events
                .emit(
                    &BuildEvent::stage(&request.build_id, EventKind::StageStarted, &request.stage, StageStatus::Running)
                        .with_detail("pgid", serde_json::json!(pgid)),
                )
                .await;
        }

        deliver_secret(&mut child, &request).await;

        let (tx, mut rx) = mpsc::channel::<(Stream, Vec<u8>)>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        let log_path = self
            .config
            .log_dir
            .as_ref()
            .map(|dir| dir.join(&request.build_id).join(&request.log_name));
        let writer = OutputWriter::spawn(self.config.excerpt_lines, log_path);
        let mut assemblers = [LineAssembler::default(), LineAssembler::default()];

        let deadline = request.timeout.map(|t| started + t);
        let mut idle_deadline = request.idle_timeout.map(|t| Instant::now() + t);
        let mut streams_open = true;
        let mut matched: Option<String> = None;
        let mut forced: Option<TerminationReason> = None;
        let mut exit_status: Option<std::io::Result<ExitStatus>> = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    forced = Some(TerminationReason::Cancelled);
                    break;
                }
                () = sleep_until(deadline) => {
                    forced = Some(TerminationReason::Timeout);
                    break;
                }
                () = sleep_until(idle_deadline) => {
                    debug!(stage = %request.stage, "No output within idle timeout");
                    forced = Some(TerminationReason::Timeout);
                    break;
                }
                status = child.wait() => {
                    exit_status = Some(status);
                    break;
                }
                chunk = rx.recv(), if streams_open => match chunk {
                    Some((stream, bytes)) => {
                        if let Some(idle) = request.idle_timeout {
                            idle_deadline = Some(Instant::now() + idle);
                        }
                        matched = self.consume(&mut assemblers[stream as usize], &bytes, &writer, true);
                        if matched.is_some() {
                            forced = Some(TerminationReason::BlockedOnPrompt);
                            break;
                        }
                    }
                    None => streams_open = false,
                },
            }
        }

        let status = match exit_status {
            Some(status) => status.ok(),
            None => {
                let reason = forced.unwrap_or(TerminationReason::Cancelled);
                warn!(
                    build_id = %request.build_id,
                    stage = %request.stage,
                    pgid,
                    reason = %reason,
                    signature = ?matched,
                    "Terminating stage process"
                );
                let status = self.stop(&mut child, pgid).await;
                if request.emit_stage_events {
                    let mut event = BuildEvent::stage(
                        &request.build_id,
                        EventKind::StageTerminated,
                        &request.stage,
                        StageStatus::Running,
                    )
                    .with_termination(reason);
                    if let Some(signature) = &matched {
                        event = event.with_detail("signature", serde_json::json!(signature));
                    }
                    self.events.emit(&event).await;
                }
                status
            }
        };

        self.kill_orphans(&request.build_id, pgid);

        // Collect whatever the pipes still hold; orphans are dead so they close.
        let drain = async {
            while let Some((stream, bytes)) = rx.recv().await {
                let found = self.consume(&mut assemblers[stream as usize], &bytes, &writer, matched.is_none());
                if matched.is_none() {
                    matched = found;
                }
            }
        };
        if tokio::time::timeout(self.config.kill_grace.max(MIN_DRAIN), drain).await.is_err() {
            debug!(stage = %request.stage, "Output still open after drain window");
        }
        for assembler in &mut assemblers {
            if let Some(rest) = assembler.finish() {
                writer.write(rest);
            }
        }

        self.registry.unregister(&request.build_id, pgid).await;
        let output = writer.finish().await;
        let result = StageResult {
            exit_code: status.and_then(|s| s.code()),
            duration: started.elapsed(),
            terminated_reason: forced.unwrap_or(TerminationReason::Exited),
            matched_signature: matched,
            output,
            error: None,
        };

        info!(
            build_id = %request.build_id,
            stage = %request.stage,
            exit_code = ?result.exit_code,
            reason = %result.terminated_reason,
            duration_ms = result.duration.as_millis() as u64,
            "Stage process finished"
        );
        result
    }

    fn spawn(&self, invocation: &Invocation) -> std::io::Result<Child> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&self.config.non_interactive_env)
            .envs(&invocation.env)
            .stdin(if invocation.stdin_secret.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        command.spawn()
    }

    /// Feeds a chunk through line assembly, the writer and optionally the
    /// detector. Returns the matched signature.
    fn consume(
        &self,
        assembler: &mut LineAssembler,
        bytes: &[u8],
        writer: &OutputWriter,
        detect: bool,
    ) -> Option<String> {
        let mut matched = None;
        for line in assembler.push(bytes) {
            if detect && matched.is_none() {
                matched = self.detector.detect(&line).map(ToString::to_string);
            }
            writer.write(line);
        }
        if detect && matched.is_none() {
            if let Some(tail) = assembler.prompt_tail() {
                matched = self.detector.detect(&tail).map(ToString::to_string);
            }
        }
        matched
    }

    /// SIGTERM the group, wait out the grace period, SIGKILL, reap.
    async fn stop(&self, child: &mut Child, pgid: i32) -> Option<ExitStatus> {
        if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
            debug!(pgid, error = %e, "SIGTERM failed");
        }
        if let Ok(status) = tokio::time::timeout(self.config.kill_grace, child.wait()).await {
            return status.ok();
        }
        if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
            debug!(pgid, error = %e, "SIGKILL failed");
        }
        child.wait().await.ok()
    }

    fn kill_orphans(&self, build_id: &str, pgid: i32) {
        if !group_alive(pgid) {
            return;
        }
        let orphan = OrphanProcessError {
            build_id: build_id.to_string(),
            pgid,
        };
        warn!(build_id = %build_id, pgid, error = %orphan, "Killing orphaned processes");
        if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
            warn!(build_id = %build_id, pgid, error = %e, "Could not kill orphaned processes");
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.config)
            .field("signatures", &self.detector.len())
            .finish_non_exhaustive()
    }
}

async fn deliver_secret(child: &mut Child, request: &ExecutionRequest) {
    let (Some(secret), Some(mut stdin)) = (&request.invocation.stdin_secret, child.stdin.take()) else {
        return;
    };
    let written = async {
        stdin.write_all(secret.expose().as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await
    }
    .await;
    if let Err(e) = written {
        // The child may exit without reading stdin.
        debug!(stage = %request.stage, error = %e, "Credential pipe closed early");
    }
}

async fn pump<R>(mut reader: R, stream: Stream, tx: mpsc::Sender<(Stream, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialBroker, ElevationConfig};
    use crate::events::CollectingEventSink;
    use secrecy::SecretString;

    fn supervisor_with(config: SupervisorConfig) -> (ProcessSupervisor, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let supervisor = ProcessSupervisor::new(
            config,
            PromptDetector::default(),
            Arc::new(ProcessRegistry::new(Duration::from_millis(500))),
            sink.clone(),
        );
        (supervisor, sink)
    }

    fn supervisor() -> (ProcessSupervisor, Arc<CollectingEventSink>) {
        supervisor_with(SupervisorConfig {
            kill_grace: Duration::from_millis(500),
            ..SupervisorConfig::default()
        })
    }

    fn request(command: &str) -> ExecutionRequest {
        ExecutionRequest::new("lfs-test", "stage", Invocation::shell(command))
            .with_timeout(Some(Duration::from_secs(10)))
    }

    #[tokio::test]
    async fn test_successful_command() {
        let (supervisor, sink) = supervisor();
        let result = supervisor
            .execute(request("echo hello; echo oops >&2"), &CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert!(result.log_excerpt().contains("hello"));
        assert!(result.log_excerpt().contains("oops"));
        assert!(result.error("stage").is_none());
        assert_eq!(sink.stage_event_types("stage"), vec!["stage.started"]);
        assert!(supervisor.registry().groups("lfs-test").is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let (supervisor, _) = supervisor();
        let result = supervisor.execute(request("exit 3"), &CancellationToken::new()).await;

        assert!(!result.is_success());
        assert_eq!(result.terminated_reason, TerminationReason::Exited);
        assert_eq!(
            result.error("stage"),
            Some(StageExecutionError::NonZeroExit {
                stage: "stage".to_string(),
                exit_code: Some(3),
            })
        );
    }

    #[tokio::test]
    async fn test_prompt_without_newline_is_detected() {
        let (supervisor, sink) = supervisor();
        let result = supervisor
            .execute(
                request("printf '[sudo] password for lfs: '; sleep 30"),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.terminated_reason, TerminationReason::BlockedOnPrompt);
        assert!(result.matched_signature.is_some());
        assert!(result.duration < Duration::from_secs(5));
        assert!(result.log_excerpt().contains("[sudo] password for lfs:"));
        assert_eq!(
            sink.stage_event_types("stage"),
            vec!["stage.started", "stage.terminated"]
        );
        assert!(matches!(
            result.error("stage"),
            Some(StageExecutionError::BlockedOnPrompt { .. })
        ));
    }

    #[tokio::test]
    async fn test_endless_line_is_flushed_in_pieces() {
        let (supervisor, _) = supervisor();
        let result = supervisor
            .execute(
                request("head -c 4000000 /dev/zero | tr '\\0' a"),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_success());
        assert!(result.duration < Duration::from_secs(5));
        // 61 full pieces of 64 KiB plus the remainder.
        assert_eq!(result.output.line_count, 62);
    }

    #[tokio::test]
    async fn test_wall_clock_timeout() {
        let (supervisor, _) = supervisor();
        let result = supervisor
            .execute(
                request("sleep 30").with_timeout(Some(Duration::from_millis(200))),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.terminated_reason, TerminationReason::Timeout);
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (supervisor, _) = supervisor();
        let result = supervisor
            .execute(
                request("echo working; sleep 30").with_idle_timeout(Some(Duration::from_millis(300))),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.terminated_reason, TerminationReason::Timeout);
        assert!(result.log_excerpt().contains("working"));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_process() {
        let (supervisor, _) = supervisor();
        let cancel = Arc::new(CancellationToken::new());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel("user requested");
        });

        let result = supervisor.execute(request("sleep 30"), &cancel).await;
        assert_eq!(result.terminated_reason, TerminationReason::Cancelled);
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let (supervisor, sink) = supervisor();
        let cancel = CancellationToken::new();
        cancel.cancel("early");

        let result = supervisor.execute(request("echo never"), &cancel).await;
        assert_eq!(result.terminated_reason, TerminationReason::Cancelled);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_orphans_are_killed() {
        let (supervisor, _) = supervisor();
        let result = supervisor
            .execute(request("sleep 30 & echo started"), &CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert!(result.duration < Duration::from_secs(5));
        assert!(result.log_excerpt().contains("started"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (supervisor, _) = supervisor();
        let result = supervisor
            .execute(
                ExecutionRequest::new("lfs-test", "stage", Invocation::new("/nonexistent/program")),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.terminated_reason, TerminationReason::SpawnFailed);
        assert!(matches!(
            result.error("stage"),
            Some(StageExecutionError::SpawnFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stdin_is_null_and_env_is_non_interactive() {
        let (supervisor, _) = supervisor();
        let result = supervisor
            .execute(
                request(
                    r#"if read -r line; then exit 10; fi
                       [ "$DEBIAN_FRONTEND" = noninteractive ] || exit 11
                       [ "$GIT_TERMINAL_PROMPT" = 0 ] || exit 12"#,
                ),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_credential_arrives_on_stdin() {
        let (supervisor, _) = supervisor();
        // Stand-in for sudo: read the password line, check it, run the command.
        let broker = CredentialBroker::with_elevation(ElevationConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"read -r pw; [ "$pw" = hunter2 ] || exit 42; shift; exec "$@""#.to_string(),
                "elevate".to_string(),
            ],
        });
        broker.provide("lfs-test", SecretString::from("hunter2".to_string()));
        let credential = broker.acquire("lfs-test").unwrap();
        let invocation = broker.inject(
            Invocation::shell("echo elevated").with_env("LFS", "/mnt/lfs"),
            &credential,
            &supervisor.config().non_interactive_env,
        );

        let result = supervisor
            .execute(
                ExecutionRequest::new("lfs-test", "stage", invocation),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_success(), "{result:?}");
        assert!(result.log_excerpt().contains("elevated"));
        assert!(!result.log_excerpt().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_log_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(SupervisorConfig {
            log_dir: Some(dir.path().to_path_buf()),
            excerpt_lines: 1,
            ..SupervisorConfig::default()
        });

        let result = supervisor
            .execute(request("echo one; echo two"), &CancellationToken::new())
            .await;

        assert_eq!(result.log_excerpt(), "two");
        let path = dir.path().join("lfs-test").join("stage.log");
        assert_eq!(result.output.log_path.as_deref(), Some(path.as_path()));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "one\ntwo\n");
    }
}
