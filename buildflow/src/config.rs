//! Engine configuration.

use crate::credentials::ElevationConfig;
use crate::errors::{BuildflowError, ConfigError};
use crate::supervisor::{default_non_interactive_env, SupervisorConfig, DEFAULT_PROMPT_SIGNATURES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine-wide settings. Per-build limits in a `BuildRequest` override the
/// defaults here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default maximum number of concurrently running stages.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Default memory budget in megabytes; `None` means unlimited.
    #[serde(default)]
    pub memory_budget_mb: Option<u64>,
    /// Wall-clock timeout for stages without their own, in seconds.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: Option<u64>,
    /// Timeout without any output, in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: Option<u64>,
    /// Timeout for each rollback command, in seconds.
    #[serde(default = "default_rollback_timeout")]
    pub rollback_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL, in milliseconds.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_ms: u64,
    /// Lines of output kept for log excerpts.
    #[serde(default = "default_excerpt_lines")]
    pub log_excerpt_lines: usize,
    /// Directory for per-stage log files.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Directory for persisted process-group records.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Regex signatures of blocking prompts.
    #[serde(default = "default_prompt_signatures")]
    pub prompt_signatures: Vec<String>,
    /// Environment exported to every stage.
    #[serde(default = "default_non_interactive_env")]
    pub non_interactive_env: BTreeMap<String, String>,
    /// How elevated commands are wrapped.
    #[serde(default)]
    pub elevation: ElevationConfig,
    /// Buffered events per live subscriber.
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

fn default_concurrency_limit() -> usize {
    1
}

#[allow(clippy::unnecessary_wraps)]
fn default_stage_timeout() -> Option<u64> {
    Some(6 * 60 * 60)
}

#[allow(clippy::unnecessary_wraps)]
fn default_idle_timeout() -> Option<u64> {
    Some(30 * 60)
}

fn default_rollback_timeout() -> u64 {
    15 * 60
}

fn default_kill_grace() -> u64 {
    5_000
}

fn default_excerpt_lines() -> usize {
    40
}

fn default_prompt_signatures() -> Vec<String> {
    DEFAULT_PROMPT_SIGNATURES.iter().map(ToString::to_string).collect()
}

fn default_event_capacity() -> usize {
    crate::events::DEFAULT_CHANNEL_CAPACITY
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            memory_budget_mb: None,
            stage_timeout_secs: default_stage_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            rollback_timeout_secs: default_rollback_timeout(),
            kill_grace_ms: default_kill_grace(),
            log_excerpt_lines: default_excerpt_lines(),
            log_dir: None,
            state_dir: None,
            prompt_signatures: default_prompt_signatures(),
            non_interactive_env: default_non_interactive_env(),
            elevation: ElevationConfig::default(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, BuildflowError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BuildflowError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Applies `BUILDFLOW_*` environment overrides.
    ///
    /// Recognized: `BUILDFLOW_CONCURRENCY_LIMIT`, `BUILDFLOW_MEMORY_BUDGET_MB`,
    /// `BUILDFLOW_STAGE_TIMEOUT_SECS`, `BUILDFLOW_IDLE_TIMEOUT_SECS`,
    /// `BUILDFLOW_ROLLBACK_TIMEOUT_SECS`, `BUILDFLOW_KILL_GRACE_MS`,
    /// `BUILDFLOW_LOG_DIR`, `BUILDFLOW_STATE_DIR`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BUILDFLOW_CONCURRENCY_LIMIT") {
            self.concurrency_limit = parse_number("BUILDFLOW_CONCURRENCY_LIMIT", &v)?;
        }
        if let Some(v) = lookup("BUILDFLOW_MEMORY_BUDGET_MB") {
            self.memory_budget_mb = Some(parse_number("BUILDFLOW_MEMORY_BUDGET_MB", &v)?);
        }
        if let Some(v) = lookup("BUILDFLOW_STAGE_TIMEOUT_SECS") {
            self.stage_timeout_secs = Some(parse_number("BUILDFLOW_STAGE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("BUILDFLOW_IDLE_TIMEOUT_SECS") {
            self.idle_timeout_secs = Some(parse_number("BUILDFLOW_IDLE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("BUILDFLOW_ROLLBACK_TIMEOUT_SECS") {
            self.rollback_timeout_secs = parse_number("BUILDFLOW_ROLLBACK_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("BUILDFLOW_KILL_GRACE_MS") {
            self.kill_grace_ms = parse_number("BUILDFLOW_KILL_GRACE_MS", &v)?;
        }
        if let Some(v) = lookup("BUILDFLOW_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("BUILDFLOW_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(v));
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::invalid_limit("concurrency_limit", "must be at least 1"));
        }
        if self.memory_budget_mb == Some(0) {
            return Err(ConfigError::invalid_limit("memory_budget_mb", "must be positive when set"));
        }
        Ok(())
    }

    /// Wall-clock stage timeout.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }

    /// Idle-output timeout.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Rollback command timeout.
    #[must_use]
    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_secs)
    }

    /// SIGTERM-to-SIGKILL grace period.
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Derives the supervisor settings.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            kill_grace: self.kill_grace(),
            excerpt_lines: self.log_excerpt_lines,
            log_dir: self.log_dir.clone(),
            non_interactive_env: self.non_interactive_env.clone(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid_limit(name, format!("'{value}' is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency_limit, 1);
        assert_eq!(config.kill_grace(), Duration::from_secs(5));
        assert_eq!(config.prompt_signatures.len(), DEFAULT_PROMPT_SIGNATURES.len());
        assert_eq!(config.elevation.program, "sudo");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"concurrency_limit": 4, "memory_budget_mb": 8192, "log_dir": "/var/log/buildflow"}"#,
        )
        .unwrap();

        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.memory_budget_mb, Some(8192));
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/buildflow")));
        assert_eq!(config.rollback_timeout_secs, default_rollback_timeout());
        assert_eq!(
            config.non_interactive_env.get("DEBIAN_FRONTEND").map(String::as_str),
            Some("noninteractive")
        );
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = EngineConfig::from_json_str(r#"{"concurrency_limit": 0}"#).unwrap_err();
        assert!(matches!(
            err,
            BuildflowError::Config(ConfigError::InvalidLimit { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            ("BUILDFLOW_CONCURRENCY_LIMIT", "3"),
            ("BUILDFLOW_KILL_GRACE_MS", "250"),
            ("BUILDFLOW_STATE_DIR", "/run/buildflow"),
        ]);
        let config = EngineConfig::default()
            .with_overrides(|key| vars.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.concurrency_limit, 3);
        assert_eq!(config.kill_grace(), Duration::from_millis(250));
        assert_eq!(config.state_dir, Some(PathBuf::from("/run/buildflow")));
    }

    #[test]
    fn test_bad_override() {
        let result = EngineConfig::default()
            .with_overrides(|key| (key == "BUILDFLOW_CONCURRENCY_LIMIT").then(|| "many".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidLimit { .. })));
    }

    #[test]
    fn test_supervisor_config() {
        let config = EngineConfig {
            kill_grace_ms: 100,
            log_excerpt_lines: 5,
            ..EngineConfig::default()
        };
        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.kill_grace, Duration::from_millis(100));
        assert_eq!(supervisor.excerpt_lines, 5);
    }
}
