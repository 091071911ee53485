//! Credential storage and elevation wrapping.

use crate::errors::CredentialError;
use crate::supervisor::Invocation;
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs as the elevated command: discards whatever the elevation program left
/// unread on stdin, then execs the wrapped command. With `NOPASSWD` sudo never
/// reads the password line, and the stage must not see it.
const STDIN_GUARD: &str = r#"exec 0</dev/null; exec "$@""#;

/// An elevation secret. Zeroized on drop and redacted in `Debug`.
pub struct Credential(SecretString);

impl Credential {
    /// Wraps a secret.
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self(secret)
    }

    /// Exposes the secret for writing to a child's stdin.
    pub(crate) fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// How elevated commands are wrapped.
///
/// The credential is written to the wrapper's stdin followed by a newline.
/// The elevated side closes stdin before the stage command runs, so a wrapper
/// that does not read it (`sudo` with `NOPASSWD`) never leaks the line to the
/// stage. The wrapper may also reset the environment (`sudo`'s `env_reset`),
/// so the stage environment is passed again inside the wrapped argv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationConfig {
    /// The elevation program.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the `--` separator.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

fn default_program() -> String {
    "sudo".to_string()
}

fn default_args() -> Vec<String> {
    // Read the password from stdin, ignore cached timestamps, print no prompt.
    ["-S", "-k", "-p", ""].iter().map(ToString::to_string).collect()
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
        }
    }
}

/// Holds one credential per build.
#[derive(Debug, Default)]
pub struct CredentialBroker {
    credentials: DashMap<String, Arc<Credential>>,
    elevation: ElevationConfig,
}

impl CredentialBroker {
    /// Creates a broker with the default `sudo` elevation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a broker with a custom elevation program.
    #[must_use]
    pub fn with_elevation(elevation: ElevationConfig) -> Self {
        Self {
            credentials: DashMap::new(),
            elevation,
        }
    }

    /// Returns the elevation configuration.
    #[must_use]
    pub fn elevation(&self) -> &ElevationConfig {
        &self.elevation
    }

    /// Stores the credential for a build, replacing any previous one.
    pub fn provide(&self, build_id: &str, secret: SecretString) {
        self.credentials
            .insert(build_id.to_string(), Arc::new(Credential::new(secret)));
        info!(build_id = %build_id, "Elevation credential provided");
    }

    /// Returns the credential for a build.
    pub fn acquire(&self, build_id: &str) -> Result<Arc<Credential>, CredentialError> {
        self.credentials
            .get(build_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| CredentialError::NotProvided {
                build_id: build_id.to_string(),
            })
    }

    /// Returns true if a credential is held for the build.
    #[must_use]
    pub fn has_credential(&self, build_id: &str) -> bool {
        self.credentials.contains_key(build_id)
    }

    /// Wraps an invocation with the elevation program and attaches the
    /// credential as its stdin payload.
    ///
    /// `base_env` and the invocation's own environment are re-exported on the
    /// elevated side through `env`, the invocation's entries taking precedence:
    ///
    /// `<program> <args> -- env K=V.. sh -c <guard> elevated <command>`
    #[must_use]
    pub fn inject(
        &self,
        invocation: Invocation,
        credential: &Arc<Credential>,
        base_env: &BTreeMap<String, String>,
    ) -> Invocation {
        let mut forwarded = base_env.clone();
        forwarded.extend(invocation.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut args = self.elevation.args.clone();
        args.push("--".to_string());
        if !forwarded.is_empty() {
            args.push("env".to_string());
            args.extend(
                forwarded
                    .iter()
                    .filter(|(k, _)| !k.is_empty() && !k.contains('='))
                    .map(|(k, v)| format!("{k}={v}")),
            );
        }
        args.extend(["sh", "-c", STDIN_GUARD, "elevated"].map(String::from));
        args.push(invocation.program);
        args.extend(invocation.args);

        Invocation {
            program: self.elevation.program.clone(),
            args,
            env: invocation.env,
            working_dir: invocation.working_dir,
            stdin_secret: Some(Arc::clone(credential)),
        }
    }

    /// Erases the credential for a build. Idempotent.
    pub fn release(&self, build_id: &str) {
        if self.credentials.remove(build_id).is_some() {
            debug!(build_id = %build_id, "Elevation credential released");
        }
    }
}
