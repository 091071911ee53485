//! Non-interactive privilege elevation.
//!
//! The [`CredentialBroker`] holds at most one secret per build. Elevated
//! stages are wrapped with the configured elevation program and receive the
//! secret on stdin; the secret never appears in arguments, the environment,
//! events or logs.

mod broker;

pub use broker::{Credential, CredentialBroker, ElevationConfig};
