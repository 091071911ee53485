//! A concrete command line to spawn.

use crate::credentials::Credential;
use crate::pipeline::StageDefinition;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Program, arguments and environment for one child process.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The program to execute.
    pub program: String,
    /// Its arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub working_dir: Option<PathBuf>,
    /// Secret written to stdin before it is closed. Stdin is null otherwise.
    pub stdin_secret: Option<Arc<Credential>>,
}

impl Invocation {
    /// Creates an invocation of `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            stdin_secret: None,
        }
    }

    /// Runs `command` through `sh -c`.
    #[must_use]
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("sh").with_arg("-c").with_arg(command)
    }

    /// Builds the invocation for a stage's main command.
    #[must_use]
    pub fn for_stage(definition: &StageDefinition) -> Self {
        Self::for_command(definition, &definition.command)
    }

    /// Builds an invocation running `command` with a stage's environment.
    #[must_use]
    pub fn for_command(definition: &StageDefinition, command: &str) -> Self {
        let mut invocation = Self::shell(command);
        invocation.env.clone_from(&definition.env);
        if definition.resources.cpu_cores > 1 {
            invocation
                .env
                .entry("MAKEFLAGS".to_string())
                .or_insert_with(|| format!("-j{}", definition.resources.cpu_cores));
        }
        invocation.working_dir.clone_from(&definition.working_dir);
        invocation
    }

    /// Appends an argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Renders the command line for logs.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ResourceCost;

    #[test]
    fn test_shell_invocation() {
        let invocation = Invocation::shell("echo hi");
        assert_eq!(invocation.program, "sh");
        assert_eq!(invocation.args, vec!["-c", "echo hi"]);
        assert_eq!(invocation.display(), "sh -c echo hi");
        assert!(invocation.stdin_secret.is_none());
    }

    #[test]
    fn test_for_stage_exports_makeflags() {
        let def = StageDefinition::new("build_system", "make")
            .with_resources(ResourceCost::memory(1024).with_cpu_cores(8))
            .with_env("LFS", "/mnt/lfs")
            .with_working_dir("/mnt/lfs/sources");

        let invocation = Invocation::for_stage(&def);
        assert_eq!(invocation.env.get("MAKEFLAGS").map(String::as_str), Some("-j8"));
        assert_eq!(invocation.env.get("LFS").map(String::as_str), Some("/mnt/lfs"));
        assert_eq!(invocation.working_dir, Some(PathBuf::from("/mnt/lfs/sources")));
    }

    #[test]
    fn test_explicit_makeflags_wins() {
        let def = StageDefinition::new("s", "make")
            .with_resources(ResourceCost::default().with_cpu_cores(4))
            .with_env("MAKEFLAGS", "-j1");
        let invocation = Invocation::for_stage(&def);
        assert_eq!(invocation.env.get("MAKEFLAGS").map(String::as_str), Some("-j1"));
    }
}
