//! Stage definition and engine fixtures.

use crate::config::EngineConfig;
use crate::pipeline::StageDefinition;
use crate::session::BuildManager;
use rand::Rng;

/// A stage running `true` with the given dependencies.
#[must_use]
pub fn stage(name: &str, dependencies: &[&str]) -> StageDefinition {
    shell_stage(name, "true", dependencies)
}

/// A stage running an arbitrary shell command.
#[must_use]
pub fn shell_stage(name: &str, command: &str, dependencies: &[&str]) -> StageDefinition {
    StageDefinition::new(name, command).with_dependencies(dependencies.iter().copied())
}

/// `a`; `b` and `c` after `a`; `d` after both.
#[must_use]
pub fn diamond() -> Vec<StageDefinition> {
    vec![
        stage("a", &[]).with_order(1),
        stage("b", &["a"]).with_order(2),
        stage("c", &["a"]).with_order(3),
        stage("d", &["b", "c"]).with_order(4),
    ]
}

/// A linear chain where each stage depends on the previous one.
#[must_use]
pub fn chain(names: &[&str]) -> Vec<StageDefinition> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let deps: &[&str] = if i == 0 { &[] } else { &names[i - 1..i] };
            stage(name, deps)
        })
        .collect()
}

/// A random acyclic graph of `size` stages named `s0..`.
///
/// Edges only point from a later stage to an earlier one, so the result is
/// always acyclic. `fail_ratio` of the stages run `false` instead of `true`.
pub fn random_dag<R: Rng>(rng: &mut R, size: usize, fail_ratio: f64) -> Vec<StageDefinition> {
    (0..size)
        .map(|i| {
            let deps: Vec<String> = (0..i)
                .filter(|_| rng.gen_bool(0.3))
                .map(|j| format!("s{j}"))
                .collect();
            let command = if rng.gen_bool(fail_ratio) { "false" } else { "true" };
            StageDefinition::new(format!("s{i}"), command)
                .with_order(rng.gen_range(0..4))
                .with_dependencies(deps)
        })
        .collect()
}

/// An engine configuration with short timeouts for tests.
#[must_use]
pub fn test_config() -> EngineConfig {
    EngineConfig {
        concurrency_limit: 2,
        stage_timeout_secs: Some(30),
        idle_timeout_secs: None,
        rollback_timeout_secs: 10,
        kill_grace_ms: 200,
        ..EngineConfig::default()
    }
}

/// A manager built from [`test_config`].
#[must_use]
pub fn test_manager() -> BuildManager {
    BuildManager::new(test_config()).expect("test configuration is valid")
}
