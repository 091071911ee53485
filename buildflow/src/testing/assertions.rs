//! Assertions over build reports and event streams.

use crate::core::{BuildEvent, EventKind, StageStatus};
use crate::pipeline::StageDefinition;
use crate::session::BuildStatusReport;
use std::collections::HashSet;

/// Asserts that a stage has the expected status.
pub fn assert_stage_status(report: &BuildStatusReport, stage: &str, expected: StageStatus) {
    assert_eq!(
        report.stage_status(stage),
        Some(expected),
        "Expected stage '{stage}' to be {expected:?}, got {:?}",
        report.stage_status(stage)
    );
}

/// Asserts that no stage is left Pending, Ready or Running.
pub fn assert_terminal_statuses(report: &BuildStatusReport) {
    for stage in &report.stages {
        assert!(
            stage.status.is_terminal(),
            "Stage '{}' is still {:?} in build {}",
            stage.name,
            stage.status,
            report.build_id
        );
    }
}

/// Asserts that `first` occurs before `second` in `order`.
pub fn assert_precedes(order: &[&str], first: &str, second: &str) {
    let position = |name: &str| {
        order
            .iter()
            .position(|n| *n == name)
            .unwrap_or_else(|| panic!("'{name}' not found in {order:?}"))
    };
    assert!(
        position(first) < position(second),
        "Expected '{first}' before '{second}' in {order:?}"
    );
}

/// Asserts that every `stage.started` event comes after `stage.completed`
/// for each of the stage's dependencies.
pub fn assert_dependencies_completed_first(events: &[BuildEvent], definitions: &[StageDefinition]) {
    let sequence_of = |kind: EventKind, stage: &str| {
        events
            .iter()
            .find(|e| e.kind == kind && e.stage_name.as_deref() == Some(stage))
            .map(|e| e.sequence)
    };

    for definition in definitions {
        let Some(started) = sequence_of(EventKind::StageStarted, &definition.name) else {
            continue;
        };
        for dependency in &definition.dependencies {
            let completed = sequence_of(EventKind::StageCompleted, dependency);
            assert!(
                completed.is_some_and(|c| c < started),
                "Stage '{}' started at #{started} before dependency '{dependency}' completed ({completed:?})",
                definition.name
            );
        }
    }
}

/// Returns the largest number of stages running at once, counting a stage
/// from its `stage.started` event to its `stage.completed` or `stage.failed`
/// event. `events` must be sorted by sequence.
pub fn max_running(events: &[BuildEvent]) -> usize {
    let mut running = HashSet::new();
    let mut peak = 0;
    for event in events {
        let Some(stage) = event.stage_name.as_deref() else {
            continue;
        };
        match event.kind {
            EventKind::StageStarted => {
                running.insert(stage);
                peak = peak.max(running.len());
            }
            EventKind::StageCompleted | EventKind::StageFailed => {
                running.remove(stage);
            }
            _ => {}
        }
    }
    peak
}

/// Asserts that no more than `limit` stages ran at once.
pub fn assert_concurrency_within(events: &[BuildEvent], limit: usize) {
    let peak = max_running(events);
    assert!(peak <= limit, "{peak} stages ran at once with a limit of {limit}");
}
