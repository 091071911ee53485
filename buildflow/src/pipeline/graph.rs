//! The stage graph model.
//!
//! A [`StageGraph`] owns one [`StageInstance`] per definition plus the
//! dependency edges between them. It is the single source of truth for stage
//! status within a build: every status change goes through [`StageGraph::mark`],
//! which enforces legal transitions and propagates skips to dependents.

use super::definition::StageDefinition;
use crate::core::{OutputHandle, StageStatus, TerminationReason};
use crate::errors::{ConfigError, GraphError};
use crate::utils::timestamps::elapsed_between;
use crate::utils::{now_utc, Timestamp};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// The runtime state of one stage within one build.
#[derive(Debug, Clone, Serialize)]
pub struct StageInstance {
    /// The immutable definition.
    pub definition: StageDefinition,
    /// Current status.
    pub status: StageStatus,
    /// When the stage started running.
    pub start_time: Option<Timestamp>,
    /// When the stage reached a terminal status.
    pub end_time: Option<Timestamp>,
    /// Exit code of the stage process.
    pub exit_code: Option<i32>,
    /// How the stage process ended.
    pub termination: Option<TerminationReason>,
    /// Why the stage failed or was skipped.
    pub reason: Option<String>,
    /// Captured output.
    pub output: OutputHandle,
}

impl StageInstance {
    fn new(definition: StageDefinition) -> Self {
        Self {
            definition,
            status: StageStatus::Pending,
            start_time: None,
            end_time: None,
            exit_code: None,
            termination: None,
            reason: None,
            output: OutputHandle::default(),
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Returns the run duration in seconds, if the stage ran.
    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        let (start, end) = (self.start_time?, self.end_time?);
        Some(elapsed_between(&start, &end).as_secs_f64())
    }
}

/// Status counts across the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Pending or Ready.
    pub waiting: usize,
    /// Running.
    pub running: usize,
    /// Completed.
    pub completed: usize,
    /// Failed.
    pub failed: usize,
    /// Skipped.
    pub skipped: usize,
    /// Rolled back.
    pub rolled_back: usize,
}

/// A validated, acyclic graph of stages.
#[derive(Debug, Clone)]
pub struct StageGraph {
    instances: Vec<StageInstance>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    topo_order: Vec<usize>,
}

impl StageGraph {
    /// Validates definitions and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the list is empty, a name repeats, a stage
    /// depends on itself or on an unknown stage, or the dependencies form a
    /// cycle.
    pub fn load(definitions: Vec<StageDefinition>) -> Result<Self, ConfigError> {
        if definitions.is_empty() {
            return Err(ConfigError::EmptyGraph);
        }

        let mut index = HashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            if index.insert(def.name.clone(), i).is_some() {
                return Err(ConfigError::duplicate(&def.name));
            }
        }

        let mut dependencies = vec![Vec::new(); definitions.len()];
        let mut dependents = vec![Vec::new(); definitions.len()];
        for (i, def) in definitions.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &def.dependencies {
                if dep == &def.name {
                    return Err(ConfigError::SelfDependency {
                        stage: def.name.clone(),
                    });
                }
                let Some(&j) = index.get(dep) else {
                    return Err(ConfigError::unknown_dependency(&def.name, dep));
                };
                if seen.insert(j) {
                    dependencies[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        if let Some(cycle) = detect_cycle(&definitions, &dependencies) {
            return Err(ConfigError::cycle(cycle));
        }

        let topo_order = topological_sort(&definitions, &dependencies, &dependents);
        let instances = definitions.into_iter().map(StageInstance::new).collect();

        Ok(Self {
            instances,
            index,
            dependencies,
            dependents,
            topo_order,
        })
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if the graph has no stages. Never true for a loaded graph.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Returns a stage instance by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageInstance> {
        self.index.get(name).map(|&i| &self.instances[i])
    }

    /// Returns a stage's status.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<StageStatus> {
        self.get(name).map(|i| i.status)
    }

    /// Returns all instances in declaration order.
    pub fn instances(&self) -> impl Iterator<Item = &StageInstance> {
        self.instances.iter()
    }

    /// Returns the stage names in topological order.
    ///
    /// Ties are broken by `order`, then declaration index.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .map(|&i| self.instances[i].name())
            .collect()
    }

    /// Returns the direct dependencies of a stage.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.index.get(name).map_or_else(Vec::new, |&i| {
            self.dependencies[i]
                .iter()
                .map(|&d| self.instances[d].name())
                .collect()
        })
    }

    /// Returns the Pending or Ready stages whose dependencies are all
    /// Completed, in admission order.
    #[must_use]
    pub fn ready_set(&self) -> Vec<String> {
        let mut ready: Vec<usize> = (0..self.instances.len())
            .filter(|&i| self.instances[i].status.is_waiting() && self.deps_completed(i))
            .collect();
        ready.sort_by_key(|&i| (self.instances[i].definition.order, i));
        ready
            .into_iter()
            .map(|i| self.instances[i].definition.name.clone())
            .collect()
    }

    /// Moves every Pending stage whose dependencies completed to Ready and
    /// returns the names that changed.
    pub fn promote_ready(&mut self) -> Vec<String> {
        let mut promoted = Vec::new();
        for i in 0..self.instances.len() {
            if self.instances[i].status == StageStatus::Pending && self.deps_completed(i) {
                self.instances[i].status = StageStatus::Ready;
                promoted.push(self.instances[i].definition.name.clone());
            }
        }
        promoted
    }

    /// Applies a status transition.
    ///
    /// Moving a stage to Failed or Skipped marks every transitive dependent
    /// that has not started as Skipped. Returns the names of the stages that
    /// were newly skipped this way, in breadth-first order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownStage`] for an unknown name and
    /// [`GraphError::InvalidTransition`] for an illegal transition, including
    /// Running while a dependency is not Completed.
    pub fn mark(&mut self, name: &str, status: StageStatus) -> Result<Vec<String>, GraphError> {
        let &i = self
            .index
            .get(name)
            .ok_or_else(|| GraphError::UnknownStage(name.to_string()))?;
        let from = self.instances[i].status;

        let deps_ok = status != StageStatus::Running || self.deps_completed(i);
        if !from.can_transition_to(status) || !deps_ok {
            return Err(GraphError::InvalidTransition {
                stage: name.to_string(),
                from,
                to: status,
            });
        }

        let now = now_utc();
        let instance = &mut self.instances[i];
        instance.status = status;
        match status {
            StageStatus::Running => instance.start_time = Some(now),
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped => {
                instance.end_time = Some(now);
            }
            _ => {}
        }

        if status.blocks_dependents() {
            Ok(self.skip_dependents(i))
        } else {
            Ok(Vec::new())
        }
    }

    /// Marks a stage Failed and records why.
    pub fn mark_failed(
        &mut self,
        name: &str,
        reason: impl Into<String>,
    ) -> Result<Vec<String>, GraphError> {
        let skipped = self.mark(name, StageStatus::Failed)?;
        if let Some(&i) = self.index.get(name) {
            self.instances[i].reason = Some(reason.into());
        }
        Ok(skipped)
    }

    /// Marks every stage that has not started as Skipped with the given
    /// reason and returns their names.
    pub fn skip_remaining(&mut self, reason: &str) -> Vec<String> {
        let now = now_utc();
        let mut skipped = Vec::new();
        for instance in &mut self.instances {
            if instance.status.is_waiting() {
                instance.status = StageStatus::Skipped;
                instance.end_time = Some(now);
                instance.reason = Some(reason.to_string());
                skipped.push(instance.definition.name.clone());
            }
        }
        skipped
    }

    /// Records the supervisor's observations for a stage.
    pub fn record_execution(
        &mut self,
        name: &str,
        exit_code: Option<i32>,
        termination: TerminationReason,
        output: OutputHandle,
    ) -> Result<(), GraphError> {
        let &i = self
            .index
            .get(name)
            .ok_or_else(|| GraphError::UnknownStage(name.to_string()))?;
        let instance = &mut self.instances[i];
        instance.exit_code = exit_code;
        instance.termination = Some(termination);
        instance.output = output;
        Ok(())
    }

    /// Returns the Completed stages in reverse topological order.
    #[must_use]
    pub fn rollback_order(&self) -> Vec<String> {
        self.topo_order
            .iter()
            .rev()
            .filter(|&&i| self.instances[i].status == StageStatus::Completed)
            .map(|&i| self.instances[i].definition.name.clone())
            .collect()
    }

    /// Counts stages by status.
    #[must_use]
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for instance in &self.instances {
            match instance.status {
                StageStatus::Pending | StageStatus::Ready => counts.waiting += 1,
                StageStatus::Running => counts.running += 1,
                StageStatus::Completed => counts.completed += 1,
                StageStatus::Failed => counts.failed += 1,
                StageStatus::Skipped => counts.skipped += 1,
                StageStatus::RolledBack => counts.rolled_back += 1,
            }
        }
        counts
    }

    /// Returns true if no stage is Pending, Ready or Running.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        let counts = self.counts();
        counts.waiting == 0 && counts.running == 0
    }

    /// Returns true if every stage Completed.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.instances
            .iter()
            .all(|i| i.status == StageStatus::Completed)
    }

    /// Returns `(name, status)` pairs in declaration order.
    #[must_use]
    pub fn statuses(&self) -> Vec<(String, StageStatus)> {
        self.instances
            .iter()
            .map(|i| (i.definition.name.clone(), i.status))
            .collect()
    }

    fn deps_completed(&self, i: usize) -> bool {
        self.dependencies[i]
            .iter()
            .all(|&d| self.instances[d].status == StageStatus::Completed)
    }

    fn skip_dependents(&mut self, root: usize) -> Vec<String> {
        let cause = format!(
            "dependency '{}' {}",
            self.instances[root].definition.name, self.instances[root].status
        );
        let now = now_utc();
        let mut skipped = Vec::new();
        let mut visited = HashSet::from([root]);
        let mut queue: VecDeque<usize> = self.dependents[root].iter().copied().collect();

        while let Some(i) = queue.pop_front() {
            if !visited.insert(i) {
                continue;
            }
            let instance = &mut self.instances[i];
            if instance.status.is_waiting() {
                instance.status = StageStatus::Skipped;
                instance.end_time = Some(now);
                instance.reason = Some(cause.clone());
                skipped.push(instance.definition.name.clone());
            }
            queue.extend(self.dependents[i].iter().copied());
        }

        skipped
    }
}

/// Finds a dependency cycle and returns its path, first node repeated last.
fn detect_cycle(definitions: &[StageDefinition], dependencies: &[Vec<usize>]) -> Option<Vec<String>> {
    let mut visited = vec![false; definitions.len()];
    let mut on_stack = vec![false; definitions.len()];
    let mut path = Vec::new();

    for start in 0..definitions.len() {
        if !visited[start] {
            if let Some(cycle) = dfs_cycle(start, dependencies, &mut visited, &mut on_stack, &mut path) {
                return Some(
                    cycle
                        .into_iter()
                        .map(|i| definitions[i].name.clone())
                        .collect(),
                );
            }
        }
    }
    None
}

fn dfs_cycle(
    node: usize,
    dependencies: &[Vec<usize>],
    visited: &mut [bool],
    on_stack: &mut [bool],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited[node] = true;
    on_stack[node] = true;
    path.push(node);

    for &dep in &dependencies[node] {
        if !visited[dep] {
            if let Some(cycle) = dfs_cycle(dep, dependencies, visited, on_stack, path) {
                return Some(cycle);
            }
        } else if on_stack[dep] {
            if let Some(start) = path.iter().position(|&n| n == dep) {
                let mut cycle = path[start..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
        }
    }

    path.pop();
    on_stack[node] = false;
    None
}

/// Kahn's algorithm with `(order, declaration index)` as the tie-break.
fn topological_sort(
    definitions: &[StageDefinition],
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Vec<usize> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut heap: BinaryHeap<Reverse<(i64, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse((definitions[i].order, i)))
        .collect();

    let mut order = Vec::with_capacity(definitions.len());
    while let Some(Reverse((_, i))) = heap.pop() {
        order.push(i);
        for &child in &dependents[i] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                heap.push(Reverse((definitions[child].order, child)));
            }
        }
    }
    order
}
