//! Registry of live process groups per build.
//!
//! Every spawned stage registers its process group here until it is reaped,
//! so a build can be force-cleaned from outside the task that owns the
//! child. With a state directory configured the registry also persists the
//! groups to `<state_dir>/<build_id>.json`, which lets a restarted engine
//! kill whatever a crashed one left behind. Records are written one at a
//! time, from a fresh snapshot, through a temp file and a rename.

use super::signals::{terminate_group, GroupTermination};
use crate::errors::BuildflowError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of terminating a build's process groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// The build.
    pub build_id: String,
    /// Groups that exited after SIGTERM.
    pub terminated: Vec<i32>,
    /// Groups that needed SIGKILL.
    pub killed: Vec<i32>,
    /// Groups that were already gone.
    pub already_gone: Vec<i32>,
}

impl CleanupReport {
    fn new(build_id: &str) -> Self {
        Self {
            build_id: build_id.to_string(),
            ..Self::default()
        }
    }

    /// Returns true if no live process was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty() && self.killed.is_empty()
    }

    fn record(&mut self, pgid: i32, outcome: GroupTermination) {
        match outcome {
            GroupTermination::AlreadyGone => self.already_gone.push(pgid),
            GroupTermination::Terminated => self.terminated.push(pgid),
            GroupTermination::Killed => self.killed.push(pgid),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedGroups {
    build_id: String,
    pgids: BTreeSet<i32>,
}

/// Live process groups keyed by build id.
#[derive(Debug)]
pub struct ProcessRegistry {
    groups: DashMap<String, BTreeSet<i32>>,
    state_dir: Option<PathBuf>,
    grace: Duration,
    // Held across snapshot and write so an older snapshot never lands last.
    persist_lock: Mutex<()>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessRegistry {
    /// Creates an in-memory registry using `grace` between SIGTERM and SIGKILL.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            state_dir: None,
            grace,
            persist_lock: Mutex::new(()),
        }
    }

    /// Persists registrations under `state_dir`.
    #[must_use]
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(state_dir.into());
        self
    }

    /// Returns the kill grace period.
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Records a live process group.
    pub async fn register(&self, build_id: &str, pgid: i32) {
        self.groups
            .entry(build_id.to_string())
            .or_default()
            .insert(pgid);
        debug!(build_id = %build_id, pgid, "Registered process group");
        self.persist(build_id).await;
    }

    /// Forgets a reaped process group.
    pub async fn unregister(&self, build_id: &str, pgid: i32) {
        let now_empty = self.groups.get_mut(build_id).is_some_and(|mut set| {
            set.remove(&pgid);
            set.is_empty()
        });
        if now_empty {
            self.groups.remove_if(build_id, |_, set| set.is_empty());
        }
        self.persist(build_id).await;
    }

    /// Returns the live groups of a build.
    #[must_use]
    pub fn groups(&self, build_id: &str) -> Vec<i32> {
        self.groups
            .get(build_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Terminates every group registered to a build. Idempotent.
    pub async fn terminate_build(&self, build_id: &str) -> CleanupReport {
        let mut report = CleanupReport::new(build_id);
        let pgids = self
            .groups
            .remove(build_id)
            .map(|(_, set)| set)
            .unwrap_or_default();

        for pgid in pgids {
            let outcome = terminate_group(pgid, self.grace).await;
            report.record(pgid, outcome);
        }
        self.persist(build_id).await;

        if !report.is_empty() {
            info!(
                build_id = %build_id,
                terminated = report.terminated.len(),
                killed = report.killed.len(),
                "Terminated lingering process groups"
            );
        }
        report
    }

    /// Kills process groups recorded by a previous engine instance and
    /// removes their records.
    pub async fn recover(state_dir: &Path, grace: Duration) -> Result<Vec<CleanupReport>, BuildflowError> {
        let mut reports = Vec::new();
        let mut entries = match tokio::fs::read_dir(state_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(reports),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            let persisted: PersistedGroups = match serde_json::from_str(&content) {
                Ok(p) => p,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable process record");
                    continue;
                }
            };

            let mut report = CleanupReport::new(&persisted.build_id);
            for pgid in persisted.pgids {
                report.record(pgid, terminate_group(pgid, grace).await);
            }
            tokio::fs::remove_file(&path).await?;
            info!(
                build_id = %report.build_id,
                killed = report.killed.len() + report.terminated.len(),
                "Recovered orphaned process groups"
            );
            reports.push(report);
        }
        Ok(reports)
    }

    async fn persist(&self, build_id: &str) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let pgids = self.groups.get(build_id).map(|s| s.value().clone()).unwrap_or_default();
        let record = PersistedGroups {
            build_id: build_id.to_string(),
            pgids,
        };
        let path = dir.join(format!("{build_id}.json"));

        let target = path.clone();
        let dir = dir.clone();
        let result = tokio::task::spawn_blocking(move || write_record(&dir, &target, &record))
            .await
            .map_err(std::io::Error::other)
            .and_then(|r| r);
        if let Err(e) = result {
            warn!(build_id = %build_id, path = %path.display(), error = %e, "Could not persist process groups");
        }
    }
}

fn write_record(dir: &Path, path: &Path, record: &PersistedGroups) -> std::io::Result<()> {
    if record.pgids.is_empty() {
        return match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }
    std::fs::create_dir_all(dir)?;
    let json = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, json)?;
    std::fs::rename(&staging, path)
}
