//! Save and Resurrect: the bridge between the engine and the snapshot file.
//!
//! File I/O happens here, outside the engine actor; the actor only hands out
//! the current definitions and receives launches.

use crate::engine::LifecycleEngine;
use futures::future::join_all;
use procmaster_common::{EntryFailure, SupervisorError, SupervisorResult};
use procmaster_snapshot::{load_snapshot, save_snapshot, Snapshot, SnapshotLocator};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// Outcome of a resurrect in which every entry was handled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResurrectSummary {
    /// Entries launched from the snapshot.
    pub started: Vec<String>,
    /// Entries skipped because a record with the name already exists.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    locator: SnapshotLocator,
}

impl SnapshotStore {
    pub fn new(locator: SnapshotLocator) -> Self {
        Self { locator }
    }

    pub fn path(&self) -> PathBuf {
        self.locator.snapshot_path()
    }

    /// Write the definition of every record. Returns how many were saved.
    pub async fn save(&self, engine: &LifecycleEngine) -> SupervisorResult<usize> {
        let specs = engine.specs().await?;
        let snapshot = Snapshot::from_specs(&specs);
        save_snapshot(&self.path(), &snapshot).await?;
        Ok(specs.len())
    }

    /// Launch every entry of the snapshot.
    ///
    /// Entries whose name is already supervised are skipped. The remaining
    /// entries are launched concurrently; entries that fail to launch stay as
    /// `Crashed` records and are reported together in a `Resurrect` error,
    /// which also names the entries that did start or were skipped.
    pub async fn resurrect(&self, engine: &LifecycleEngine) -> SupervisorResult<ResurrectSummary> {
        let path = self.path();
        let snapshot = load_snapshot(&path).await?;
        let specs = snapshot.into_specs();
        info!(
            "Resurrecting {} process(es) from {}",
            specs.len(),
            path.display()
        );

        let launches = specs.into_iter().map(|spec| async move {
            let name = spec.name.clone();
            let result = engine.start_go_bin(spec).await;
            (name, result)
        });

        let mut summary = ResurrectSummary::default();
        let mut failures = Vec::new();
        for (name, result) in join_all(launches).await {
            match result {
                Ok(()) => summary.started.push(name),
                Err(SupervisorError::DuplicateName { .. }) => {
                    info!("Process {} already supervised, skipping", name);
                    summary.skipped.push(name);
                }
                Err(e) => {
                    warn!("Failed to resurrect {}: {}", name, e);
                    failures.push(EntryFailure {
                        name,
                        error: Box::new(e),
                    });
                }
            }
        }

        if !failures.is_empty() {
            warn!(
                "Resurrect incomplete: {} failed, {} started, {} skipped",
                failures.len(),
                summary.started.len(),
                summary.skipped.len()
            );
            return Err(SupervisorError::Resurrect {
                failures,
                started: summary.started,
                skipped: summary.skipped,
            });
        }

        info!(
            "Resurrect complete: {} started, {} skipped",
            summary.started.len(),
            summary.skipped.len()
        );
        Ok(summary)
    }
}
