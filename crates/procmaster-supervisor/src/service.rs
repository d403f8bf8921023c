//! Supervisor service: the operations a remote client can invoke.
//!
//! Each request maps onto exactly one engine or persistence operation. The
//! service does no recovery of its own; errors travel back to the caller with
//! their kind and context intact.

use crate::config::SupervisorConfig;
use crate::engine::{LifecycleEngine, MonitStatus, ProcessInfo};
use crate::persistence::{ResurrectSummary, SnapshotStore};
use procmaster_common::{ProcessSpec, SupervisorResult};
use procmaster_process::{validate_name, validate_spec};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct SupervisorService {
    engine: LifecycleEngine,
    store: SnapshotStore,
}

impl SupervisorService {
    /// Start an engine for real OS processes and wrap it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            engine: LifecycleEngine::new(config),
            store: SnapshotStore::new(config.snapshot_locator()),
        }
    }

    pub fn with_engine(engine: LifecycleEngine, store: SnapshotStore) -> Self {
        Self { engine, store }
    }

    /// A service whose lifecycle calls give up after `deadline`.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            engine: self.engine.with_deadline(deadline),
            store: self.store.clone(),
        }
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.store
    }

    pub async fn start_go_bin(
        &self,
        source_path: impl Into<String>,
        name: impl Into<String>,
        keep_alive: bool,
        args: Vec<String>,
    ) -> SupervisorResult<()> {
        let spec = ProcessSpec::new(name, source_path)
            .with_keep_alive(keep_alive)
            .with_args(args);
        validate_spec(&spec)?;

        info!(
            "StartGoBin {} ({}, keep_alive={})",
            spec.name, spec.source_path, spec.keep_alive
        );
        let name = spec.name.clone();
        self.engine
            .start_go_bin(spec)
            .await
            .inspect_err(|e| warn!("StartGoBin {} failed: {}", name, e))
    }

    pub async fn start_process(&self, name: &str) -> SupervisorResult<()> {
        validate_name(name)?;
        info!("StartProcess {}", name);
        self.engine
            .start_process(name)
            .await
            .inspect_err(|e| warn!("StartProcess {} failed: {}", name, e))
    }

    pub async fn restart_process(&self, name: &str) -> SupervisorResult<()> {
        validate_name(name)?;
        info!("RestartProcess {}", name);
        self.engine
            .restart_process(name)
            .await
            .inspect_err(|e| warn!("RestartProcess {} failed: {}", name, e))
    }

    pub async fn stop_process(&self, name: &str) -> SupervisorResult<()> {
        validate_name(name)?;
        info!("StopProcess {}", name);
        self.engine
            .stop_process(name)
            .await
            .inspect_err(|e| warn!("StopProcess {} failed: {}", name, e))
    }

    pub async fn delete_process(&self, name: &str) -> SupervisorResult<()> {
        validate_name(name)?;
        info!("DeleteProcess {}", name);
        self.engine
            .delete_process(name)
            .await
            .inspect_err(|e| warn!("DeleteProcess {} failed: {}", name, e))
    }

    pub async fn monit_status(&self) -> SupervisorResult<MonitStatus> {
        debug!("MonitStatus");
        self.engine.monit_status().await
    }

    pub async fn process_info(&self, name: &str) -> SupervisorResult<ProcessInfo> {
        validate_name(name)?;
        debug!("ProcessInfo {}", name);
        self.engine.process_info(name).await
    }

    /// Returns the number of saved records.
    pub async fn save(&self) -> SupervisorResult<usize> {
        info!("Save to {}", self.store.path().display());
        self.store
            .save(&self.engine)
            .await
            .inspect_err(|e| warn!("Save failed: {}", e))
    }

    pub async fn resurrect(&self) -> SupervisorResult<ResurrectSummary> {
        info!("Resurrect from {}", self.store.path().display());
        self.store
            .resurrect(&self.engine)
            .await
            .inspect_err(|e| warn!("Resurrect failed: {}", e))
    }

    pub async fn shutdown(&self) -> SupervisorResult<()> {
        info!("Shutting down supervisor");
        self.engine.shutdown().await
    }
}
