//! ProcessControlImpl - ProcessControl backed by a real child process.
//!
//! Each launch hands the `Child` to an exit watcher task. The watcher owns
//! the handle, reaps the child (no zombies on Unix), publishes an
//! [`ExitEvent`] and resolves to the [`ExitReport`]. Termination waits on
//! that task, which is the strongest exit confirmation available since pids
//! can be reused.

use crate::control::{
    next_launch_id, ControlConfig, ControlFactory, ExitEvent, ExitReport, LaunchInfo,
    ProcessControl,
};
use async_trait::async_trait;
use chrono::Utc;
use procmaster_common::{ProcessSpec, SupervisorError, SupervisorResult};
use procmaster_process::{process_exists, spawn_process, terminate_gracefully};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// The launch currently owned by a control.
struct LiveInstance {
    pid: u32,
    launch_id: u64,
    /// Asks the watcher to kill the child. Dropping it has the same effect.
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<ExitReport>,
}

/// Process control for one record.
pub struct ProcessControlImpl {
    spec: ProcessSpec,
    config: ControlConfig,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    current: Option<LiveInstance>,
    last_exit: Option<ExitReport>,
}

impl ProcessControlImpl {
    pub fn new(
        spec: ProcessSpec,
        config: ControlConfig,
        exit_tx: mpsc::UnboundedSender<ExitEvent>,
    ) -> Self {
        Self {
            spec,
            config,
            exit_tx,
            current: None,
            last_exit: None,
        }
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    /// Collect the outcome of a finished watcher.
    ///
    /// A watcher that did not finish cleanly gives no confirmation; fall back
    /// to a pid check.
    fn settle(
        &mut self,
        pid: u32,
        joined: Result<ExitReport, JoinError>,
    ) -> SupervisorResult<()> {
        match joined {
            Ok(report) => {
                self.last_exit = Some(report);
                Ok(())
            }
            Err(e) => {
                warn!("Exit watcher for {} failed: {}", self.spec.name, e);
                match process_exists(pid) {
                    Ok(false) => Ok(()),
                    Ok(true) => Err(SupervisorError::termination_failed(
                        &self.spec.name,
                        format!("exit watcher failed and pid {} is still alive", pid),
                    )),
                    Err(check) => Err(SupervisorError::termination_failed(
                        &self.spec.name,
                        format!("exit watcher failed and pid check failed: {}", check),
                    )),
                }
            }
        }
    }

    fn spawn_exit_watcher(
        &self,
        mut child: Child,
        pid: u32,
        launch_id: u64,
        kill_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<ExitReport> {
        let name = self.spec.name.clone();
        let exit_tx = self.exit_tx.clone();

        tokio::spawn(async move {
            debug!("Exit watcher started for {} (pid {})", name, pid);

            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill {} (pid {}): {}", name, pid, e);
                    }
                    child.wait().await
                }
            };

            if let Err(ref e) = status {
                error!("Failed to wait for {} (pid {}): {}", name, pid, e);
            }
            let report = ExitReport::from_status(status);
            info!("Process {} (pid {}) exited: {}", name, pid, report);

            let event = ExitEvent {
                name: name.clone(),
                launch_id,
                pid,
                report: report.clone(),
            };
            if exit_tx.send(event).is_err() {
                debug!("Exit listener gone; dropping exit event for {}", name);
            }

            report
        })
    }
}

#[async_trait]
impl ProcessControl for ProcessControlImpl {
    async fn start(&mut self) -> SupervisorResult<LaunchInfo> {
        if let Some(live) = &self.current {
            if !live.monitor.is_finished() {
                return Err(SupervisorError::already_running(
                    self.name(),
                    Some(live.pid),
                ));
            }
        }

        // Reap the previous launch before replacing it.
        if let Some(previous) = self.current.take() {
            let joined = previous.monitor.await;
            if let Err(e) = self.settle(previous.pid, joined) {
                warn!("Previous launch of {} not confirmed gone: {}", self.spec.name, e);
            }
        }

        info!("Launching {} ({})", self.spec.name, self.spec.source_path);
        let child = spawn_process(
            &self.spec.name,
            &self.spec.source_path,
            &self.spec.args,
            &self.config.output,
        )?;

        let pid = child.id().ok_or_else(|| {
            SupervisorError::launch_failed(self.name(), "process exited before its pid was read")
        })?;

        let launch_id = next_launch_id();
        let started_at = Utc::now();
        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = self.spawn_exit_watcher(child, pid, launch_id, kill_rx);

        self.current = Some(LiveInstance {
            pid,
            launch_id,
            kill_tx: Some(kill_tx),
            monitor,
        });

        info!("Process {} running (pid {}, launch {})", self.spec.name, pid, launch_id);
        Ok(LaunchInfo {
            pid,
            launch_id,
            started_at,
        })
    }

    async fn stop(&mut self) -> SupervisorResult<()> {
        let mut live = match self.current.take() {
            Some(live) => live,
            None => {
                debug!("Nothing to stop for {}", self.spec.name);
                return Ok(());
            }
        };

        if live.monitor.is_finished() {
            let joined = live.monitor.await;
            return self.settle(live.pid, joined);
        }

        info!(
            "Stopping {} (pid {}, launch {})",
            self.spec.name, live.pid, live.launch_id
        );

        match terminate_gracefully(&self.spec.name, live.pid) {
            Ok(()) => match timeout(self.config.graceful_timeout, &mut live.monitor).await {
                Ok(joined) => {
                    info!("Process {} terminated gracefully", self.spec.name);
                    return self.settle(live.pid, joined);
                }
                Err(_) => warn!(
                    "Graceful stop timed out for {} (pid {}) after {:?}, killing",
                    self.spec.name, live.pid, self.config.graceful_timeout
                ),
            },
            Err(e) => warn!("Graceful stop unavailable for {}: {}", self.spec.name, e),
        }

        if let Some(kill_tx) = live.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        match timeout(self.config.force_kill_timeout, &mut live.monitor).await {
            Ok(joined) => {
                info!("Process {} terminated after kill", self.spec.name);
                self.settle(live.pid, joined)
            }
            Err(_) => {
                let pid = live.pid;
                self.current = Some(live);
                Err(SupervisorError::termination_failed(
                    &self.spec.name,
                    format!(
                        "pid {} did not exit within {:?} of SIGTERM plus {:?} of kill",
                        pid, self.config.graceful_timeout, self.config.force_kill_timeout
                    ),
                ))
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.current
            .as_ref()
            .filter(|live| !live.monitor.is_finished())
            .map(|live| live.pid)
    }

    fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    fn last_exit(&self) -> Option<ExitReport> {
        self.last_exit.clone()
    }
}

/// Builds [`ProcessControlImpl`]s that share one [`ControlConfig`].
#[derive(Debug, Clone, Default)]
pub struct OsControlFactory {
    config: ControlConfig,
}

impl OsControlFactory {
    pub fn new(config: ControlConfig) -> Self {
        Self { config }
    }
}

impl ControlFactory for OsControlFactory {
    fn create(
        &self,
        spec: &ProcessSpec,
        exit_tx: mpsc::UnboundedSender<ExitEvent>,
    ) -> Box<dyn ProcessControl> {
        Box::new(ProcessControlImpl::new(
            spec.clone(),
            self.config.clone(),
            exit_tx,
        ))
    }
}
