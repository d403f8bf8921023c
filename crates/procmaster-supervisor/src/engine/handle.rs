//! LifecycleEngine handle - the public API of the engine.
//!
//! The handle is cheap to clone; every method sends a command to the actor
//! and awaits its answer.

use super::commands::EngineCommand;
use super::types::{EngineState, MonitStatus, ProcessInfo, Result};
use procmaster_common::{ProcessSpec, SupervisorError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

#[derive(Clone)]
pub struct LifecycleEngine {
    pub(super) cmd_tx: mpsc::Sender<EngineCommand>,
    /// Bound applied to the lifecycle operations sent through this handle
    pub(super) deadline: Option<Duration>,
}

impl LifecycleEngine {
    fn map_send_err(context: &str) -> SupervisorError {
        SupervisorError::unavailable(format!("{}: engine unavailable (channel closed)", context))
    }

    fn map_recv_err(context: &str) -> SupervisorError {
        SupervisorError::unavailable(format!("{}: engine dropped response", context))
    }

    /// A handle whose lifecycle operations are bounded by `deadline` in
    /// addition to the configured timeouts.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    async fn request<T>(
        &self,
        context: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| Self::map_send_err(context))?;
        rx.await.map_err(|_| Self::map_recv_err(context))
    }

    /// Send a lifecycle operation on `name` and wait for its answer, at most
    /// until this handle's deadline. The deadline covers time spent queued
    /// behind other operations on the record; the operation itself is not
    /// withdrawn when the caller stops waiting.
    async fn lifecycle_request(
        &self,
        context: &str,
        name: &str,
        launches: bool,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> EngineCommand,
    ) -> Result<()> {
        let Some(deadline) = self.deadline else {
            return self.request(context, build).await?;
        };
        match tokio::time::timeout(deadline, self.request(context, build)).await {
            Ok(answer) => answer?,
            Err(_) => {
                let reason = format!(
                    "{} not confirmed within caller deadline {:?}",
                    context, deadline
                );
                Err(if launches {
                    SupervisorError::launch_failed(name, reason)
                } else {
                    SupervisorError::termination_failed(name, reason)
                })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Create a record for `spec` and launch it.
    ///
    /// Returns once the launch is confirmed or has failed. A failed launch
    /// leaves the record in place as `Crashed`.
    ///
    /// # Errors
    /// - `DuplicateName` if a record with the same name exists
    /// - `InvalidRequest` if `spec` is malformed
    /// - `LaunchFailed` if the OS could not create the process
    /// - `OperationNotAllowed` after shutdown
    pub async fn start_go_bin(&self, spec: ProcessSpec) -> Result<()> {
        let deadline = self.deadline;
        let name = spec.name.clone();
        self.lifecycle_request("start_go_bin", &name, true, |resp| EngineCommand::Launch {
            spec,
            deadline,
            resp,
        })
        .await
    }

    /// Launch an existing record that is not running.
    ///
    /// Queued behind any operation already running on the record.
    ///
    /// # Errors
    /// - `NotFound`, `AlreadyRunning`, `LaunchFailed`, `OperationNotAllowed`
    pub async fn start_process(&self, name: &str) -> Result<()> {
        let deadline = self.deadline;
        self.lifecycle_request("start_process", name, true, |resp| EngineCommand::StartProcess {
            name: name.to_string(),
            deadline,
            resp,
        })
        .await
    }

    /// Terminate the live process, if any, and launch again.
    pub async fn restart_process(&self, name: &str) -> Result<()> {
        let deadline = self.deadline;
        self.lifecycle_request("restart_process", name, true, |resp| EngineCommand::RestartProcess {
            name: name.to_string(),
            deadline,
            resp,
        })
        .await
    }

    /// Terminate the live process and keep the record as `Stopped`.
    ///
    /// Idempotent. Cancels any scheduled keep-alive restart.
    pub async fn stop_process(&self, name: &str) -> Result<()> {
        let deadline = self.deadline;
        self.lifecycle_request("stop_process", name, false, |resp| EngineCommand::StopProcess {
            name: name.to_string(),
            deadline,
            resp,
        })
        .await
    }

    /// Terminate the live process and remove the record.
    ///
    /// The record is removed even when termination cannot be confirmed; the
    /// error is still reported.
    pub async fn delete_process(&self, name: &str) -> Result<()> {
        let deadline = self.deadline;
        self.lifecycle_request("delete_process", name, false, |resp| EngineCommand::DeleteProcess {
            name: name.to_string(),
            deadline,
            resp,
        })
        .await
    }

    /// Stop every record and refuse launches from now on.
    ///
    /// The actor keeps serving queries, stop and delete afterwards. It exits
    /// once every handle is dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.request("shutdown", |resp| EngineCommand::Shutdown { resp })
            .await?
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn process_info(&self, name: &str) -> Result<ProcessInfo> {
        self.request("process_info", |resp| EngineCommand::GetProcessInfo {
            name: name.to_string(),
            resp,
        })
        .await?
    }

    pub async fn monit_status(&self) -> Result<MonitStatus> {
        self.request("monit_status", |resp| EngineCommand::GetMonitStatus { resp })
            .await
    }

    /// Definitions of every record, for persistence.
    pub async fn specs(&self) -> Result<Vec<ProcessSpec>> {
        self.request("specs", |resp| EngineCommand::Specs { resp }).await
    }

    /// Reports `Stopped` if the actor is gone.
    pub async fn state(&self) -> EngineState {
        self.request("state", |resp| EngineCommand::GetEngineState { resp })
            .await
            .unwrap_or(EngineState::Stopped)
    }

    #[cfg(test)]
    pub(super) async fn hold(&self, name: &str, duration: Duration) -> Result<()> {
        self.request("hold", |resp| EngineCommand::Hold {
            name: name.to_string(),
            duration,
            resp,
        })
        .await?
    }
}
