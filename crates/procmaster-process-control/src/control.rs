//! ProcessControl trait and the values it exchanges with the supervisor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use procmaster_common::{ProcessSpec, SupervisorResult};
use procmaster_process::OutputRoute;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

static LAUNCH_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique launch id.
///
/// Every successful launch gets a fresh id so that an exit event can be
/// matched against the launch it belongs to.
pub fn next_launch_id() -> u64 {
    LAUNCH_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Controls the lifecycle of the OS process behind one record.
///
/// At most one live child exists per control. The control never decides
/// about restarts; it reports exits through the [`ExitEvent`] channel it was
/// created with and leaves the decision to the supervisor.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Launch the process.
    ///
    /// Fails with `AlreadyRunning` if the previous launch is still alive and
    /// with `LaunchFailed` if the OS refuses to create the process.
    async fn start(&mut self) -> SupervisorResult<LaunchInfo>;

    /// Terminate the live process, gracefully first, forcefully after the
    /// graceful timeout. A no-op when nothing is running.
    ///
    /// Fails with `TerminationFailed` when the exit cannot be confirmed.
    async fn stop(&mut self) -> SupervisorResult<()>;

    /// PID of the live process.
    fn pid(&self) -> Option<u32>;

    /// Whether the last launch is still alive.
    fn is_running(&self) -> bool;

    /// The most recent exit this control has reaped.
    fn last_exit(&self) -> Option<ExitReport>;
}

/// Creates controls for new records.
pub trait ControlFactory: Send + Sync {
    fn create(
        &self,
        spec: &ProcessSpec,
        exit_tx: mpsc::UnboundedSender<ExitEvent>,
    ) -> Box<dyn ProcessControl>;
}

/// Timeouts and output routing shared by every control.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// How long to wait for an exit after SIGTERM.
    pub graceful_timeout: Duration,
    /// How long to wait for an exit after the forced kill.
    pub force_kill_timeout: Duration,
    pub output: OutputRoute,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            force_kill_timeout: Duration::from_secs(3),
            output: OutputRoute::Discard,
        }
    }
}

/// Result of a successful launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInfo {
    pub pid: u32,
    pub launch_id: u64,
    pub started_at: DateTime<Utc>,
}

/// How a child ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when killed by one (Unix only).
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

impl ExitReport {
    pub fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        let (code, signal) = match status {
            Ok(status) => {
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                #[cfg(not(unix))]
                let signal = None;
                (status.code(), signal)
            }
            Err(_) => (None, None),
        };

        Self {
            code,
            signal,
            at: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Sent by the exit watcher when a launched child ends, whatever the cause.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub name: String,
    pub launch_id: u64,
    pub pid: u32,
    pub report: ExitReport,
}
