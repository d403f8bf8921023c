//! Shared data types for the lifecycle engine.
//!
//! Public query results live next to the crate-internal bookkeeping of the
//! actor (`ProcessRecord`, `OpRequest`, batches).

use crate::lifecycle::RestartTracker;
use chrono::{DateTime, Utc};
use procmaster_common::ProcessSpec;
use procmaster_process_control::{ExitEvent, ExitReport, LaunchInfo, ProcessControl};
use procmaster_process_state::{ProcessStatus, StatusMachine};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::warn;

// ============================================================================
// Public Types
// ============================================================================

/// Overall engine state.
///
/// `Stopped` is terminal: launches are refused, stop/delete and queries keep
/// working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Running,
    Stopping,
    Stopped,
}

impl EngineState {
    pub fn accepts_launches(&self) -> bool {
        matches!(self, EngineState::Running)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One row of [`MonitStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatusEntry {
    /// Present only while the record is `Running`.
    pub pid: Option<u32>,
    pub name: String,
    pub status: ProcessStatus,
    pub keep_alive: bool,
}

/// Status report of every record, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitStatus {
    pub procs: Vec<ProcessStatusEntry>,
}

impl MonitStatus {
    pub fn get(&self, name: &str) -> Option<&ProcessStatusEntry> {
        self.procs.iter().find(|p| p.name == name)
    }
}

/// Detailed view of a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub name: String,
    pub source_path: String,
    pub args: Vec<String>,
    pub keep_alive: bool,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    /// Relaunches after the initial launch.
    pub restart_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitReport>,
    pub last_error: Option<String>,
}

// ============================================================================
// Crate-Internal Types
// ============================================================================

pub(super) type Result<T> = procmaster_common::SupervisorResult<T>;

pub(super) type Responder = oneshot::Sender<Result<()>>;

/// Kind of operation being performed on a record
#[derive(Debug, Clone, PartialEq)]
pub(super) enum OpKind {
    /// First launch of a new record
    Launch,
    /// Launch an existing record again
    Start,
    /// Terminate then launch. `automatic` marks keep-alive restarts.
    Restart { automatic: bool },
    Stop,
    /// Terminate then remove the record
    Delete,
    /// Test-only sleep to keep a record busy
    #[cfg(test)]
    Hold(Duration),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Launch => "launch",
            OpKind::Start => "start",
            OpKind::Restart { automatic: false } => "restart",
            OpKind::Restart { automatic: true } => "auto_restart",
            OpKind::Stop => "stop",
            OpKind::Delete => "delete",
            #[cfg(test)]
            OpKind::Hold(_) => "hold",
        }
    }

    /// Ends in a fresh launch.
    pub fn launches(&self) -> bool {
        matches!(self, OpKind::Launch | OpKind::Start | OpKind::Restart { .. })
    }

    pub fn is_automatic(&self) -> bool {
        matches!(self, OpKind::Restart { automatic: true })
    }

    /// The intent a user request expresses. Automatic restarts express none.
    pub fn intent(&self) -> Option<Intent> {
        match self {
            OpKind::Launch | OpKind::Start | OpKind::Restart { automatic: false } => {
                Some(Intent::Run)
            }
            OpKind::Stop | OpKind::Delete => Some(Intent::Stop),
            _ => None,
        }
    }
}

/// What the user last asked for. An automatic restart only goes ahead while
/// the intent is `Run`, so a stop or delete always wins over a pending restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Intent {
    Run,
    Stop,
}

/// A queued operation request waiting to be executed
pub(super) struct OpRequest {
    pub kind: OpKind,
    pub resp: Option<Responder>,
    pub batch_id: Option<u64>,
    pub deadline: Option<Duration>,
}

/// Currently in-flight operation for a record
pub(super) struct InFlightOp {
    pub kind: OpKind,
    pub resp: Option<Responder>,
    pub batch_id: Option<u64>,
}

/// One supervised process record.
///
/// `control` is `None` while an operation holds it in the pool.
pub(super) struct ProcessRecord {
    pub spec: ProcessSpec,
    pub status: StatusMachine,
    pub control: Option<Box<dyn ProcessControl>>,
    pub in_flight: Option<InFlightOp>,
    pub pending_ops: VecDeque<OpRequest>,
    /// Exits observed while an operation was in flight.
    pub deferred_exits: Vec<ExitEvent>,
    pub intent: Intent,
    pub pid: Option<u32>,
    pub launch_id: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub restart_due: Option<Instant>,
    pub tracker: RestartTracker,
    pub last_exit: Option<ExitReport>,
    pub last_error: Option<String>,
}

impl ProcessRecord {
    pub fn new(spec: ProcessSpec, control: Box<dyn ProcessControl>) -> Self {
        let status = StatusMachine::new(&spec.name);
        Self {
            spec,
            status,
            control: Some(control),
            in_flight: None,
            pending_ops: VecDeque::new(),
            deferred_exits: Vec::new(),
            intent: Intent::Run,
            pid: None,
            launch_id: None,
            started_at: None,
            restart_count: 0,
            restart_due: None,
            tracker: RestartTracker::new(),
            last_exit: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn busy_op_name(&self) -> Option<&'static str> {
        self.in_flight.as_ref().map(|op| op.kind.name())
    }

    pub fn current_status(&self) -> ProcessStatus {
        self.status.current()
    }

    /// Transition, logging instead of failing when the move is not allowed.
    pub fn set_status(&mut self, target: ProcessStatus, reason: &str) {
        if let Err(e) = self.status.transition_to(target, reason.to_string()) {
            warn!("Ignoring status change for {}: {}", self.spec.name, e);
        }
    }

    pub fn mark_running(&mut self, launch: &LaunchInfo, now: Instant) {
        self.pid = Some(launch.pid);
        self.launch_id = Some(launch.launch_id);
        self.started_at = Some(launch.started_at);
        self.restart_due = None;
        self.last_error = None;
        self.tracker.record_launch(now);
        self.set_status(ProcessStatus::Running, "launched");
    }

    /// Forget the live process. Exit events of its launch become stale.
    pub fn clear_live(&mut self) {
        self.pid = None;
        self.launch_id = None;
        self.restart_due = None;
    }

    pub fn status_entry(&self) -> ProcessStatusEntry {
        let status = self.current_status();
        ProcessStatusEntry {
            pid: if status == ProcessStatus::Running { self.pid } else { None },
            name: self.spec.name.clone(),
            status,
            keep_alive: self.spec.keep_alive,
        }
    }

    pub fn info(&self) -> ProcessInfo {
        let status = self.current_status();
        ProcessInfo {
            name: self.spec.name.clone(),
            source_path: self.spec.source_path.clone(),
            args: self.spec.args.clone(),
            keep_alive: self.spec.keep_alive,
            status,
            pid: if status == ProcessStatus::Running { self.pid } else { None },
            restart_count: self.restart_count,
            started_at: self.started_at,
            last_exit: self.last_exit.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

// ============================================================================
// Batch Tracking
// ============================================================================

/// Outstanding shutdown batch
pub(super) struct PendingBatch {
    pub pending_count: usize,
    pub failed: Vec<String>,
    pub resp: Option<Responder>,
}
