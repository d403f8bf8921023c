//! # procmaster process state
//!
//! The closed set of statuses a supervised process record can be in, and the
//! transition rules between them.
//!
//! ```text
//! Pending -> Running | Crashed | Stopped
//! Running -> Pending | Stopped | Crashed
//! Stopped -> Pending | Deleted
//! Crashed -> Pending | Stopped | Deleted
//! Deleted    (terminal)
//! ```

use chrono::{DateTime, Utc};
use procmaster_common::{SupervisorError, SupervisorResult};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_HISTORY: usize = 100;

/// Status of a supervised process record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Launch requested or automatic restart scheduled; no live process yet.
    Pending,
    /// A live OS process is attached to the record.
    Running,
    /// Stopped on user request; keep-alive does not apply.
    Stopped,
    /// Exited unexpectedly or failed to launch.
    Crashed,
    /// Removed. Terminal.
    Deleted,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Crashed => "crashed",
            ProcessStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl ProcessStatus {
    /// A record in this status has no live process and none is scheduled.
    pub fn is_idle(&self) -> bool {
        matches!(self, ProcessStatus::Stopped | ProcessStatus::Crashed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Deleted)
    }

    /// Checks whether moving from `self` to `target` is allowed.
    pub fn can_transition_to(&self, target: ProcessStatus) -> bool {
        use ProcessStatus::*;

        match (*self, target) {
            (Deleted, _) => false,
            (from, to) if from == to => true,

            (Pending, Running) | (Pending, Crashed) | (Pending, Stopped) => true,

            (Running, Pending) | (Running, Stopped) | (Running, Crashed) => true,

            (Stopped, Pending) | (Stopped, Deleted) => true,

            (Crashed, Pending) | (Crashed, Stopped) | (Crashed, Deleted) => true,

            _ => false,
        }
    }
}

/// A recorded status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ProcessStatus,
    pub to: ProcessStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Tracks the status of one record and a bounded history of its changes.
#[derive(Debug, Clone)]
pub struct StatusMachine {
    name: String,
    current: ProcessStatus,
    history: Vec<StatusTransition>,
    last_transition_at: DateTime<Utc>,
}

impl StatusMachine {
    /// New records start `Pending`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            current: ProcessStatus::Pending,
            history: Vec::new(),
            last_transition_at: Utc::now(),
        }
    }

    pub fn current(&self) -> ProcessStatus {
        self.current
    }

    pub fn history(&self) -> &[StatusTransition] {
        &self.history
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    /// Moves to `target`, or fails with `OperationNotAllowed` when the
    /// transition is not permitted from the current status.
    pub fn transition_to(
        &mut self,
        target: ProcessStatus,
        reason: impl Into<Option<String>>,
    ) -> SupervisorResult<()> {
        if !self.current.can_transition_to(target) {
            return Err(SupervisorError::operation_not_allowed(
                &self.name,
                format!("transition to {}", target),
                self.current.to_string(),
            ));
        }

        if self.current == target {
            return Ok(());
        }

        let now = Utc::now();
        let from = self.current;
        self.history.push(StatusTransition {
            from,
            to: target,
            at: now,
            reason: reason.into(),
        });
        if self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }
        self.current = target;
        self.last_transition_at = now;

        tracing::debug!("Process {} transitioned from {} to {}", self.name, from, target);

        Ok(())
    }

    pub fn count_transitions_to(&self, status: ProcessStatus) -> usize {
        self.history.iter().filter(|t| t.to == status).count()
    }
}
