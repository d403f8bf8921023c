//! Error types for procmaster.
//!
//! [`SupervisorError`] is the typed result of every lifecycle and persistence
//! operation. It is `Clone` (one failure may be reported to several waiters)
//! and serializes with a `kind` tag, so the kind and its context survive the
//! trip to a remote caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One entry of a batch operation that failed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFailure {
    pub name: String,
    pub error: Box<SupervisorError>,
}

impl std::fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

/// Typed failures of lifecycle, persistence and service operations.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SupervisorError {
    #[error("Process already exists: {name}")]
    DuplicateName { name: String },

    #[error("Process not found: {name}")]
    NotFound { name: String },

    #[error("Process already running: {name} (pid {pid:?})")]
    AlreadyRunning { name: String, pid: Option<u32> },

    #[error("Process launch failed: {name} - {reason}")]
    LaunchFailed {
        name: String,
        reason: String,
        os_code: Option<i32>,
    },

    #[error("Process termination failed: {name} - {reason}")]
    TerminationFailed { name: String, reason: String },

    #[error("Snapshot error at {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("Resurrect failed for {} process(es): {}", .failures.len(), join_failures(.failures))]
    Resurrect {
        failures: Vec<EntryFailure>,
        /// Entries that did come up
        #[serde(default)]
        started: Vec<String>,
        /// Entries already supervised before the resurrect
        #[serde(default)]
        skipped: Vec<String>,
    },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Operation not allowed: {name} - {operation} (state: {state})")]
    OperationNotAllowed {
        name: String,
        operation: String,
        state: String,
    },

    #[error("Operation queue full for process '{name}' (limit: {limit})")]
    QueueFull { name: String, limit: usize },

    #[error("Task panicked for process '{name}': {message}")]
    TaskPanic { name: String, message: String },

    #[error("Completion channel closed unexpectedly for process '{name}'")]
    CompletionChannelClosed { name: String },

    #[error("Supervisor unavailable: {context}")]
    Unavailable { context: String },
}

fn join_failures(failures: &[EntryFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SupervisorError {
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn already_running(name: impl Into<String>, pid: Option<u32>) -> Self {
        Self::AlreadyRunning {
            name: name.into(),
            pid,
        }
    }

    pub fn launch_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LaunchFailed {
            name: name.into(),
            reason: reason.into(),
            os_code: None,
        }
    }

    /// Launch failure that keeps the raw OS error code of the cause.
    pub fn launch_failed_io(name: impl Into<String>, err: &std::io::Error) -> Self {
        Self::LaunchFailed {
            name: name.into(),
            reason: err.to_string(),
            os_code: err.raw_os_error(),
        }
    }

    pub fn termination_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TerminationFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn operation_not_allowed(
        name: impl Into<String>,
        operation: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self::OperationNotAllowed {
            name: name.into(),
            operation: operation.into(),
            state: state.into(),
        }
    }

    pub fn queue_full(name: impl Into<String>, limit: usize) -> Self {
        Self::QueueFull {
            name: name.into(),
            limit,
        }
    }

    pub fn task_panic(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskPanic {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn completion_channel_closed(name: impl Into<String>) -> Self {
        Self::CompletionChannelClosed { name: name.into() }
    }

    pub fn unavailable(context: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
        }
    }

    /// Stable snake_case discriminator, identical to the serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateName { .. } => "duplicate_name",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyRunning { .. } => "already_running",
            Self::LaunchFailed { .. } => "launch_failed",
            Self::TerminationFailed { .. } => "termination_failed",
            Self::Persistence { .. } => "persistence",
            Self::Resurrect { .. } => "resurrect",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::OperationNotAllowed { .. } => "operation_not_allowed",
            Self::QueueFull { .. } => "queue_full",
            Self::TaskPanic { .. } => "task_panic",
            Self::CompletionChannelClosed { .. } => "completion_channel_closed",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

/// Result type for lifecycle and persistence operations.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
