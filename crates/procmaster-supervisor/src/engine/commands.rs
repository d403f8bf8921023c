//! Internal command protocol between [`LifecycleEngine`](super::LifecycleEngine)
//! handles and the actor.

use super::types::{EngineState, MonitStatus, ProcessInfo, Responder, Result};
use procmaster_common::ProcessSpec;
use tokio::sync::oneshot;
use tokio::time::Duration;

pub(super) enum EngineCommand {
    /// Create a record and launch it
    Launch {
        spec: ProcessSpec,
        deadline: Option<Duration>,
        resp: Responder,
    },
    StartProcess {
        name: String,
        deadline: Option<Duration>,
        resp: Responder,
    },
    RestartProcess {
        name: String,
        deadline: Option<Duration>,
        resp: Responder,
    },
    StopProcess {
        name: String,
        deadline: Option<Duration>,
        resp: Responder,
    },
    DeleteProcess {
        name: String,
        deadline: Option<Duration>,
        resp: Responder,
    },
    GetProcessInfo {
        name: String,
        resp: oneshot::Sender<Result<ProcessInfo>>,
    },
    GetMonitStatus {
        resp: oneshot::Sender<MonitStatus>,
    },
    /// Definitions of every non-deleted record, ordered by name
    Specs {
        resp: oneshot::Sender<Vec<ProcessSpec>>,
    },
    /// Stop every record and refuse further launches
    Shutdown {
        resp: Responder,
    },
    GetEngineState {
        resp: oneshot::Sender<EngineState>,
    },
    /// Test-only: keep a record busy for `duration`
    #[cfg(test)]
    Hold {
        name: String,
        duration: Duration,
        resp: Responder,
    },
}
