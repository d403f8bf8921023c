//! Operation pool.
//!
//! Launches and terminations can take seconds, so the actor never awaits
//! them. It lends the record's control to the pool along with the
//! operation; a worker runs it under a time limit, traps panics, and
//! always hands an [`OpOutcome`] back carrying the control.

use super::types::{OpKind, Result};
use futures::future::FutureExt;
use procmaster_common::SupervisorError;
use procmaster_process_control::{LaunchInfo, ProcessControl};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Capacity of the submission channel, also reported in `QueueFull`.
pub(super) const OP_QUEUE_CAPACITY: usize = 64;

/// One operation on one record.
pub(super) struct OpTicket {
    pub name: String,
    pub op: OpKind,
    /// Lent by the record until the outcome comes back
    pub control: Box<dyn ProcessControl>,
    pub batch_id: Option<u64>,
    pub limit: Duration,
}

impl OpTicket {
    /// Close the request, returning its control to the record.
    fn into_outcome(self, result: Result<Option<LaunchInfo>>) -> OpOutcome {
        OpOutcome {
            name: self.name,
            op: self.op,
            control: Some(self.control),
            result,
            batch_id: self.batch_id,
        }
    }
}

/// What the actor gets back for every request, success or not.
pub(super) struct OpOutcome {
    pub name: String,
    pub op: OpKind,
    /// Lost only when the worker panicked
    pub control: Option<Box<dyn ProcessControl>>,
    /// The fresh launch, for operations that launch
    pub result: Result<Option<LaunchInfo>>,
    pub batch_id: Option<u64>,
}

pub(super) struct OpPool {
    pub submit_tx: mpsc::Sender<OpTicket>,
}

impl OpPool {
    /// Spawn the pool. At most `workers` operations run at once; a ticket
    /// waiting for a worker never holds up the tickets behind it.
    pub fn new(workers: usize, outcome_tx: mpsc::Sender<OpOutcome>) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(OP_QUEUE_CAPACITY);
        let permits = Arc::new(Semaphore::new(workers));
        tokio::spawn(Self::serve(submit_rx, permits, outcome_tx));

        debug!("Operation pool up with {} workers", workers);
        OpPool { submit_tx }
    }

    async fn serve(
        mut submit_rx: mpsc::Receiver<OpTicket>,
        permits: Arc<Semaphore>,
        outcome_tx: mpsc::Sender<OpOutcome>,
    ) {
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                request = submit_rx.recv() => {
                    let Some(request) = request else { break };
                    running.spawn(Self::work(request, permits.clone(), outcome_tx.clone()));
                }
                finished = running.join_next(), if !running.is_empty() => reap(finished),
            }
        }

        debug!("Operation pool closing, waiting for {} worker(s)", running.len());
        while let Some(finished) = running.join_next().await {
            reap(Some(finished));
        }
    }

    async fn work(
        request: OpTicket,
        permits: Arc<Semaphore>,
        outcome_tx: mpsc::Sender<OpOutcome>,
    ) {
        let outcome = match permits.acquire_owned().await {
            Ok(permit) => {
                let outcome = Self::run_trapped(request).await;
                drop(permit);
                outcome
            }
            Err(_) => {
                // Closed permits: the control still goes home.
                error!("Operation pool has no permits left");
                let reason = format!(
                    "operation pool closed before {} of '{}' could run",
                    request.op.name(),
                    request.name
                );
                request.into_outcome(Err(SupervisorError::unavailable(reason)))
            }
        };
        deliver(&outcome_tx, outcome).await;
    }

    /// Run the request, turning a panic into a `TaskPanic` outcome.
    async fn run_trapped(request: OpTicket) -> OpOutcome {
        let name = request.name.clone();
        let op = request.op.clone();
        let batch_id = request.batch_id;

        match AssertUnwindSafe(Self::run_limited(request)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("{} of {} panicked: {}", op.name(), name, message);
                OpOutcome {
                    result: Err(SupervisorError::task_panic(&name, message)),
                    name,
                    op,
                    control: None,
                    batch_id,
                }
            }
        }
    }

    async fn run_limited(mut request: OpTicket) -> OpOutcome {
        let limit = request.limit;
        let result = match tokio::time::timeout(limit, Self::perform(&mut request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} of {} did not finish within {:?}",
                    request.op.name(),
                    request.name,
                    limit
                );
                let reason = format!("{} not confirmed within {:?}", request.op.name(), limit);
                Err(if request.op.launches() {
                    SupervisorError::launch_failed(&request.name, reason)
                } else {
                    SupervisorError::termination_failed(&request.name, reason)
                })
            }
        };
        request.into_outcome(result)
    }

    async fn perform(request: &mut OpTicket) -> Result<Option<LaunchInfo>> {
        let name = request.name.as_str();
        let control = &mut request.control;
        match &request.op {
            OpKind::Launch | OpKind::Start => {
                let launch = control.start().await?;
                info!("{} is up (pid {}, {})", name, launch.pid, request.op.name());
                Ok(Some(launch))
            }
            OpKind::Restart { automatic } => {
                if !automatic {
                    info!("Restarting {}", name);
                }
                control.stop().await?;
                let launch = control.start().await?;
                info!("{} is back (pid {})", name, launch.pid);
                Ok(Some(launch))
            }
            OpKind::Stop | OpKind::Delete => {
                control.stop().await?;
                info!("{} is down", name);
                Ok(None)
            }
            #[cfg(test)]
            OpKind::Hold(pause) => {
                tokio::time::sleep(*pause).await;
                Ok(None)
            }
        }
    }

    /// Drive one request through a pool whose permits are already closed.
    #[cfg(test)]
    pub(super) async fn serve_without_permits(
        request: OpTicket,
        outcome_tx: mpsc::Sender<OpOutcome>,
    ) {
        let (submit_tx, submit_rx) = mpsc::channel(1);
        let permits = Arc::new(Semaphore::new(1));
        permits.close();

        let _ = submit_tx.send(request).await;
        drop(submit_tx);
        Self::serve(submit_rx, permits, outcome_tx).await;
    }
}

async fn deliver(outcome_tx: &mpsc::Sender<OpOutcome>, outcome: OpOutcome) {
    if outcome_tx.send(outcome).await.is_err() {
        error!("Outcome dropped: the engine stopped listening");
    }
}

fn reap(finished: Option<std::result::Result<(), tokio::task::JoinError>>) {
    match finished {
        Some(Err(e)) if e.is_panic() => error!("Operation worker panicked: {}", e),
        Some(Err(e)) => warn!("Operation worker cancelled: {}", e),
        _ => {}
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
