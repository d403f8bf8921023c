//! EngineActor - the single task that owns every process record.
//!
//! Handles send commands, the operation pool sends outcomes and the process
//! controls send exit events. Nothing here awaits process I/O.

use super::commands::EngineCommand;
use super::ops::{OpOutcome, OpPool, OpTicket, OP_QUEUE_CAPACITY};
use super::types::{
    EngineState, InFlightOp, Intent, MonitStatus, OpKind, OpRequest, PendingBatch, ProcessInfo,
    ProcessRecord, Responder, Result,
};
use super::EngineConfig;
use crate::lifecycle::{RestartDecision, RestartPolicy};
use procmaster_common::{ProcessSpec, SupervisorError};
use procmaster_process::validate_spec;
use procmaster_process_control::{ControlFactory, ExitEvent, LaunchInfo};
use procmaster_process_state::ProcessStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Operations running at once across all records. Well above any realistic
/// number of supervised names, so one slow name never waits on others.
const OP_POOL_WORKERS: usize = 512;

/// Queued operations allowed on one record
const QUEUE_LIMIT_PER_RECORD: usize = 32;

/// Queued operations allowed across the engine
const QUEUE_LIMIT_TOTAL: usize = 1024;

/// Name used in errors that concern the engine rather than one record
const ENGINE_NAME: &str = "supervisor";

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

fn next_batch_id() -> u64 {
    NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed)
}

pub(super) struct EngineActor {
    config: EngineConfig,
    factory: Arc<dyn ControlFactory>,
    /// Cloned into every control created by `factory`
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    processes: HashMap<String, ProcessRecord>,
    state: EngineState,
    op_pool: OpPool,
    pending_batches: HashMap<u64, PendingBatch>,
    /// Total queued operations across all records
    queued_total: usize,
    /// Makes `on_outcomes_closed()` idempotent
    outcomes_closed: bool,
    queue_drift_reported: bool,
}

impl EngineActor {
    pub(super) fn new(
        config: EngineConfig,
        factory: Arc<dyn ControlFactory>,
        exit_tx: mpsc::UnboundedSender<ExitEvent>,
        outcome_tx: mpsc::Sender<OpOutcome>,
    ) -> Self {
        EngineActor {
            config,
            factory,
            exit_tx,
            processes: HashMap::new(),
            state: EngineState::Running,
            op_pool: OpPool::new(OP_POOL_WORKERS, outcome_tx),
            pending_batches: HashMap::new(),
            queued_total: 0,
            outcomes_closed: false,
            queue_drift_reported: false,
        }
    }

    /// Main event loop.
    ///
    /// Sources are polled in priority order: completions, exit events,
    /// commands, then the restart heartbeat. Once every handle is dropped the
    /// actor stops all records, keeps draining completions and exits when no
    /// work remains.
    pub(super) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut outcome_rx: mpsc::Receiver<OpOutcome>,
        mut exit_rx: mpsc::UnboundedReceiver<ExitEvent>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.policy.check_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut commands_closed = false;

        loop {
            if commands_closed && self.is_idle_after_drain() {
                info!("Command channel closed and all work drained; engine exiting");
                break;
            }

            tokio::select! {
                biased;

                maybe_outcome = outcome_rx.recv(), if !self.outcomes_closed => {
                    if let Some(completed) = maybe_outcome {
                        self.on_outcome(completed);
                    } else {
                        error!("Completion channel closed unexpectedly; failing all pending work");
                        self.on_outcomes_closed();
                    }
                }

                Some(event) = exit_rx.recv() => {
                    self.handle_exit_event(event);
                }

                maybe_cmd = cmd_rx.recv(), if !commands_closed => {
                    match maybe_cmd {
                        None => {
                            info!("All handles dropped, draining the engine");
                            commands_closed = true;
                            self.initiate_shutdown(None);
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }

                _ = heartbeat.tick() => {
                    if !commands_closed && self.state.accepts_launches() {
                        self.schedule_due_restarts();
                    }
                }
            }
        }

        info!("Lifecycle engine terminated");
    }

    /// No completion can arrive any more: fail every waiter and mark records
    /// inoperable.
    fn on_outcomes_closed(&mut self) {
        if self.outcomes_closed {
            return;
        }
        self.outcomes_closed = true;
        self.state = EngineState::Stopped;

        let batch_err = SupervisorError::completion_channel_closed(ENGINE_NAME);
        for (_, batch) in self.pending_batches.drain() {
            if let Some(resp) = batch.resp {
                let _ = resp.send(Err(batch_err.clone()));
            }
        }

        let names: Vec<String> = self.processes.keys().cloned().collect();
        for name in names {
            let err = SupervisorError::completion_channel_closed(name.clone());
            if let Some(record) = self.processes.get_mut(&name) {
                if let Some(in_flight) = record.in_flight.take() {
                    if let Some(resp) = in_flight.resp {
                        let _ = resp.send(Err(err.clone()));
                    }
                }
                record.control = None;
                record.clear_live();
                if record.current_status() != ProcessStatus::Stopped {
                    record.set_status(ProcessStatus::Crashed, "completion channel closed");
                }
            }
            self.fail_and_drain_pending_ops(&name, err);
        }

        self.queued_total = 0;
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        use EngineCommand::*;

        // Without completions nothing can run; serve queries from cached state.
        if self.outcomes_closed {
            match cmd {
                Launch { spec, resp, .. } => {
                    let _ = resp.send(Err(SupervisorError::completion_channel_closed(spec.name)));
                }
                StartProcess { name, resp, .. }
                | RestartProcess { name, resp, .. }
                | StopProcess { name, resp, .. }
                | DeleteProcess { name, resp, .. } => {
                    let _ = resp.send(Err(SupervisorError::completion_channel_closed(name)));
                }
                Shutdown { resp } => {
                    let _ = resp.send(Err(SupervisorError::completion_channel_closed(
                        ENGINE_NAME,
                    )));
                }
                GetProcessInfo { name, resp } => {
                    let _ = resp.send(self.process_info(&name));
                }
                GetMonitStatus { resp } => {
                    let _ = resp.send(self.monit_status());
                }
                Specs { resp } => {
                    let _ = resp.send(self.specs());
                }
                GetEngineState { resp } => {
                    let _ = resp.send(self.state);
                }
                #[cfg(test)]
                Hold { name, resp, .. } => {
                    let _ = resp.send(Err(SupervisorError::completion_channel_closed(name)));
                }
            }
            return;
        }

        match cmd {
            Launch {
                spec,
                deadline,
                resp,
            } => self.handle_launch(spec, deadline, resp),
            StartProcess {
                name,
                deadline,
                resp,
            } => self.handle_user_op(name, OpKind::Start, deadline, resp),
            RestartProcess {
                name,
                deadline,
                resp,
            } => self.handle_user_op(name, OpKind::Restart { automatic: false }, deadline, resp),
            StopProcess {
                name,
                deadline,
                resp,
            } => self.handle_user_op(name, OpKind::Stop, deadline, resp),
            DeleteProcess {
                name,
                deadline,
                resp,
            } => self.handle_user_op(name, OpKind::Delete, deadline, resp),
            GetProcessInfo { name, resp } => {
                let _ = resp.send(self.process_info(&name));
            }
            GetMonitStatus { resp } => {
                let _ = resp.send(self.monit_status());
            }
            Specs { resp } => {
                let _ = resp.send(self.specs());
            }
            Shutdown { resp } => self.initiate_shutdown(Some(resp)),
            GetEngineState { resp } => {
                let _ = resp.send(self.state);
            }
            #[cfg(test)]
            Hold {
                name,
                duration,
                resp,
            } => self.schedule_op(name, OpKind::Hold(duration), Some(resp), None, None),
        }
    }

    fn handle_launch(&mut self, spec: ProcessSpec, deadline: Option<Duration>, resp: Responder) {
        if !self.state.accepts_launches() {
            let _ = resp.send(Err(SupervisorError::operation_not_allowed(
                spec.name,
                OpKind::Launch.name(),
                self.state.to_string(),
            )));
            return;
        }
        if let Err(e) = validate_spec(&spec) {
            let _ = resp.send(Err(e));
            return;
        }
        if self.processes.contains_key(&spec.name) {
            debug!("Launch rejected: {} already exists", spec.name);
            let _ = resp.send(Err(SupervisorError::duplicate_name(spec.name)));
            return;
        }

        info!(
            "Registering process {} ({}, keep-alive: {})",
            spec.name, spec.source_path, spec.keep_alive
        );
        let control = self.factory.create(&spec, self.exit_tx.clone());
        let name = spec.name.clone();
        self.processes
            .insert(name.clone(), ProcessRecord::new(spec, control));

        self.schedule_op(name, OpKind::Launch, Some(resp), None, deadline);
    }

    fn handle_user_op(
        &mut self,
        name: String,
        op: OpKind,
        deadline: Option<Duration>,
        resp: Responder,
    ) {
        if op.launches() && !self.state.accepts_launches() {
            let _ = resp.send(Err(SupervisorError::operation_not_allowed(
                name,
                op.name(),
                self.state.to_string(),
            )));
            return;
        }
        self.schedule_op(name, op, Some(resp), None, deadline);
    }

    /// Schedule an operation on a record: run it now if the record is idle,
    /// queue it otherwise.
    ///
    /// An operation that belongs to a batch is never dropped silently; every
    /// rejection path reports it to the batch.
    fn schedule_op(
        &mut self,
        name: String,
        op: OpKind,
        resp: Option<Responder>,
        batch_id: Option<u64>,
        deadline: Option<Duration>,
    ) {
        let record = match self.processes.get_mut(&name) {
            Some(record) => record,
            None => {
                if let Some(resp) = resp {
                    let _ = resp.send(Err(SupervisorError::not_found(name.clone())));
                }
                if let Some(batch_id) = batch_id {
                    self.settle_batch_member(batch_id, Some(name));
                }
                return;
            }
        };

        if record.pending_ops.len() >= QUEUE_LIMIT_PER_RECORD
            || self.queued_total >= QUEUE_LIMIT_TOTAL
        {
            let limit = if record.pending_ops.len() >= QUEUE_LIMIT_PER_RECORD {
                QUEUE_LIMIT_PER_RECORD
            } else {
                QUEUE_LIMIT_TOTAL
            };
            debug!(
                "Queue for {} is full ({} here, {} overall), rejecting {}",
                name,
                record.pending_ops.len(),
                self.queued_total,
                op.name()
            );
            if let Some(resp) = resp {
                let _ = resp.send(Err(SupervisorError::queue_full(&name, limit)));
            }
            if let Some(batch_id) = batch_id {
                self.settle_batch_member(batch_id, Some(name));
            }
            return;
        }

        // The newest user request decides whether keep-alive may relaunch.
        if let Some(intent) = op.intent() {
            record.intent = intent;
            if intent == Intent::Stop {
                record.restart_due = None;
            }
        }

        if record.is_busy() {
            debug!(
                "{} is busy with {}, queueing {}",
                name,
                record.busy_op_name().unwrap_or("operation"),
                op.name()
            );
            record.pending_ops.push_back(OpRequest {
                kind: op,
                resp,
                batch_id,
                deadline,
            });
            self.queued_total += 1;
            return;
        }

        self.start_op_now(&name, op, resp, batch_id, deadline);
    }

    /// Upper bound for `op`, shortened by the caller's deadline.
    fn op_timeout(&self, op: &OpKind, deadline: Option<Duration>) -> Duration {
        let timeouts = &self.config.timeouts;
        let budget = match op {
            OpKind::Launch | OpKind::Start => timeouts.launch,
            OpKind::Restart { .. } => timeouts.stop_budget() + timeouts.launch,
            OpKind::Stop | OpKind::Delete => timeouts.stop_budget(),
            #[cfg(test)]
            OpKind::Hold(duration) => *duration + timeouts.launch,
        };
        deadline.map_or(budget, |d| budget.min(d))
    }

    /// Run an operation on an idle record. Returns whether an operation was
    /// submitted; a rejected operation has already been answered.
    fn start_op_now(
        &mut self,
        name: &str,
        op: OpKind,
        resp: Option<Responder>,
        batch_id: Option<u64>,
        deadline: Option<Duration>,
    ) -> bool {
        let timeout = self.op_timeout(&op, deadline);
        let accepting = self.state.accepts_launches();
        let state = self.state;

        let Some(record) = self.processes.get_mut(name) else {
            return false;
        };

        let rejection = if op.is_automatic() {
            // Superseded by a user request or the record came back on its own.
            let alive = record.control.as_ref().map_or(true, |c| c.is_running());
            if record.intent != Intent::Run || alive || !accepting {
                debug!("Dropping automatic restart of {}", name);
                return false;
            }
            None
        } else if op.launches() {
            if !accepting {
                Some(SupervisorError::operation_not_allowed(
                    name,
                    op.name(),
                    state.to_string(),
                ))
            } else {
                record
                    .control
                    .as_ref()
                    .filter(|c| c.is_running())
                    .map(|c| SupervisorError::already_running(name, c.pid()))
            }
        } else {
            None
        };

        if let Some(err) = rejection {
            debug!("{} of {} rejected: {}", op.name(), name, err);
            if let Some(resp) = resp {
                let _ = resp.send(Err(err));
            }
            if let Some(batch_id) = batch_id {
                self.settle_batch_member(batch_id, Some(name.to_string()));
            }
            return false;
        }

        let Some(control) = record.control.take() else {
            let err = SupervisorError::unavailable(format!(
                "process '{}' has no control handle",
                name
            ));
            if let Some(resp) = resp {
                let _ = resp.send(Err(err));
            }
            if let Some(batch_id) = batch_id {
                self.settle_batch_member(batch_id, Some(name.to_string()));
            }
            return false;
        };

        record.in_flight = Some(InFlightOp {
            kind: op.clone(),
            resp,
            batch_id,
        });

        let ticket = OpTicket {
            name: name.to_string(),
            op: op.clone(),
            control,
            batch_id,
            limit: timeout,
        };

        let err = match self.op_pool.submit_tx.try_send(ticket) {
            Ok(()) => {
                if op.launches() {
                    record.restart_due = None;
                    record.set_status(ProcessStatus::Pending, op.name());
                }
                return true;
            }
            Err(mpsc::error::TrySendError::Full(ticket)) => {
                error!("Operation pool is full, cannot submit {} for {}", op.name(), name);
                record.control = Some(ticket.control);
                SupervisorError::queue_full(name, OP_QUEUE_CAPACITY)
            }
            Err(mpsc::error::TrySendError::Closed(ticket)) => {
                error!("Operation pool is gone");
                record.control = Some(ticket.control);
                SupervisorError::unavailable("operation pool shut down")
            }
        };

        // A first launch that never reached the pool has no process behind it.
        if op == OpKind::Launch {
            record.last_error = Some(err.to_string());
            record.set_status(ProcessStatus::Crashed, "launch not submitted");
        }

        if let Some(in_flight) = record.in_flight.take() {
            if let Some(resp) = in_flight.resp {
                let _ = resp.send(Err(err));
            }
        }
        if let Some(batch_id) = batch_id {
            self.settle_batch_member(batch_id, Some(name.to_string()));
        }
        false
    }

    /// Answer every queued operation of `name` with `err`.
    fn fail_and_drain_pending_ops(&mut self, name: &str, err: SupervisorError) -> usize {
        let Some(record) = self.processes.get_mut(name) else {
            return 0;
        };
        if record.pending_ops.is_empty() {
            return 0;
        }

        let pending: Vec<OpRequest> = record.pending_ops.drain(..).collect();
        warn!(
            "Draining {} pending op(s) for process '{}': {}",
            pending.len(),
            name,
            err
        );
        self.queued_total = self.queued_total.saturating_sub(pending.len());

        let drained = pending.len();
        for request in pending {
            if let Some(resp) = request.resp {
                let _ = resp.send(Err(err.clone()));
            }
            if let Some(batch_id) = request.batch_id {
                self.settle_batch_member(batch_id, Some(name.to_string()));
            }
        }
        drained
    }

    fn on_outcome(&mut self, completed: OpOutcome) {
        let OpOutcome {
            name,
            op,
            control,
            result,
            batch_id,
        } = completed;

        let control_lost = control.is_none();
        let now = Instant::now();

        let Some(record) = self.processes.get_mut(&name) else {
            warn!("OpOutcome for unknown process {}, control dropped", name);
            if let Some(batch_id) = batch_id {
                self.settle_batch_member(batch_id, Some(name));
            }
            return;
        };

        let in_flight = record.in_flight.take();
        match control {
            Some(control) => record.control = Some(control),
            None => error!(
                "Control lost for process {} during {} (worker panicked); process is inoperable",
                name,
                op.name()
            ),
        }

        let result = apply_outcome(record, &op, result, control_lost, &self.config.policy, now);
        debug!(
            "Operation {} completed for process {}: {}",
            op.name(),
            name,
            if result.is_ok() { "ok" } else { "failed" }
        );

        let failed = result.is_err().then(|| name.clone());
        let (resp, batch_id) = match in_flight {
            Some(in_flight) => (in_flight.resp, in_flight.batch_id.or(batch_id)),
            None => (None, batch_id),
        };
        if let Some(resp) = resp {
            let _ = resp.send(result);
        }
        if let Some(batch_id) = batch_id {
            self.settle_batch_member(batch_id, failed);
        }

        if op == OpKind::Delete {
            self.remove_record(&name);
            return;
        }

        if control_lost {
            let err = SupervisorError::unavailable(format!(
                "process '{}' is inoperable (control lost)",
                name
            ));
            self.fail_and_drain_pending_ops(&name, err);
            return;
        }

        self.process_deferred_exits(&name);
        self.start_next_queued_op(&name);
    }

    /// Drop a record after its delete operation. Dropping the control kills
    /// anything that outlived the termination attempt.
    fn remove_record(&mut self, name: &str) {
        let Some(mut record) = self.processes.remove(name) else {
            return;
        };
        record.set_status(ProcessStatus::Deleted, "deleted");

        let pending: Vec<OpRequest> = record.pending_ops.drain(..).collect();
        self.queued_total = self.queued_total.saturating_sub(pending.len());
        for request in pending {
            let stopping = matches!(request.kind, OpKind::Stop | OpKind::Delete);
            if let Some(resp) = request.resp {
                let _ = resp.send(Err(SupervisorError::not_found(name)));
            }
            if let Some(batch_id) = request.batch_id {
                // Stopping a deleted record already happened.
                let failed = (!stopping).then(|| name.to_string());
                self.settle_batch_member(batch_id, failed);
            }
        }

        info!("Process {} deleted", name);
    }

    fn start_next_queued_op(&mut self, name: &str) {
        loop {
            let next = {
                let Some(record) = self.processes.get_mut(name) else {
                    return;
                };
                if record.is_busy() {
                    return;
                }
                if record.control.is_none() {
                    None
                } else {
                    Some(record.pending_ops.pop_front())
                }
            };

            let request = match next {
                Some(Some(request)) => request,
                Some(None) => return,
                None => {
                    let err = SupervisorError::unavailable(format!(
                        "process '{}' is inoperable (no control handle)",
                        name
                    ));
                    self.fail_and_drain_pending_ops(name, err);
                    return;
                }
            };
            self.queued_total = self.queued_total.saturating_sub(1);

            debug!(
                "Running queued {} for {}",
                request.kind.name(),
                name
            );
            if self.start_op_now(
                name,
                request.kind,
                request.resp,
                request.batch_id,
                request.deadline,
            ) {
                return;
            }
        }
    }

    fn handle_exit_event(&mut self, event: ExitEvent) {
        let Some(record) = self.processes.get_mut(&event.name) else {
            debug!("Exit event for unknown process {}", event.name);
            return;
        };

        if record.is_busy() {
            debug!(
                "Process {} busy with {}, deferring exit of launch {}",
                event.name,
                record.busy_op_name().unwrap_or("operation"),
                event.launch_id
            );
            record.deferred_exits.push(event);
            return;
        }

        self.apply_exit(event);
    }

    fn process_deferred_exits(&mut self, name: &str) {
        let events = match self.processes.get_mut(name) {
            Some(record) => std::mem::take(&mut record.deferred_exits),
            None => return,
        };
        for event in events {
            self.apply_exit(event);
        }
    }

    /// React to the end of a live process.
    fn apply_exit(&mut self, event: ExitEvent) {
        let Some(record) = self.processes.get_mut(&event.name) else {
            return;
        };

        if record.launch_id != Some(event.launch_id) {
            debug!(
                "Ignoring exit of stale launch {} of {} (pid {})",
                event.launch_id, event.name, event.pid
            );
            return;
        }

        record.clear_live();
        record.last_exit = Some(event.report.clone());

        if record.intent == Intent::Stop {
            record.set_status(ProcessStatus::Stopped, "exited after stop request");
            return;
        }

        if !record.spec.keep_alive {
            info!(
                "Process {} (pid {}) exited with {}",
                event.name, event.pid, event.report
            );
            record.set_status(ProcessStatus::Crashed, "exited");
            return;
        }

        let now = Instant::now();
        match record.tracker.on_unexpected_exit(&self.config.policy, now) {
            RestartDecision::RestartAfter(delay) => {
                warn!(
                    "Process {} (pid {}) exited with {}, restarting in {:?}",
                    event.name, event.pid, event.report, delay
                );
                record.restart_due = Some(now + delay);
                record.set_status(ProcessStatus::Pending, "exited, restart scheduled");
            }
            RestartDecision::GiveUp { failures } => {
                error!(
                    "Process {} (pid {}) exited with {} after {} consecutive failure(s), not restarting",
                    event.name, event.pid, event.report, failures
                );
                record.set_status(ProcessStatus::Crashed, "restart limit reached");
            }
        }
    }

    /// Dispatch keep-alive restarts whose backoff has elapsed.
    fn schedule_due_restarts(&mut self) {
        if self.queued_total >= QUEUE_LIMIT_TOTAL {
            debug!("Skipping restart check: global pending queue is full");
            return;
        }

        let now = Instant::now();
        let due: Vec<String> = self
            .processes
            .values()
            .filter(|r| {
                !r.is_busy()
                    && r.pending_ops.is_empty()
                    && r.intent == Intent::Run
                    && r.restart_due.is_some_and(|at| at <= now)
            })
            .map(|r| r.name().to_string())
            .collect();

        for name in due {
            if let Some(record) = self.processes.get_mut(&name) {
                record.restart_due = None;
                info!(
                    "Restarting process {} (consecutive failures: {})",
                    name,
                    record.tracker.consecutive_failures()
                );
            }
            self.schedule_op(name, OpKind::Restart { automatic: true }, None, None, None);
        }
    }

    fn settle_batch_member(&mut self, batch_id: u64, failed: Option<String>) {
        let Some(batch) = self.pending_batches.get_mut(&batch_id) else {
            debug!("No batch {} to settle", batch_id);
            return;
        };

        match batch.pending_count.checked_sub(1) {
            Some(next) => batch.pending_count = next,
            None => {
                error!("Batch {} pending_count underflow (double-complete?)", batch_id);
                batch.pending_count = 0;
            }
        }
        if let Some(name) = failed {
            batch.failed.push(name);
        }
        if batch.pending_count > 0 {
            return;
        }

        let Some(batch) = self.pending_batches.remove(&batch_id) else {
            return;
        };
        let result = if batch.failed.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::termination_failed(
                ENGINE_NAME,
                format!("failed to stop: {}", batch.failed.join(", ")),
            ))
        };

        if self.state == EngineState::Stopping {
            self.state = EngineState::Stopped;
            info!("Lifecycle engine shut down");
        }
        if let Some(resp) = batch.resp {
            let _ = resp.send(result);
        }
    }

    /// Nothing queued, in flight or batched.
    fn is_idle_after_drain(&mut self) -> bool {
        if !self.pending_batches.is_empty() {
            return false;
        }
        let all_clear = self
            .processes
            .values()
            .all(|r| !r.is_busy() && r.pending_ops.is_empty());
        if !all_clear {
            return false;
        }

        let actual_pending: usize = self.processes.values().map(|r| r.pending_ops.len()).sum();
        if self.queued_total != actual_pending && !self.queue_drift_reported {
            self.queue_drift_reported = true;
            warn!(
                "Queued-op count drifted during drain: counted {}, found {}",
                self.queued_total, actual_pending
            );
        }
        true
    }

    #[cfg(test)]
    pub(super) fn test_set_queued_total(&mut self, value: usize) {
        self.queued_total = value;
    }

    /// Swap in a pool that refuses every submission.
    #[cfg(test)]
    pub(super) fn test_close_pool(&mut self) {
        let (submit_tx, submit_rx) = mpsc::channel(1);
        drop(submit_rx);
        self.op_pool = OpPool { submit_tx };
    }

    /// Stop every record and refuse launches from now on. Idempotent.
    fn initiate_shutdown(&mut self, resp: Option<Responder>) {
        if self.state != EngineState::Running {
            debug!("Shutdown already requested (state: {})", self.state);
            if let Some(resp) = resp {
                let _ = resp.send(Ok(()));
            }
            return;
        }

        info!("Shutting down lifecycle engine");
        self.state = EngineState::Stopping;

        let mut names: Vec<String> = self.processes.keys().cloned().collect();
        names.sort();
        if names.is_empty() {
            self.state = EngineState::Stopped;
            if let Some(resp) = resp {
                let _ = resp.send(Ok(()));
            }
            info!("Lifecycle engine shut down (no processes)");
            return;
        }

        let batch_id = next_batch_id();
        self.pending_batches.insert(
            batch_id,
            PendingBatch {
                pending_count: names.len(),
                failed: Vec::new(),
                resp,
            },
        );

        for name in names {
            self.schedule_op(name, OpKind::Stop, None, Some(batch_id), None);
        }
    }

    fn process_info(&self, name: &str) -> Result<ProcessInfo> {
        self.processes
            .get(name)
            .map(ProcessRecord::info)
            .ok_or_else(|| SupervisorError::not_found(name))
    }

    fn monit_status(&self) -> MonitStatus {
        let mut procs: Vec<_> = self
            .processes
            .values()
            .map(ProcessRecord::status_entry)
            .collect();
        procs.sort_by(|a, b| a.name.cmp(&b.name));
        MonitStatus { procs }
    }

    fn specs(&self) -> Vec<ProcessSpec> {
        let mut specs: Vec<ProcessSpec> =
            self.processes.values().map(|r| r.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

/// Fold the outcome of `op` into `record` and return what the caller sees.
fn apply_outcome(
    record: &mut ProcessRecord,
    op: &OpKind,
    result: Result<Option<LaunchInfo>>,
    control_lost: bool,
    policy: &RestartPolicy,
    now: Instant,
) -> Result<()> {
    if control_lost {
        record.clear_live();
        if record.current_status() != ProcessStatus::Stopped {
            record.set_status(ProcessStatus::Crashed, "control lost");
        }
        if let Err(ref e) = result {
            record.last_error = Some(e.to_string());
        }
        return result.map(|_| ());
    }

    match op {
        OpKind::Launch | OpKind::Start | OpKind::Restart { .. } => match result {
            Ok(Some(launch)) => {
                record.mark_running(&launch, now);
                if *op != OpKind::Launch {
                    record.restart_count += 1;
                }
                if !op.is_automatic() {
                    record.tracker.reset();
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                record.last_error = Some(e.to_string());
                let survivor = record
                    .control
                    .as_ref()
                    .filter(|c| c.is_running())
                    .and_then(|c| c.pid());

                if let Some(pid) = survivor {
                    // Termination of the old launch failed; it is still ours.
                    record.pid = Some(pid);
                    record.set_status(ProcessStatus::Running, "relaunch failed");
                } else if op.is_automatic()
                    && record.spec.keep_alive
                    && record.intent == Intent::Run
                {
                    record.clear_live();
                    match record.tracker.on_launch_failure(policy) {
                        RestartDecision::RestartAfter(delay) => {
                            warn!(
                                "Restart of {} failed ({}), retrying in {:?}",
                                record.name(),
                                e,
                                delay
                            );
                            record.restart_due = Some(now + delay);
                            record.set_status(ProcessStatus::Pending, "restart failed");
                        }
                        RestartDecision::GiveUp { .. } => {
                            record.set_status(ProcessStatus::Crashed, "restart limit reached");
                        }
                    }
                } else {
                    record.clear_live();
                    record.set_status(ProcessStatus::Crashed, "launch failed");
                }
                Err(e)
            }
        },
        OpKind::Stop | OpKind::Delete => {
            // Unconfirmed termination still counts as stopped.
            record.clear_live();
            record.set_status(ProcessStatus::Stopped, op.name());
            if let Err(ref e) = result {
                warn!("Stop of {} not confirmed: {}", record.name(), e);
                record.last_error = Some(e.to_string());
            }
            result.map(|_| ())
        }
        #[cfg(test)]
        OpKind::Hold(_) => result.map(|_| ()),
    }
}
