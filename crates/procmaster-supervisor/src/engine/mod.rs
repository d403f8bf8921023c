//! Process lifecycle engine.
//!
//! Actor-style design: one task owns every process record, handles talk to
//! it over a channel, and slow work runs on an operation pool.
//!
//! ## Event sources
//!
//! The actor's biased `select!` polls, in order:
//! 1. operation completions (return the control, answer the caller)
//! 2. exit events from the process controls
//! 3. commands from [`LifecycleEngine`] handles
//! 4. the restart heartbeat (`restart_policy.check_interval`)
//!
//! Under sustained load the heartbeat may be delayed; automatic restarts are
//! background work and a late restart is not a correctness problem.
//!
//! ## Per-record ordering
//!
//! Operations on one record run one at a time in arrival order. An operation
//! requested while another is in flight is queued. Operations on different
//! records run concurrently.
//!
//! An exit event that arrives while an operation is in flight is held until
//! the operation completes, then matched against the record's current launch
//! id; exits of older launches are ignored.
//!
//! ## Keep-alive and user intent
//!
//! Every user request records an intent: launch/start/restart mean *run*,
//! stop/delete mean *stop*. An unexpected exit of a keep-alive record moves
//! it to `Pending` with a restart due after the backoff delay; the heartbeat
//! dispatches due restarts. An automatic restart is dropped at dispatch time
//! unless the intent is still *run*, so a stop or delete always wins.
//!
//! ## Backpressure
//!
//! | Layer | Capacity | Saturation |
//! |-------|----------|------------|
//! | Command channel | 32 | caller awaits |
//! | Operation pool queue | 64 | `QueueFull` |
//! | Pending ops per record | 32 | `QueueFull` |
//! | Pending ops overall | 1024 | `QueueFull` |

mod actor;
mod commands;
mod handle;
mod ops;
mod types;

#[cfg(test)]
mod tests;

pub use handle::LifecycleEngine;
pub use types::{EngineState, MonitStatus, ProcessInfo, ProcessStatusEntry};

use crate::config::{SupervisorConfig, TimeoutConfig};
use crate::lifecycle::RestartPolicy;
use actor::EngineActor;
use commands::EngineCommand;
use ops::OpOutcome;
use procmaster_process_control::{ControlFactory, ExitEvent, OsControlFactory};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Timing settings of the engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub policy: RestartPolicy,
    pub timeouts: TimeoutConfig,
}

impl From<&SupervisorConfig> for EngineConfig {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            policy: config.restart_policy(),
            timeouts: config.timeouts.clone(),
        }
    }
}

impl LifecycleEngine {
    /// Start an engine that supervises real OS processes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &SupervisorConfig) -> Self {
        let factory = Arc::new(OsControlFactory::new(config.control_config()));
        Self::with_factory(EngineConfig::from(config), factory)
    }

    /// Start an engine whose process controls come from `factory`.
    pub fn with_factory(config: EngineConfig, factory: Arc<dyn ControlFactory>) -> Self {
        info!(
            "Starting lifecycle engine (restart check every {:?})",
            config.policy.check_interval
        );

        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(32);
        let (outcome_tx, outcome_rx) = mpsc::channel::<OpOutcome>(256);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel::<ExitEvent>();

        let actor = EngineActor::new(config, factory, exit_tx, outcome_tx);
        tokio::spawn(actor.run(cmd_rx, outcome_rx, exit_rx));

        LifecycleEngine {
            cmd_tx,
            deadline: None,
        }
    }
}
