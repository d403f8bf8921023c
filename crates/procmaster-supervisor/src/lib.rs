//! # procmaster supervisor
//!
//! Process supervision for procmaster.
//!
//! This crate provides:
//! - LifecycleEngine - the actor that owns every process record
//! - Keep-alive restart policy with bounded backoff
//! - Save/Resurrect of the supervised set
//! - SupervisorService - the operations exposed to remote clients
//! - Configuration loading and validation

pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod persistence;
pub mod service;

pub use config::{
    ListenAddress, RestartPolicyConfig, SupervisorConfig, SupervisorOptions, TimeoutConfig,
};
pub use engine::{
    EngineConfig, EngineState, LifecycleEngine, MonitStatus, ProcessInfo, ProcessStatusEntry,
};
pub use lifecycle::{RestartDecision, RestartPolicy, RestartTracker};
pub use persistence::{ResurrectSummary, SnapshotStore};
pub use service::SupervisorService;

pub use procmaster_common::{ProcessSpec, SupervisorError, SupervisorResult};
pub use procmaster_process_state::ProcessStatus;
