//! # procmaster process control
//!
//! The seam between the supervisor's orchestration and the OS work for a
//! single process record. The supervisor only talks to [`ProcessControl`];
//! [`ProcessControlImpl`] is the implementation backed by real child
//! processes.

mod control;
mod control_impl;

pub use control::{
    next_launch_id, ControlConfig, ControlFactory, ExitEvent, ExitReport, LaunchInfo,
    ProcessControl,
};
pub use control_impl::{OsControlFactory, ProcessControlImpl};
