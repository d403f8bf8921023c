//! # procmaster process
//!
//! Low-level process operations used by the supervisor:
//! - spawning a child with its output routed to log files or discarded
//! - graceful and forced termination by pid
//! - existence checks by pid
//! - launch-time validation of names and executable paths

pub mod check;
pub mod execute;
pub mod terminate;
pub mod validation;

pub use check::*;
pub use execute::*;
pub use terminate::*;
pub use validation::*;
