//! # procmaster common
//!
//! Types shared by every procmaster crate: the supervisor error taxonomy and
//! the launch specification of a supervised process.

pub mod errors;
pub mod types;

pub use errors::{EntryFailure, SupervisorError, SupervisorResult};
pub use types::ProcessSpec;
