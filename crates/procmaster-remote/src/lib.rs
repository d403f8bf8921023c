//! # procmaster remote
//!
//! HTTP surface of the supervisor.
//!
//! This crate provides:
//! - JSON routes mapping one-to-one onto `SupervisorService` operations
//! - Error responses that keep the error kind and its context
//! - A server for TCP or Unix domain socket listeners

pub mod api;
pub mod server;
pub mod types;

pub use api::{create_router, ApiError, DEADLINE_HEADER};
pub use server::{RemoteServer, ServerError};
