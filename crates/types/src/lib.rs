//! Core types for the tasknet executor/network boundary.
//!
//! This crate provides the plain data carried between a task executor and a
//! network interface:
//!
//! - [`CallbackId`]: opaque identity for a submitted command or alarm
//! - [`HostAndPort`]: a remote endpoint
//! - [`CommandRequest`]: an outbound remote command
//! - [`CommandResponse`]: the remote side's reply
//!
//! # Design Philosophy
//!
//! This crate is self-contained and data-only. It does not depend on any
//! other workspace crates, making it the foundation layer. All lifecycle
//! logic lives in the interface implementations.

mod command;
mod host;

pub use command::{CallbackId, CommandRequest, CommandResponse};
pub use host::HostAndPort;
