//! Debug Adapter Protocol (DAP) implementation
//!
//! This module implements the server side of DAP: framed message I/O and
//! the request/response/event plumbing the adapter core talks to.

pub mod codec;
pub mod server;
pub mod types;

pub use server::{DapServer, DapSink, Outbound};
pub use types::*;
