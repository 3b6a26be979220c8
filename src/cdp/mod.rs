//! Chrome DevTools Protocol (CDP) implementation
//!
//! One connection carries many flatten-multiplexed sessions: every message
//! to or from a child target is tagged with a `sessionId`. The connection
//! correlates command responses by call id and fans events out to
//! per-session subscribers.

pub mod connection;
pub mod protocol;

pub use connection::{CdpConnection, CdpEvent, CdpSession};
