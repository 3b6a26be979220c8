//! Error types for the adapter
//!
//! The taxonomy mirrors how failures are surfaced: user errors become DAP
//! error responses, silent errors are logged and swallowed at the call site,
//! and transport loss tears the session down.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the adapter
#[derive(Error, Debug)]
pub enum Error {
    // === User errors (become DAP error responses) ===
    #[error("Browser executable not found. Searched: {searched}")]
    BrowserNotFound { searched: String },

    #[error("Unable to attach to the main target: {0}")]
    AttachFailed(String),

    #[error("Source not available: {0}")]
    SourceNotFound(String),

    #[error("{0}")]
    EvaluateFailed(String),

    #[error("Invalid launch configuration: {0}")]
    InvalidLaunchConfig(String),

    #[error("Launch was cancelled")]
    LaunchCancelled,

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    // === Protocol errors ===
    #[error("DAP protocol error: {0}")]
    DapProtocol(String),

    #[error("CDP protocol error: {0}")]
    CdpProtocol(String),

    #[error("CDP connection closed")]
    CdpDisconnected,

    #[error("CDP command '{command}' failed: {message}")]
    CdpCommandFailed { command: String, message: String },

    // === Source translation errors (logged, not surfaced) ===
    #[error("Failed to fetch source map from '{url}': {reason}")]
    SourceMapFetch { url: String, reason: String },

    #[error("Failed to parse source map: {0}")]
    SourceMapParse(String),

    // === Session state errors ===
    #[error("No debug session active")]
    NoSession,

    #[error("Thread {0} not found")]
    ThreadNotFound(i64),

    #[error("Frame {0} not found")]
    FrameNotFound(i64),

    #[error("Unknown variables reference {0}")]
    VariablesReferenceNotFound(i64),

    // === Configuration ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO / serialization ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a browser-not-found error listing the search candidates
    pub fn browser_not_found<S: AsRef<str>>(candidates: &[S]) -> Self {
        Self::BrowserNotFound {
            searched: candidates
                .iter()
                .map(|s| s.as_ref())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Create a CDP command failed error
    pub fn cdp_command_failed(command: &str, message: &str) -> Self {
        Self::CdpCommandFailed {
            command: command.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a source map fetch error
    pub fn source_map_fetch(url: &str, reason: impl ToString) -> Self {
        Self::SourceMapFetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
