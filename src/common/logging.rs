//! Logging and tracing configuration
//!
//! stdout carries the DAP wire, so all adapter logs go to stderr and,
//! optionally, to a log file.

use std::path::Path;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize tracing for the adapter process
///
/// Log level is controlled by the `RUST_LOG` environment variable; the
/// default is INFO for this crate, WARN for dependencies. When `log_file`
/// is given, a second layer appends full-detail records to it.
pub fn init(log_file: Option<&Path>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jsdap=info,warn"));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    if let Some(path) = log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let file_layer = fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT);

                tracing_subscriber::registry()
                    .with(filter)
                    .with(stderr_layer)
                    .with(file_layer)
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Warning: could not open log file: {e}");
            }
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .init();
}
