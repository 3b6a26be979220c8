//! jsdap - a debug adapter for CDP JavaScript runtimes
//!
//! Bridges Debug Adapter Protocol clients to browsers and Node-like
//! processes speaking the Chrome DevTools Protocol: launching or attaching,
//! discovering targets, translating positions through source maps, and
//! reconciling breakpoints with what the runtime actually installed.

pub mod adapter;
pub mod cdp;
pub mod common;
pub mod dap;
pub mod launcher;
pub mod sourcemap;
pub mod sources;
pub mod testing;

pub use common::{Error, Result, Settings};

use tokio::io::BufReader;

use adapter::DebugAdapter;
use dap::DapServer;

/// Serve one DAP session over stdio
pub async fn serve_stdio(settings: Settings) -> Result<()> {
    let server = DapServer::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    DebugAdapter::new(server, settings).run().await
}

/// Serve one DAP session over a TCP connection
pub async fn serve_tcp(port: u16, settings: Settings) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "waiting for a DAP client");
    let (stream, peer) = listener.accept().await?;
    tracing::info!(%peer, "DAP client connected");

    let (read_half, write_half) = stream.into_split();
    let server = DapServer::new(BufReader::new(read_half), write_half);
    DebugAdapter::new(server, settings).run().await
}
