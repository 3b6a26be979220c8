//! jsdap - a debug adapter for CDP JavaScript runtimes
//!
//! By default the adapter speaks DAP on stdio, the transport debug clients
//! spawn adapters with. `--port` serves a single TCP client instead.

use std::path::PathBuf;

use clap::Parser;
use jsdap::common::{logging, Settings};

#[derive(Parser)]
#[command(name = "jsdap", about = "Debug adapter for CDP JavaScript runtimes")]
#[command(version, long_about = None)]
struct Cli {
    /// Serve DAP over TCP on this port instead of stdio
    #[arg(long)]
    port: Option<u16>,

    /// Append adapter logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Settings file (defaults to ./jsdap.toml when present)
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_file.as_deref());

    let settings = match Settings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.port {
        Some(port) => jsdap::serve_tcp(port, settings).await,
        None => jsdap::serve_stdio(settings).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
