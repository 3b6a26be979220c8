//! Launching and attaching to JavaScript runtimes
//!
//! Spawns a browser or Node process with debugging enabled, discovers its
//! WebSocket endpoint, and hands back a connected CDP transport. Attach
//! mode skips the spawn and goes through `/json/version` discovery.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::cdp::CdpConnection;
use crate::common::{Error, Result, Settings};
use crate::dap;

/// Browser executables probed on PATH, in order
const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
    "msedge",
    "microsoft-edge",
];

/// A launched runtime: the CDP connection plus the child process to reap
pub struct LaunchedRuntime {
    pub connection: CdpConnection,
    pub child: Option<Child>,
}

/// Launch the runtime described by a DAP `launch` request
///
/// `cancel` aborts the spawn-and-discover sequence; the half-started child
/// is killed.
pub async fn launch(
    args: &dap::LaunchArguments,
    settings: &Settings,
    mut cancel: oneshot::Receiver<()>,
) -> Result<LaunchedRuntime> {
    let launched = match args.runtime.as_deref() {
        Some("node") => launch_node(args),
        Some("webview") => return launch_webview(args, settings, cancel).await,
        _ => launch_browser(args),
    }?;

    let mut child = launched;
    let endpoint_timeout = Duration::from_secs(settings.timeouts.endpoint_secs);
    let endpoint = tokio::select! {
        endpoint = read_ws_endpoint(&mut child, endpoint_timeout) => endpoint,
        _ = &mut cancel => {
            let _ = child.start_kill();
            return Err(Error::LaunchCancelled);
        }
    };

    let endpoint = match endpoint {
        Ok(endpoint) => endpoint,
        Err(e) => {
            let _ = child.start_kill();
            return Err(e);
        }
    };

    let connection = CdpConnection::connect_ws(&endpoint).await?;
    Ok(LaunchedRuntime {
        connection,
        child: Some(child),
    })
}

/// Attach to an already-running runtime
pub async fn attach(args: &dap::AttachArguments) -> Result<CdpConnection> {
    let endpoint = match &args.websocket_url {
        Some(url) => url.clone(),
        None => {
            let port = args
                .port
                .ok_or_else(|| Error::InvalidLaunchConfig("attach needs a port".to_string()))?;
            discover_ws_endpoint(&args.host, port).await?
        }
    };
    CdpConnection::connect_ws(&endpoint).await
}

fn launch_browser(args: &dap::LaunchArguments) -> Result<Child> {
    let executable = find_executable(args.runtime_executable.as_deref(), BROWSER_CANDIDATES)?;
    let profile_dir = profile_directory(args);

    let mut command = Command::new(&executable);
    command
        .arg("--remote-debugging-port=0")
        .arg(format!("--user-data-dir={}", profile_dir.display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .args(&args.runtime_args);
    if let Some(url) = &args.url {
        command.arg(url);
    }
    configure_process(&mut command, args);
    // A browser must never inherit Electron's node-mode switch
    command.env_remove("ELECTRON_RUN_AS_NODE");

    command
        .spawn()
        .map_err(|e| Error::AttachFailed(format!("failed to start '{executable}': {e}")))
}

fn launch_node(args: &dap::LaunchArguments) -> Result<Child> {
    let executable = find_executable(args.runtime_executable.as_deref(), &["node"])?;
    let program = args
        .program
        .as_ref()
        .ok_or_else(|| Error::InvalidLaunchConfig("node launch needs a program".to_string()))?;

    let mut command = Command::new(&executable);
    command
        .arg("--inspect-brk=0")
        .args(&args.runtime_args)
        .arg(program)
        .args(&args.args);
    configure_process(&mut command, args);

    command
        .spawn()
        .map_err(|e| Error::AttachFailed(format!("failed to start '{executable}': {e}")))
}

/// Launch a WebView2 host process with debugging enabled through the
/// documented environment variables, then attach over the fixed port
async fn launch_webview(
    args: &dap::LaunchArguments,
    settings: &Settings,
    mut cancel: oneshot::Receiver<()>,
) -> Result<LaunchedRuntime> {
    let executable = args.runtime_executable.clone().ok_or_else(|| {
        Error::InvalidLaunchConfig("webview launch needs a runtimeExecutable".to_string())
    })?;
    let port = args
        .port
        .ok_or_else(|| Error::InvalidLaunchConfig("webview launch needs a port".to_string()))?;

    let mut command = Command::new(&executable);
    command.args(&args.args);
    configure_process(&mut command, args);
    for (key, value) in webview_debugging_env(&profile_directory(args), port) {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .map_err(|e| Error::AttachFailed(format!("failed to start '{executable}': {e}")))?;

    // The host only opens the port once its first WebView comes up
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(settings.timeouts.endpoint_secs);
    let endpoint = loop {
        match discover_ws_endpoint("127.0.0.1", port).await {
            Ok(endpoint) => break endpoint,
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                    _ = &mut cancel => {
                        let _ = child.start_kill();
                        return Err(Error::LaunchCancelled);
                    }
                }
            }
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        }
    };

    let connection = CdpConnection::connect_ws(&endpoint).await?;
    Ok(LaunchedRuntime {
        connection,
        child: Some(child),
    })
}

/// Environment variables instructing a WebView2 host to expose debugging
pub fn webview_debugging_env(user_data_folder: &Path, port: u16) -> Vec<(String, String)> {
    vec![
        (
            "WEBVIEW2_USER_DATA_FOLDER".to_string(),
            user_data_folder.display().to_string(),
        ),
        (
            "WEBVIEW2_ADDITIONAL_BROWSER_ARGUMENTS".to_string(),
            format!("--remote-debugging-port={port}"),
        ),
        (
            "WEBVIEW2_WAIT_FOR_SCRIPT_DEBUGGER".to_string(),
            "true".to_string(),
        ),
    ]
}

fn configure_process(command: &mut Command, args: &dap::LaunchArguments) {
    if let Some(cwd) = &args.cwd {
        command.current_dir(cwd);
    }
    if let Some(env) = &args.env {
        for (key, value) in env {
            command.env(key, value);
        }
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
}

/// Profile directories live under the storage path and are never shared
/// across concurrent sessions; headless runs get their own directory
fn profile_directory(args: &dap::LaunchArguments) -> PathBuf {
    let base = args
        .storage_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(format!("jsdap-{}", std::process::id())));
    let headless = args.runtime_args.iter().any(|a| a.starts_with("--headless"));
    base.join(if headless { ".headless-profile" } else { ".profile" })
}

fn find_executable(explicit: Option<&str>, candidates: &[&str]) -> Result<String> {
    if let Some(executable) = explicit {
        return Ok(executable.to_string());
    }
    for candidate in candidates {
        if let Ok(path) = which::which(candidate) {
            return Ok(path.to_string_lossy().into_owned());
        }
    }
    Err(Error::browser_not_found(candidates))
}

/// Read the "DevTools listening on ws://..." line runtimes print to stderr
async fn read_ws_endpoint(child: &mut Child, timeout: Duration) -> Result<String> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::AttachFailed("runtime stderr not captured".to_string()))?;
    let mut lines = BufReader::new(stderr).lines();

    let endpoint = tokio::time::timeout(timeout, async {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(line = %line, "runtime stderr");
            if let Some(endpoint) = parse_ws_endpoint(&line) {
                return Some(endpoint);
            }
        }
        None
    })
    .await
    .map_err(|_| Error::Timeout(timeout.as_secs()))?;

    endpoint.ok_or_else(|| {
        Error::AttachFailed("runtime exited before printing its debug endpoint".to_string())
    })
}

fn parse_ws_endpoint(line: &str) -> Option<String> {
    let start = line.find("ws://")?;
    let rest = &line[start..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

/// Ask a runtime's HTTP endpoint for its websocket debugger URL
async fn discover_ws_endpoint(host: &str, port: u16) -> Result<String> {
    let url = format!("http://{host}:{port}/json/version");
    let response = reqwest::get(&url)
        .await
        .map_err(|e| Error::AttachFailed(format!("{url}: {e}")))?;
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::AttachFailed(format!("{url}: {e}")))?;
    body.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::AttachFailed(format!("{url} did not report a websocket URL")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devtools_endpoint_lines() {
        assert_eq!(
            parse_ws_endpoint("DevTools listening on ws://127.0.0.1:9222/devtools/browser/abc"),
            Some("ws://127.0.0.1:9222/devtools/browser/abc".to_string())
        );
        assert_eq!(
            parse_ws_endpoint("Debugger listening on ws://127.0.0.1:9229/uuid here"),
            Some("ws://127.0.0.1:9229/uuid".to_string())
        );
        assert_eq!(parse_ws_endpoint("nothing to see"), None);
    }

    #[test]
    fn headless_runs_get_their_own_profile() {
        let mut args = dap::LaunchArguments {
            storage_path: Some("/tmp/jsdap-test".to_string()),
            ..Default::default()
        };
        assert_eq!(
            profile_directory(&args),
            PathBuf::from("/tmp/jsdap-test/.profile")
        );

        args.runtime_args = vec!["--headless=new".to_string()];
        assert_eq!(
            profile_directory(&args),
            PathBuf::from("/tmp/jsdap-test/.headless-profile")
        );
    }

    #[test]
    fn webview_env_carries_the_debug_port() {
        let env = webview_debugging_env(Path::new("/data"), 9333);
        assert!(env.contains(&(
            "WEBVIEW2_ADDITIONAL_BROWSER_ARGUMENTS".to_string(),
            "--remote-debugging-port=9333".to_string()
        )));
        assert!(env.contains(&(
            "WEBVIEW2_WAIT_FOR_SCRIPT_DEBUGGER".to_string(),
            "true".to_string()
        )));
    }
}
