//! The debug adapter: DAP requests in, CDP commands out
//!
//! One dispatch loop owns the DAP request stream and the target lifecycle
//! events; only this top layer converts errors into DAP error responses.

pub mod breakpoints;
pub mod context;
pub mod predictor;
pub mod stack;
pub mod targets;
pub mod thread;
pub mod variables;

pub use context::AdapterContext;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::cdp::CdpConnection;
use crate::common::{Error, Result, Settings};
use crate::dap::{self, DapServer, DapSink, RequestMessage};
use crate::launcher;
use crate::sources::{
    PathResolverConfig, ScriptSkipper, SourceContainer, SourcePathResolver, UiLocation,
};

use breakpoints::BreakpointManager;
use predictor::BreakpointPredictor;
use targets::{TargetEvent, TargetManager};
use thread::Thread;

/// Everything that exists while a debug session is connected
struct DebugSessionState {
    connection: CdpConnection,
    sources: Arc<SourceContainer>,
    breakpoints: Arc<BreakpointManager>,
    targets: Arc<TargetManager>,
    target_events: mpsc::UnboundedReceiver<TargetEvent>,
    closed: watch::Receiver<bool>,
    child: Option<tokio::process::Child>,
    launch_args: Option<dap::LaunchArguments>,
}

/// Per-session wiring parameters shared by launch and attach
struct SessionConfig {
    resolver: PathResolverConfig,
    skip_files: Vec<String>,
    predict_root: Option<PathBuf>,
    node: bool,
}

enum Tick {
    Request(Option<RequestMessage>),
    Target(Option<TargetEvent>),
    TransportClosed,
}

pub struct DebugAdapter {
    server: DapServer,
    sink: DapSink,
    settings: Settings,
    session: Option<DebugSessionState>,
}

impl DebugAdapter {
    pub fn new(server: DapServer, settings: Settings) -> Self {
        let sink = server.sink();
        Self {
            server,
            sink,
            settings,
            session: None,
        }
    }

    /// Attach to a CDP connection established by the embedder
    ///
    /// Used when the transport already exists: a pipe handed over by a
    /// parent process, or a test harness.
    pub async fn attach_connection(
        &mut self,
        connection: CdpConnection,
        args: &dap::AttachArguments,
    ) -> Result<()> {
        let config = SessionConfig {
            resolver: resolver_config_from_attach(args),
            skip_files: args.skip_files.clone(),
            predict_root: args.root_path.as_ref().map(PathBuf::from),
            node: false,
        };
        self.build_session(connection, config, None, None).await
    }

    /// Serve DAP until the client disconnects
    pub async fn run(mut self) -> Result<()> {
        loop {
            let tick = {
                let server = &mut self.server;
                match self.session.as_mut() {
                    Some(state) => tokio::select! {
                        request = server.next_request() => Tick::Request(request?),
                        event = state.target_events.recv() => Tick::Target(event),
                        _ = state.closed.changed() => Tick::TransportClosed,
                    },
                    None => Tick::Request(server.next_request().await?),
                }
            };

            match tick {
                Tick::Request(None) => {
                    tracing::info!("DAP client closed the stream");
                    self.teardown(true).await;
                    return Ok(());
                }
                Tick::Request(Some(request)) => {
                    if !self.handle_request(request).await {
                        return Ok(());
                    }
                }
                Tick::Target(Some(event)) => self.on_target_event(event).await,
                Tick::Target(None) => {}
                Tick::TransportClosed => {
                    // CDP transport loss is fatal for the session
                    tracing::info!("CDP connection closed, terminating session");
                    self.sink.send_event(dap::Event::Terminated);
                    self.teardown(false).await;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: RequestMessage) -> bool {
        let command = request.command.clone();
        match self.dispatch(&request).await {
            Ok(ControlFlow::Respond(body)) => {
                self.sink.respond_success(&request, body);
            }
            Ok(ControlFlow::Exit(body)) => {
                self.sink.respond_success(&request, body);
                return false;
            }
            Err(e) => {
                tracing::debug!(command = %command, "request failed: {e}");
                self.sink.respond_error(&request, e.to_string());
            }
        }
        true
    }

    async fn dispatch(&mut self, request: &RequestMessage) -> Result<ControlFlow> {
        let arguments = request.arguments.clone().unwrap_or(Value::Null);

        let body = match request.command.as_str() {
            "initialize" => {
                let _args: dap::InitializeArguments =
                    serde_json::from_value(arguments).unwrap_or_default();
                Some(serde_json::to_value(capabilities())?)
            }

            "launch" => {
                let args: dap::LaunchArguments = serde_json::from_value(arguments)?;
                self.launch(args).await?;
                None
            }

            "attach" => {
                let args: dap::AttachArguments = serde_json::from_value(arguments)?;
                let connection = launcher::attach(&args).await?;
                let config = SessionConfig {
                    resolver: resolver_config_from_attach(&args),
                    skip_files: args.skip_files.clone(),
                    predict_root: args.root_path.as_ref().map(PathBuf::from),
                    node: false,
                };
                self.build_session(connection, config, None, None).await?;
                None
            }

            "configurationDone" => {
                let state = self.state()?;
                // Breakpoint predictions block the program start so entry
                // breakpoints bind before the first line runs
                state.breakpoints.launch_blocker().await;
                state.targets.configuration_done().await;
                None
            }

            "setBreakpoints" => {
                let args: dap::SetBreakpointsArguments = serde_json::from_value(arguments)?;
                let state = self.state()?;
                let threads = state.targets.threads();
                let response = state.breakpoints.set_breakpoints(&args, &threads).await?;
                Some(serde_json::to_value(response)?)
            }

            "setExceptionBreakpoints" => {
                let args: dap::SetExceptionBreakpointsArguments =
                    serde_json::from_value(arguments)?;
                let pause_state = if args.filters.iter().any(|f| f == "all") {
                    "all"
                } else if args.filters.iter().any(|f| f == "uncaught") {
                    "uncaught"
                } else {
                    "none"
                };
                let state = self.state()?;
                for thread in state.targets.threads() {
                    thread
                        .session()
                        .request(
                            "Debugger.setPauseOnExceptions",
                            serde_json::json!({ "state": pause_state }),
                        )
                        .await;
                }
                None
            }

            "breakpointLocations" => {
                let args: dap::BreakpointLocationsArguments = serde_json::from_value(arguments)?;
                let response = self.breakpoint_locations(&args).await?;
                Some(serde_json::to_value(response)?)
            }

            "threads" => {
                let state = self.state()?;
                let threads = state
                    .targets
                    .threads()
                    .iter()
                    .map(|t| dap::Thread {
                        id: t.dap_id(),
                        name: t.name(),
                    })
                    .collect();
                Some(serde_json::to_value(dap::ThreadsResponseBody { threads })?)
            }

            "stackTrace" => {
                let args: dap::StackTraceArguments = serde_json::from_value(arguments)?;
                let thread = self.thread_by_id(args.thread_id)?;
                Some(serde_json::to_value(thread.stack_trace(&args).await?)?)
            }

            "scopes" => {
                let args: dap::ScopesArguments = serde_json::from_value(arguments)?;
                let thread = self.thread_owning_frame(args.frame_id)?;
                Some(serde_json::to_value(thread.scopes(args.frame_id)?)?)
            }

            "variables" => {
                let args: dap::VariablesArguments = serde_json::from_value(arguments)?;
                let thread = self.thread_owning_reference(args.variables_reference)?;
                let variables = thread.variables().variables(&args).await?;
                Some(serde_json::to_value(dap::VariablesResponseBody {
                    variables,
                })?)
            }

            "setVariable" => {
                let args: dap::SetVariableArguments = serde_json::from_value(arguments)?;
                let thread = self.thread_owning_reference(args.variables_reference)?;
                let response = thread.variables().set_variable(&args).await?;
                Some(serde_json::to_value(response)?)
            }

            "evaluate" => {
                let args: dap::EvaluateArguments = serde_json::from_value(arguments)?;
                let thread = match args.frame_id {
                    Some(frame_id) => self.thread_owning_frame(frame_id)?,
                    None => self.default_thread()?,
                };
                Some(serde_json::to_value(thread.evaluate(&args).await?)?)
            }

            "continue" => {
                let args: dap::ContinueArguments = serde_json::from_value(arguments)?;
                self.thread_by_id(args.thread_id)?.resume().await?;
                Some(serde_json::to_value(dap::ContinueResponseBody {
                    all_threads_continued: false,
                })?)
            }

            "next" => {
                let args: dap::StepArguments = serde_json::from_value(arguments)?;
                self.thread_by_id(args.thread_id)?.step_over().await?;
                None
            }

            "stepIn" => {
                let args: dap::StepArguments = serde_json::from_value(arguments)?;
                self.thread_by_id(args.thread_id)?.step_in().await?;
                None
            }

            "stepOut" => {
                let args: dap::StepArguments = serde_json::from_value(arguments)?;
                self.thread_by_id(args.thread_id)?.step_out().await?;
                None
            }

            "pause" => {
                let args: dap::PauseArguments = serde_json::from_value(arguments)?;
                self.thread_by_id(args.thread_id)?.pause().await?;
                None
            }

            "source" => {
                let args: dap::SourceArguments = serde_json::from_value(arguments)?;
                let reference = args
                    .source
                    .as_ref()
                    .and_then(|s| s.source_reference)
                    .unwrap_or(args.source_reference);
                let state = self.state()?;
                let source = state
                    .sources
                    .source_by_reference(reference)
                    .ok_or_else(|| Error::SourceNotFound(format!("reference {reference}")))?;
                let content = source.content().await?;
                Some(serde_json::to_value(dap::SourceResponseBody {
                    content,
                    mime_type: None,
                })?)
            }

            "restart" => {
                let args = self
                    .session
                    .as_ref()
                    .and_then(|s| s.launch_args.clone())
                    .ok_or_else(|| {
                        Error::Internal("only launched sessions can restart".to_string())
                    })?;
                self.teardown(true).await;
                self.launch(args).await?;
                None
            }

            "disconnect" => {
                let args: dap::DisconnectArguments =
                    serde_json::from_value(arguments).unwrap_or_default();
                let kill = args.terminate_debuggee.unwrap_or(true);
                self.teardown(kill).await;
                return Ok(ControlFlow::Exit(None));
            }

            "terminate" => {
                self.teardown(true).await;
                self.sink.send_event(dap::Event::Terminated);
                None
            }

            other => {
                return Err(Error::DapProtocol(format!("unsupported command '{other}'")));
            }
        };

        Ok(ControlFlow::Respond(body))
    }

    async fn launch(&mut self, args: dap::LaunchArguments) -> Result<()> {
        // The token wires launch cancellation; disconnect during a hung
        // launch drops the sender
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let launched = launcher::launch(&args, &self.settings, cancel_rx).await?;

        let config = SessionConfig {
            resolver: resolver_config_from_launch(&args),
            skip_files: args.skip_files.clone(),
            predict_root: args
                .root_path
                .as_ref()
                .or(args.web_root.as_ref())
                .map(PathBuf::from),
            node: args.runtime.as_deref() == Some("node"),
        };
        self.build_session(launched.connection, config, launched.child, Some(args))
            .await
    }

    /// Wire a session: sources, breakpoints, targets; then announce
    /// readiness for breakpoint configuration
    async fn build_session(
        &mut self,
        connection: CdpConnection,
        config: SessionConfig,
        child: Option<tokio::process::Child>,
        launch_args: Option<dap::LaunchArguments>,
    ) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::Internal("a debug session is already active".to_string()));
        }

        let context = Arc::new(AdapterContext::new());
        let resolver = Arc::new(SourcePathResolver::new(config.resolver));
        let sources = SourceContainer::new(context.clone(), resolver.clone());
        let skipper = Arc::new(ScriptSkipper::new(&config.skip_files));

        let predictor = match (&config.predict_root, self.settings.breakpoints.predict) {
            (Some(root), true) => Some(BreakpointPredictor::new(root.clone(), resolver)),
            _ => None,
        };
        let breakpoints = BreakpointManager::new(
            context.clone(),
            sources.clone(),
            self.sink.clone(),
            predictor,
        );

        let (targets, target_events) = TargetManager::new(
            connection.clone(),
            sources.clone(),
            skipper,
            breakpoints.clone(),
            self.sink.clone(),
            context,
            self.settings.clone(),
        );

        if config.node {
            targets.connect_node().await?;
        } else {
            targets.connect_browser().await?;
        }

        let closed = connection.closed();
        self.session = Some(DebugSessionState {
            connection,
            sources,
            breakpoints,
            targets,
            target_events,
            closed,
            child,
            launch_args,
        });

        let timeout =
            std::time::Duration::from_secs(self.settings.timeouts.main_target_secs);
        let waited = self
            .session
            .as_ref()
            .unwrap()
            .targets
            .wait_for_main_target(timeout)
            .await;
        if let Err(e) = waited {
            self.teardown(true).await;
            return Err(e);
        }

        // Ready for setBreakpoints and configurationDone
        self.sink.send_event(dap::Event::Initialized);
        Ok(())
    }

    async fn on_target_event(&mut self, event: TargetEvent) {
        match event {
            TargetEvent::Attached(target) => {
                if let Some(thread) = &target.thread {
                    self.sink.send_event(dap::Event::Thread(dap::ThreadEventBody {
                        reason: "started".to_string(),
                        thread_id: thread.dap_id(),
                    }));
                }
            }
            TargetEvent::Detached {
                thread_id,
                was_main,
                ..
            } => {
                if let Some(thread_id) = thread_id {
                    self.sink.send_event(dap::Event::Thread(dap::ThreadEventBody {
                        reason: "exited".to_string(),
                        thread_id,
                    }));
                }
                // Losing the main target ends the session
                if was_main {
                    let exit_code = self.reap_child();
                    self.sink.send_event(dap::Event::Terminated);
                    self.sink
                        .send_event(dap::Event::Exited(dap::ExitedEventBody { exit_code }));
                    self.teardown(true).await;
                }
            }
        }
    }

    async fn breakpoint_locations(
        &mut self,
        args: &dap::BreakpointLocationsArguments,
    ) -> Result<dap::BreakpointLocationsResponseBody> {
        let state = self.state()?;
        let source = state
            .sources
            .source_for_dap(&args.source)
            .ok_or_else(|| Error::SourceNotFound(format!("{:?}", args.source.path)))?;

        // Query against a compiled incarnation of the requested range
        let requested = UiLocation::new(source.clone(), args.line.max(1) as u32, 1);
        let compiled = if source.is_authored() {
            state
                .sources
                .current_sibling_ui_locations(&requested, None)
                .into_iter()
                .find(|l| !l.source.is_authored())
        } else {
            Some(requested)
        };
        let Some(compiled) = compiled else {
            return Ok(dap::BreakpointLocationsResponseBody {
                breakpoints: Vec::new(),
            });
        };

        let raw = state.sources.raw_locations(&compiled);
        let Some(raw) = raw.first() else {
            return Ok(dap::BreakpointLocationsResponseBody {
                breakpoints: Vec::new(),
            });
        };

        let thread = self.default_thread()?;
        let result: Option<crate::cdp::protocol::GetPossibleBreakpointsResult> = thread
            .session()
            .command(
                "Debugger.getPossibleBreakpoints",
                serde_json::json!({
                    "start": {
                        "scriptId": raw.script_id,
                        "lineNumber": raw.line,
                        "columnNumber": 0,
                    },
                    "end": {
                        "scriptId": raw.script_id,
                        "lineNumber": raw.line + 1,
                        "columnNumber": 0,
                    },
                }),
            )
            .await;

        let mut breakpoints = Vec::new();
        if let Some(result) = result {
            for location in result.locations {
                let ui = thread.ui_location_of_raw(&crate::sources::RawLocation {
                    script_id: location.script_id.clone(),
                    line: location.line_number,
                    column: location.column_number.unwrap_or(0),
                });
                if let Some(ui) = ui {
                    if Arc::ptr_eq(&ui.source, &source) {
                        breakpoints.push(dap::BreakpointLocation {
                            line: ui.line as i64,
                            column: Some(ui.column as i64),
                        });
                    }
                }
            }
        }
        Ok(dap::BreakpointLocationsResponseBody { breakpoints })
    }

    /// Exit code of a launched child that already terminated, if any
    fn reap_child(&mut self) -> i64 {
        let Some(state) = self.session.as_mut() else {
            return 0;
        };
        let Some(child) = state.child.as_mut() else {
            return 0;
        };
        match child.try_wait() {
            Ok(Some(status)) => status.code().unwrap_or(0) as i64,
            _ => 0,
        }
    }

    /// Stop debugging: detach targets and optionally kill a launched child
    async fn teardown(&mut self, kill_child: bool) {
        let Some(mut state) = self.session.take() else {
            return;
        };
        state.targets.dispose().await;
        if kill_child {
            if let Some(child) = &mut state.child {
                let _ = child.start_kill();
            }
        }
        drop(state.connection);
    }

    fn state(&self) -> Result<&DebugSessionState> {
        self.session.as_ref().ok_or(Error::NoSession)
    }

    fn thread_by_id(&self, thread_id: i64) -> Result<Arc<Thread>> {
        self.state()?
            .targets
            .thread_by_dap_id(thread_id)
            .ok_or(Error::ThreadNotFound(thread_id))
    }

    fn thread_owning_frame(&self, frame_id: i64) -> Result<Arc<Thread>> {
        self.state()?
            .targets
            .threads()
            .into_iter()
            .find(|t| t.has_frame(frame_id))
            .ok_or(Error::FrameNotFound(frame_id))
    }

    fn thread_owning_reference(&self, reference: i64) -> Result<Arc<Thread>> {
        self.state()?
            .targets
            .threads()
            .into_iter()
            .find(|t| t.variables().contains(reference))
            .ok_or(Error::VariablesReferenceNotFound(reference))
    }

    /// The main target's thread, or any thread as a fallback
    fn default_thread(&self) -> Result<Arc<Thread>> {
        let state = self.state()?;
        if let Some(thread) = state.targets.main_target().and_then(|t| t.thread.clone()) {
            return Ok(thread);
        }
        state
            .targets
            .threads()
            .into_iter()
            .next()
            .ok_or(Error::NoSession)
    }
}

enum ControlFlow {
    Respond(Option<Value>),
    Exit(Option<Value>),
}

fn capabilities() -> dap::Capabilities {
    dap::Capabilities {
        supports_configuration_done_request: Some(true),
        supports_conditional_breakpoints: Some(true),
        supports_log_points: Some(true),
        supports_evaluate_for_hovers: Some(true),
        supports_set_variable: Some(true),
        supports_restart_request: Some(true),
        supports_terminate_request: Some(true),
        supports_breakpoint_locations_request: Some(true),
        exception_breakpoint_filters: Some(vec![
            dap::ExceptionBreakpointsFilter {
                filter: "all".to_string(),
                label: "All Exceptions".to_string(),
                default: false,
            },
            dap::ExceptionBreakpointsFilter {
                filter: "uncaught".to_string(),
                label: "Uncaught Exceptions".to_string(),
                default: false,
            },
        ]),
    }
}

fn resolver_config_from_launch(args: &dap::LaunchArguments) -> PathResolverConfig {
    PathResolverConfig {
        root_path: args.root_path.as_ref().map(PathBuf::from),
        web_root: args.web_root.as_ref().map(PathBuf::from),
        base_url: args.url.clone(),
        path_overrides: args
            .source_map_path_overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        remote: false,
    }
}

fn resolver_config_from_attach(args: &dap::AttachArguments) -> PathResolverConfig {
    let remote = !matches!(args.host.as_str(), "127.0.0.1" | "localhost" | "::1");
    PathResolverConfig {
        root_path: args.root_path.as_ref().map(PathBuf::from),
        web_root: args.web_root.as_ref().map(PathBuf::from),
        base_url: None,
        path_overrides: args
            .source_map_path_overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        remote,
    }
}
