//! Tree of CDP sessions and target lifecycle
//!
//! Discovery and auto-attach propagate recursively: every attached session
//! asks for its own children, and every message is routed by flatten
//! session id. Detach runs depth-first so children always go away before
//! their parents. The first attached page is the main target; when it goes,
//! the session goes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::cdp::protocol::{AttachedToTargetEvent, DetachedFromTargetEvent};
use crate::cdp::{CdpConnection, CdpEvent, CdpSession};
use crate::common::{Error, Result, Settings};
use crate::dap::DapSink;
use crate::sources::{ScriptSkipper, SourceContainer};

use super::breakpoints::BreakpointManager;
use super::context::AdapterContext;
use super::thread::Thread;

/// Node's module wrapper occupies the first 62 columns of line 0
const NODE_SCRIPT_OFFSET: (u32, u32) = (0, 62);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Page,
    IFrame,
    Worker,
    ServiceWorker,
    Node,
    Other(String),
}

impl TargetKind {
    fn from_type(target_type: &str) -> Self {
        match target_type {
            "page" => TargetKind::Page,
            "iframe" => TargetKind::IFrame,
            "worker" => TargetKind::Worker,
            "service_worker" => TargetKind::ServiceWorker,
            "node" => TargetKind::Node,
            other => TargetKind::Other(other.to_string()),
        }
    }

    /// Whether this target runs script we can debug as a thread
    fn is_debuggable(&self) -> bool {
        matches!(
            self,
            TargetKind::Page | TargetKind::IFrame | TargetKind::Worker | TargetKind::Node
        )
    }

    fn label(&self) -> &str {
        match self {
            TargetKind::Page => "Page",
            TargetKind::IFrame => "Frame",
            TargetKind::Worker => "Worker",
            TargetKind::ServiceWorker => "Service Worker",
            TargetKind::Node => "Node",
            TargetKind::Other(other) => other,
        }
    }
}

/// One CDP session attachment
pub struct Target {
    pub target_id: String,
    pub kind: TargetKind,
    /// Non-owning handle to the parent; children are never followed
    /// upwards during destruction
    pub parent_id: Option<String>,
    pub session_id: String,
    pub session: CdpSession,
    pub title: String,
    pub url: String,
    pub thread: Option<Arc<Thread>>,
    children: Mutex<Vec<String>>,
}

/// Lifecycle notifications delivered to the adapter loop
#[derive(Clone)]
pub enum TargetEvent {
    Attached(Arc<Target>),
    Detached {
        target_id: String,
        thread_id: Option<i64>,
        was_main: bool,
    },
}

#[derive(Default)]
struct Inner {
    targets: HashMap<String, Arc<Target>>,
    by_session: HashMap<String, String>,
    main_target_id: Option<String>,
    configuration_done: bool,
}

pub struct TargetManager {
    connection: CdpConnection,
    sources: Arc<SourceContainer>,
    skipper: Arc<ScriptSkipper>,
    breakpoints: Arc<BreakpointManager>,
    dap: DapSink,
    context: Arc<AdapterContext>,
    settings: Settings,
    inner: Mutex<Inner>,
    events_tx: mpsc::UnboundedSender<TargetEvent>,
    main_target_tx: watch::Sender<Option<String>>,
}

impl TargetManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: CdpConnection,
        sources: Arc<SourceContainer>,
        skipper: Arc<ScriptSkipper>,
        breakpoints: Arc<BreakpointManager>,
        dap: DapSink,
        context: Arc<AdapterContext>,
        settings: Settings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TargetEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (main_target_tx, _) = watch::channel(None);
        let manager = Arc::new(Self {
            connection,
            sources,
            skipper,
            breakpoints,
            dap,
            context,
            settings,
            inner: Mutex::new(Inner::default()),
            events_tx,
            main_target_tx,
        });
        (manager, events_rx)
    }

    /// Start discovery against a browser endpoint
    pub async fn connect_browser(self: &Arc<Self>) -> Result<()> {
        let root = self.connection.root_session();
        let events = root.subscribe();
        tokio::spawn(self.clone().session_pump(events, None));

        root.request("Target.setDiscoverTargets", json!({ "discover": true }))
            .await
            .ok_or(Error::CdpDisconnected)?;
        enable_auto_attach(&root).await;
        Ok(())
    }

    /// Treat the connection's root session itself as a Node target
    pub async fn connect_node(self: &Arc<Self>) -> Result<()> {
        let root = self.connection.root_session();
        self.attach_target(
            root,
            "node".to_string(),
            String::new(),
            TargetKind::Node,
            "Node".to_string(),
            String::new(),
            None,
            true,
        )
        .await;
        Ok(())
    }

    /// Wait until the first page (or node) target has attached
    pub async fn wait_for_main_target(&self, timeout: Duration) -> Result<Arc<Target>> {
        let mut rx = self.main_target_tx.subscribe();
        let result = tokio::time::timeout(timeout, async {
            loop {
                if let Some(target_id) = rx.borrow_and_update().clone() {
                    return target_id;
                }
                if rx.changed().await.is_err() {
                    return String::new();
                }
            }
        })
        .await
        .map_err(|_| Error::AttachFailed("timed out waiting for the main target".to_string()))?;

        self.inner
            .lock()
            .unwrap()
            .targets
            .get(&result)
            .cloned()
            .ok_or_else(|| Error::AttachFailed("main target went away".to_string()))
    }

    /// All live debuggable threads
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner
            .lock()
            .unwrap()
            .targets
            .values()
            .filter_map(|t| t.thread.clone())
            .collect()
    }

    pub fn thread_by_dap_id(&self, dap_id: i64) -> Option<Arc<Thread>> {
        self.threads().into_iter().find(|t| t.dap_id() == dap_id)
    }

    pub fn main_target(&self) -> Option<Arc<Target>> {
        let inner = self.inner.lock().unwrap();
        inner
            .main_target_id
            .as_ref()
            .and_then(|id| inner.targets.get(id).cloned())
    }

    /// Configuration is complete: release every target that attached
    /// paused, and release future ones immediately
    pub async fn configuration_done(&self) {
        self.inner.lock().unwrap().configuration_done = true;
        for thread in self.threads() {
            thread.run_if_waiting().await;
        }
    }

    /// Detach everything, children before parents
    pub async fn dispose(self: &Arc<Self>) {
        let roots: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .targets
                .values()
                .filter(|t| t.parent_id.is_none())
                .map(|t| t.target_id.clone())
                .collect()
        };
        for target_id in roots {
            self.detach_recursive(&target_id).await;
        }
    }

    /// Per-session event pump; events are processed strictly in arrival
    /// order
    // Plain fn returning a boxed trait object, not `async fn`: session_pump
    // and attach_target are mutually recursive through tokio::spawn, and an
    // opaque `impl Future` return type here makes rustc's Send inference
    // cyclic. Boxing gives it a concrete, already-`Send` type so the cycle
    // never needs to resolve.
    fn session_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<CdpEvent>,
        thread: Option<Arc<Thread>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            while let Some(event) = events.recv().await {
                let method = event.method.clone();
                match method.as_str() {
                    "Target.attachedToTarget" => {
                        let parent_session = event.session_id.clone();
                        match serde_json::from_value::<AttachedToTargetEvent>(event.params) {
                            Ok(params) => {
                                self.on_attached_to_target(params, parent_session).await
                            }
                            Err(e) => tracing::warn!("bad attachedToTarget payload: {e}"),
                        }
                    }
                    "Target.detachedFromTarget" => {
                        match serde_json::from_value::<DetachedFromTargetEvent>(event.params) {
                            Ok(params) => self.on_detached_from_target(params).await,
                            Err(e) => tracing::warn!("bad detachedFromTarget payload: {e}"),
                        }
                    }
                    "Debugger.breakpointResolved" => {
                        if let (Some(thread), Ok(params)) =
                            (&thread, serde_json::from_value(event.params))
                        {
                            self.breakpoints.on_breakpoint_resolved(thread, &params);
                        }
                    }
                    _ => {
                        if let Some(thread) = &thread {
                            thread.handle_event(event).await;
                        }
                    }
                }
            }
        })
    }

    async fn on_attached_to_target(
        self: &Arc<Self>,
        params: AttachedToTargetEvent,
        parent_session: Option<String>,
    ) {
        let kind = TargetKind::from_type(&params.target_info.target_type);
        tracing::info!(
            target = %params.target_info.target_id,
            kind = ?kind,
            url = %params.target_info.url,
            "target attached"
        );

        // The attach event is delivered on the parent's session; a
        // top-level attach arrives on the root session.
        let parent_id = {
            let inner = self.inner.lock().unwrap();
            parent_session
                .as_ref()
                .and_then(|sid| inner.by_session.get(sid).cloned())
        };

        let session = self.connection.session(&params.session_id);
        self.attach_target(
            session,
            params.target_info.target_id,
            params.session_id,
            kind,
            params.target_info.title,
            params.target_info.url,
            parent_id,
            params.waiting_for_debugger,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn attach_target(
        self: &Arc<Self>,
        session: CdpSession,
        target_id: String,
        session_id: String,
        kind: TargetKind,
        title: String,
        url: String,
        parent_id: Option<String>,
        waiting_for_debugger: bool,
    ) {
        // Subscribe before enabling any domain so no event is dropped
        let events = session.subscribe();

        let thread = if kind.is_debuggable() {
            let name = if title.is_empty() {
                format!("{} {}", kind.label(), target_id)
            } else {
                format!("{}: {}", kind.label(), title)
            };
            let offset = match kind {
                TargetKind::Node => Some(NODE_SCRIPT_OFFSET),
                _ => None,
            };
            Some(Thread::new(
                name,
                session.clone(),
                self.sources.clone(),
                self.skipper.clone(),
                self.dap.clone(),
                self.context.clone(),
                self.settings.clone(),
                offset,
            ))
        } else {
            None
        };

        let target = Arc::new(Target {
            target_id: target_id.clone(),
            kind: kind.clone(),
            parent_id: parent_id.clone(),
            session_id: session_id.clone(),
            session: session.clone(),
            title,
            url,
            thread: thread.clone(),
            children: Mutex::new(Vec::new()),
        });

        let is_main = {
            let mut inner = self.inner.lock().unwrap();
            inner.targets.insert(target_id.clone(), target.clone());
            if !session_id.is_empty() {
                inner.by_session.insert(session_id, target_id.clone());
            }
            if let Some(parent_id) = &parent_id {
                if let Some(parent) = inner.targets.get(parent_id) {
                    parent.children.lock().unwrap().push(target_id.clone());
                }
            }
            let is_main = inner.main_target_id.is_none()
                && matches!(kind, TargetKind::Page | TargetKind::Node);
            if is_main {
                inner.main_target_id = Some(target_id.clone());
            }
            is_main
        };

        tokio::spawn(self.clone().session_pump(events, thread.clone()));

        if let Some(thread) = &thread {
            if let Some(handler) = self.breakpoint_handler() {
                thread.set_script_source_map_handler(handler);
            }
            thread.set_breakpoint_hit_feedback(self.breakpoints.clone());
            if let Err(e) = thread.initialize().await {
                tracing::warn!(target = %target.target_id, "thread initialization failed: {e}");
            }
            self.breakpoints.apply_to_thread(thread).await;
        }

        // Children of this target attach through its own session
        enable_auto_attach(&session).await;

        let released = self.inner.lock().unwrap().configuration_done;
        if waiting_for_debugger && released {
            if let Some(thread) = &thread {
                thread.run_if_waiting().await;
            } else {
                session
                    .request("Runtime.runIfWaitingForDebugger", json!({}))
                    .await;
            }
        }

        if is_main {
            let _ = self.main_target_tx.send(Some(target.target_id.clone()));
        }
        let _ = self.events_tx.send(TargetEvent::Attached(target));
    }

    async fn on_detached_from_target(self: &Arc<Self>, params: DetachedFromTargetEvent) {
        let target_id = {
            let inner = self.inner.lock().unwrap();
            params
                .target_id
                .clone()
                .filter(|id| inner.targets.contains_key(id))
                .or_else(|| {
                    params
                        .session_id
                        .as_ref()
                        .and_then(|sid| inner.by_session.get(sid).cloned())
                })
        };
        let Some(target_id) = target_id else { return };
        self.detach_recursive(&target_id).await;
    }

    /// Depth-first detach: all children first, then the target itself
    async fn detach_recursive(self: &Arc<Self>, target_id: &str) {
        let Some(target) = self.inner.lock().unwrap().targets.get(target_id).cloned() else {
            return;
        };

        let children: Vec<String> = target.children.lock().unwrap().clone();
        for child_id in children {
            Box::pin(self.detach_recursive(&child_id)).await;
        }

        if let Some(thread) = &target.thread {
            thread.dispose();
        } else {
            target.session.unsubscribe();
        }

        let was_main = {
            let mut inner = self.inner.lock().unwrap();
            inner.targets.remove(target_id);
            inner.by_session.remove(&target.session_id);
            if let Some(parent_id) = &target.parent_id {
                if let Some(parent) = inner.targets.get(parent_id) {
                    parent
                        .children
                        .lock()
                        .unwrap()
                        .retain(|id| id != target_id);
                }
            }
            if inner.main_target_id.as_deref() == Some(target_id) {
                inner.main_target_id = None;
                true
            } else {
                false
            }
        };

        tracing::info!(target = %target_id, was_main, "target detached");
        let _ = self.events_tx.send(TargetEvent::Detached {
            target_id: target_id.to_string(),
            thread_id: target.thread.as_ref().map(|t| t.dap_id()),
            was_main,
        });
    }

    fn breakpoint_handler(&self) -> Option<Arc<dyn super::thread::ScriptSourceMapHandler>> {
        Some(self.breakpoints.clone())
    }
}

async fn enable_auto_attach(session: &CdpSession) {
    session
        .request(
            "Target.setAutoAttach",
            json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": true,
                "flatten": true,
            }),
        )
        .await;
}
