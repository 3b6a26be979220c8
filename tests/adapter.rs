//! End-to-end adapter tests against the mock CDP runtime
//!
//! These drive the real target tree, breakpoint manager, threads and
//! variable stores over an in-process protocol peer, covering the flows a
//! live browser would exercise: evaluation, setVariable, breakpoint
//! verification through source maps, the source-map pause gate, target
//! teardown ordering and async stacks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use jsdap::adapter::breakpoints::BreakpointManager;
use jsdap::adapter::targets::{TargetEvent, TargetManager};
use jsdap::adapter::thread::{BreakpointHitFeedback, Thread};
use jsdap::adapter::AdapterContext;
use jsdap::common::Settings;
use jsdap::dap::{self, DapSink, Outbound};
use jsdap::sources::{PathResolverConfig, ScriptSkipper, SourceContainer, SourcePathResolver};
use jsdap::testing::{MockHandle, MockRuntime};

struct Harness {
    handle: MockHandle,
    targets: Arc<TargetManager>,
    target_events: mpsc::UnboundedReceiver<TargetEvent>,
    breakpoints: Arc<BreakpointManager>,
    dap_rx: mpsc::UnboundedReceiver<Outbound>,
}

async fn harness() -> Harness {
    let (connection, handle) = MockRuntime::start();

    let context = Arc::new(AdapterContext::new());
    let resolver = Arc::new(SourcePathResolver::new(PathResolverConfig {
        web_root: Some(PathBuf::from("/workspace/site")),
        base_url: Some("http://localhost:8080/".to_string()),
        ..Default::default()
    }));
    let sources = SourceContainer::new(context.clone(), resolver);
    let (dap_tx, dap_rx) = mpsc::unbounded_channel();
    let sink = DapSink::new(dap_tx);

    let breakpoints =
        BreakpointManager::new(context.clone(), sources.clone(), sink.clone(), None);
    let (targets, target_events) = TargetManager::new(
        connection,
        sources,
        Arc::new(ScriptSkipper::new(&[])),
        breakpoints.clone(),
        sink,
        context,
        Settings::default(),
    );

    targets.connect_browser().await.unwrap();
    targets.configuration_done().await;

    Harness {
        handle,
        targets,
        target_events,
        breakpoints,
        dap_rx,
    }
}

/// Announce a page target and wait for its thread to come up
async fn attach_page(h: &mut Harness) -> Arc<Thread> {
    h.handle.announce_target(
        None,
        "sess-page",
        "page-1",
        "page",
        "http://localhost:8080/",
        false,
    );
    match next_target_event(&mut h.target_events).await {
        TargetEvent::Attached(target) => target.thread.clone().expect("page should have a thread"),
        TargetEvent::Detached { target_id, .. } => panic!("unexpected detach of {target_id}"),
    }
}

async fn next_target_event(rx: &mut mpsc::UnboundedReceiver<TargetEvent>) -> TargetEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a target event")
        .expect("target event stream ended")
}

/// Wait for a DAP event matching the predicate
async fn wait_for_event(
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    what: &str,
    predicate: impl Fn(&dap::Event) -> bool,
) -> dap::Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(Outbound::Event(event)) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("DAP stream ended waiting for {what}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn breakpoint_source(path: &str) -> dap::Source {
    dap::Source {
        path: Some(path.to_string()),
        ..Default::default()
    }
}

fn source_breakpoint(line: i64) -> dap::SourceBreakpoint {
    dap::SourceBreakpoint {
        line,
        column: None,
        condition: None,
        hit_condition: None,
        log_message: None,
    }
}

/// A one-entry source map as a data URL: generated (gen_line, gen_col)
/// maps to authored (src_line, src_col) of `source_url`
fn map_data_url(source_url: &str, gen_line: u32, gen_col: i64, src_line: i64, src_col: i64) -> String {
    let mut mappings = ";".repeat(gen_line as usize);
    for field in [gen_col, 0, src_line, src_col] {
        jsdap::sourcemap::vlq::encode(field, &mut mappings);
    }
    let map = json!({
        "version": 3,
        "sources": [source_url],
        "names": [],
        "mappings": mappings,
    });
    format!("data:application/json,{map}")
}

// === S1: evaluate returns scalars and objects ===

#[tokio::test]
async fn evaluate_returns_scalars_and_objects() {
    let mut h = harness().await;
    let thread = attach_page(&mut h).await;

    {
        let mut state = h.handle.state();
        state.eval_results.insert(
            "42".to_string(),
            json!({ "result": { "type": "number", "value": 42, "description": "42" } }),
        );
        state.eval_results.insert(
            "'42'".to_string(),
            json!({ "result": { "type": "string", "value": "42" } }),
        );
        state.eval_results.insert(
            "({foo:42})".to_string(),
            json!({ "result": {
                "type": "object",
                "className": "Object",
                "description": "Object",
                "objectId": "obj-1",
            } }),
        );
        state.object_properties.insert(
            "obj-1".to_string(),
            json!({ "result": [ {
                "name": "foo",
                "value": { "type": "number", "value": 42, "description": "42" },
                "enumerable": true,
                "isOwn": true,
            } ] }),
        );
    }

    let eval = |expression: &str| dap::EvaluateArguments {
        expression: expression.to_string(),
        frame_id: None,
        context: None,
    };

    let number = thread.evaluate(&eval("42")).await.unwrap();
    assert_eq!(number.result, "42");
    assert_eq!(number.variables_reference, 0);

    let string = thread.evaluate(&eval("'42'")).await.unwrap();
    assert_eq!(string.result, "'42'");
    assert_eq!(string.variables_reference, 0);

    let object = thread.evaluate(&eval("({foo:42})")).await.unwrap();
    assert!(object.variables_reference > 0);

    let variables = thread
        .variables()
        .variables(&dap::VariablesArguments {
            variables_reference: object.variables_reference,
            filter: None,
            start: None,
            count: None,
        })
        .await
        .unwrap();
    assert_eq!(variables.len(), 1);
    assert_eq!(variables[0].name, "foo");
    assert_eq!(variables[0].value, "42");
    assert_eq!(variables[0].variables_reference, 0);
}

// === S2: setVariable round-trip ===

#[tokio::test]
async fn set_variable_round_trip() {
    let mut h = harness().await;
    let thread = attach_page(&mut h).await;

    {
        let mut state = h.handle.state();
        state.eval_results.insert(
            "window.x = ({foo:42}); x".to_string(),
            json!({ "result": {
                "type": "object", "className": "Object",
                "description": "Object", "objectId": "obj-x",
            } }),
        );
        state.eval_results.insert(
            "{bar:17}".to_string(),
            json!({ "result": {
                "type": "object", "className": "Object",
                "description": "Object", "objectId": "obj-bar",
            } }),
        );
        // Assignment returns the freshly-assigned object
        state.call_function_results.insert(
            "obj-x".to_string(),
            json!({ "result": {
                "type": "object", "className": "Object",
                "description": "Object", "objectId": "obj-foo-new",
            } }),
        );
        state.object_properties.insert(
            "obj-foo-new".to_string(),
            json!({ "result": [ {
                "name": "bar",
                "value": { "type": "number", "value": 17, "description": "17" },
                "enumerable": true,
            } ] }),
        );
        // The parent now shows foo as an object
        state.object_properties.insert(
            "obj-x".to_string(),
            json!({ "result": [ {
                "name": "foo",
                "value": { "type": "object", "description": "Object", "objectId": "obj-foo-new" },
                "enumerable": true,
            } ] }),
        );
        // "baz" does not evaluate
        state.eval_results.insert(
            "baz".to_string(),
            json!({
                "result": { "type": "undefined" },
                "exceptionDetails": {
                    "text": "Uncaught",
                    "lineNumber": 0,
                    "columnNumber": 0,
                    "exception": {
                        "type": "object",
                        "subtype": "error",
                        "description": "ReferenceError: baz is not defined",
                    },
                },
            }),
        );
    }

    let object = thread
        .evaluate(&dap::EvaluateArguments {
            expression: "window.x = ({foo:42}); x".to_string(),
            frame_id: None,
            context: None,
        })
        .await
        .unwrap();
    let reference = object.variables_reference;
    assert!(reference > 0);

    let set = thread
        .variables()
        .set_variable(&dap::SetVariableArguments {
            variables_reference: reference,
            name: "foo".to_string(),
            value: "{bar:17}".to_string(),
        })
        .await
        .unwrap();
    assert!(set.variables_reference > 0);
    assert_eq!(set.value, "Object");

    let parent = thread
        .variables()
        .variables(&dap::VariablesArguments {
            variables_reference: reference,
            filter: None,
            start: None,
            count: None,
        })
        .await
        .unwrap();
    assert_eq!(parent[0].name, "foo");
    assert_eq!(parent[0].value, "Object");

    let child = thread
        .variables()
        .variables(&dap::VariablesArguments {
            variables_reference: set.variables_reference,
            filter: None,
            start: None,
            count: None,
        })
        .await
        .unwrap();
    assert_eq!(child[0].name, "bar");
    assert_eq!(child[0].value, "17");

    let error = thread
        .variables()
        .set_variable(&dap::SetVariableArguments {
            variables_reference: reference,
            name: "foo".to_string(),
            value: "baz".to_string(),
        })
        .await
        .unwrap_err();
    assert!(error.to_string().contains("baz is not defined"));
}

// === S3: breakpoint verification through a later-arriving source map ===

#[tokio::test]
async fn breakpoint_verifies_when_the_map_arrives() {
    let mut h = harness().await;
    let _thread = attach_page(&mut h).await;

    let response = h
        .breakpoints
        .set_breakpoints(
            &dap::SetBreakpointsArguments {
                source: breakpoint_source("/workspace/site/src/app.ts"),
                breakpoints: vec![source_breakpoint(5)],
            },
            &h.targets.threads(),
        )
        .await
        .unwrap();
    assert_eq!(response.breakpoints.len(), 1);
    assert!(!response.breakpoints[0].verified);

    // A bundle arrives whose map puts app.ts line 5 at generated line 42
    let map_url = map_data_url("http://localhost:8080/src/app.ts", 41, 0, 4, 0);
    h.handle.script_parsed(
        "sess-page",
        "script-1",
        "http://localhost:8080/bundle.js",
        Some(&map_url),
    );

    h.handle.wait_for_command("Debugger.setBreakpoint", 1).await;

    let event = wait_for_event(&mut h.dap_rx, "breakpoint change", |e| {
        matches!(e, dap::Event::Breakpoint(_))
    })
    .await;
    let dap::Event::Breakpoint(body) = event else { unreachable!() };
    assert_eq!(body.reason, "changed");
    assert!(body.breakpoint.verified);
    assert_eq!(body.breakpoint.line, Some(5));
}

// === S4: the source-map gate ===

#[tokio::test]
async fn source_map_gate_holds_the_runtime_until_breakpoints_are_set() {
    let mut h = harness().await;
    let _thread = attach_page(&mut h).await;

    h.breakpoints
        .set_breakpoints(
            &dap::SetBreakpointsArguments {
                source: breakpoint_source("/workspace/site/entry.ts"),
                breakpoints: vec![source_breakpoint(1)],
            },
            &h.targets.threads(),
        )
        .await
        .unwrap();

    // entry.ts line 1 sits at the very start of the compiled script
    let map_url = map_data_url("http://localhost:8080/entry.ts", 0, 0, 0, 0);
    h.handle.script_parsed(
        "sess-page",
        "script-1",
        "http://localhost:8080/entry.js",
        Some(&map_url),
    );
    h.handle.wait_for_command("Debugger.setBreakpoint", 1).await;

    // The instrumentation pause for that script: resolved location was at
    // line <= 1, so the thread stays paused and reports the stop
    h.handle.pause(
        "sess-page",
        json!({
            "reason": "instrumentation",
            "data": { "scriptId": "script-1" },
            "callFrames": [],
        }),
    );

    let stopped = wait_for_event(&mut h.dap_rx, "stopped", |e| {
        matches!(e, dap::Event::Stopped(_))
    })
    .await;
    let dap::Event::Stopped(body) = stopped else { unreachable!() };
    assert_eq!(body.reason, "entry");
    assert!(h.handle.commands("Debugger.resume").is_empty());

    // A script whose breakpoint lands further down resumes automatically.
    // The pause event is queued right behind scriptParsed: the session pump
    // must finish installing breakpoints before it releases the runtime.
    let far_map_url = map_data_url("http://localhost:8080/entry.ts", 9, 0, 9, 0);
    h.handle.script_parsed(
        "sess-page",
        "script-2",
        "http://localhost:8080/other.js",
        Some(&far_map_url),
    );
    h.handle.pause(
        "sess-page",
        json!({
            "reason": "instrumentation",
            "data": { "scriptId": "script-2" },
            "callFrames": [],
        }),
    );
    h.handle.wait_for_command("Debugger.resume", 1).await;

    let log = h.handle.command_log();
    let set_position = log
        .iter()
        .rposition(|m| m == "Debugger.setBreakpoint")
        .unwrap();
    let resume_position = log.iter().position(|m| m == "Debugger.resume").unwrap();
    assert!(
        set_position < resume_position,
        "breakpoints must be installed before the runtime resumes"
    );
}

// === S5: target tree teardown is post-order ===

#[tokio::test]
async fn target_tree_detaches_children_first() {
    let mut h = harness().await;
    let _page = attach_page(&mut h).await;

    h.handle.announce_target(
        Some("sess-page"),
        "sess-iframe",
        "iframe-1",
        "iframe",
        "http://localhost:8080/frame.html",
        false,
    );
    next_target_event(&mut h.target_events).await;

    h.handle.announce_target(
        Some("sess-iframe"),
        "sess-worker",
        "worker-1",
        "worker",
        "http://localhost:8080/worker.js",
        false,
    );
    next_target_event(&mut h.target_events).await;

    assert_eq!(h.targets.threads().len(), 3);

    // The whole page goes away
    h.handle.detach_target(None, "sess-page", "page-1");

    let mut order = Vec::new();
    for _ in 0..3 {
        match next_target_event(&mut h.target_events).await {
            TargetEvent::Detached { target_id, .. } => order.push(target_id),
            TargetEvent::Attached(_) => panic!("unexpected attach during teardown"),
        }
    }
    assert_eq!(order, vec!["worker-1", "iframe-1", "page-1"]);
    assert!(h.targets.threads().is_empty());
}

// === S6: async stacks with lazy parent fetching ===

#[tokio::test]
async fn async_stacks_materialize_lazily() {
    let mut h = harness().await;
    let thread = attach_page(&mut h).await;

    h.handle
        .script_parsed("sess-page", "script-1", "http://localhost:8080/app.js", None);

    let frame = |name: &str, line: u32| {
        json!({
            "functionName": name,
            "scriptId": "script-1",
            "url": "http://localhost:8080/app.js",
            "lineNumber": line,
            "columnNumber": 0,
        })
    };

    // Paused two promise continuations deep; a third chain is deferred
    // behind a stack trace id
    h.handle.pause(
        "sess-page",
        json!({
            "reason": "other",
            "callFrames": [ {
                "callFrameId": "frame-0",
                "functionName": "innermost",
                "location": { "scriptId": "script-1", "lineNumber": 12, "columnNumber": 0 },
                "url": "http://localhost:8080/app.js",
                "scopeChain": [],
            } ],
            "asyncStackTrace": {
                "description": "Promise.then",
                "callFrames": [ frame("step2", 8) ],
                "parent": {
                    "description": "Promise.then",
                    "callFrames": [ frame("step1", 4) ],
                    "parentId": { "id": "chain-3" },
                },
            },
        }),
    );
    wait_for_event(&mut h.dap_rx, "stopped", |e| {
        matches!(e, dap::Event::Stopped(_))
    })
    .await;

    h.handle.state().stack_traces.insert(
        "chain-3".to_string(),
        json!({ "stackTrace": {
            "description": "Promise.then",
            "callFrames": [ frame("main", 1) ],
        } }),
    );

    // Everything materialized inline comes back without a runtime round
    // trip: 1 sync frame, then two async chains with separators
    let inline = thread
        .stack_trace(&dap::StackTraceArguments {
            thread_id: thread.dap_id(),
            start_frame: None,
            levels: Some(5),
        })
        .await
        .unwrap();
    assert_eq!(inline.stack_frames.len(), 5);
    let separators = inline
        .stack_frames
        .iter()
        .filter(|f| f.presentation_hint.as_deref() == Some("label"))
        .count();
    assert_eq!(separators, 2);
    assert!(h.handle.commands("Debugger.getStackTrace").is_empty());

    // Asking past the materialized frames follows the parent id, once
    let full = thread
        .stack_trace(&dap::StackTraceArguments {
            thread_id: thread.dap_id(),
            start_frame: None,
            levels: Some(20),
        })
        .await
        .unwrap();
    assert_eq!(h.handle.commands("Debugger.getStackTrace").len(), 1);
    assert_eq!(full.stack_frames.len(), 7);
    assert_eq!(full.stack_frames.last().unwrap().name, "main");

    // Frame ids are stable across the two requests
    assert_eq!(inline.stack_frames[0].id, full.stack_frames[0].id);

    // Resuming releases every variable reference from this pause
    let scope_ref = {
        let object = json!({
            "type": "object", "className": "Object",
            "description": "Object", "objectId": "scope-1",
        });
        let remote: jsdap::cdp::protocol::RemoteObject =
            serde_json::from_value(object).unwrap();
        thread.variables().create_reference(&remote)
    };
    assert!(thread.variables().contains(scope_ref));

    h.handle
        .emit(Some("sess-page"), "Debugger.resumed", json!({}));
    wait_for_event(&mut h.dap_rx, "continued", |e| {
        matches!(e, dap::Event::Continued(_))
    })
    .await;
    assert!(!thread.variables().contains(scope_ref));
}

// === Breakpoint clearing leaves no runtime ids behind ===

#[tokio::test]
async fn clearing_breakpoints_uninstalls_runtime_ids() {
    let mut h = harness().await;
    let thread = attach_page(&mut h).await;

    // Load the compiled script first so the sibling strategy installs ids
    let map_url = map_data_url("http://localhost:8080/src/app.ts", 3, 0, 2, 0);
    h.handle.script_parsed(
        "sess-page",
        "script-1",
        "http://localhost:8080/bundle.js",
        Some(&map_url),
    );
    wait_for_script(&thread, "script-1").await;

    let source = breakpoint_source("/workspace/site/src/app.ts");
    h.breakpoints
        .set_breakpoints(
            &dap::SetBreakpointsArguments {
                source: source.clone(),
                breakpoints: vec![source_breakpoint(3)],
            },
            &h.targets.threads(),
        )
        .await
        .unwrap();

    // Both the URL strategy and the sibling strategy installed ids; all of
    // them resolve to the one breakpoint
    let candidates: Vec<String> = (1..=4)
        .flat_map(|n| [format!("url-bp-{n}"), format!("bp-{n}")])
        .collect();
    let hit = h.breakpoints.breakpoints_hit(&candidates);
    assert_eq!(hit.len(), 1, "all runtime ids belong to the one breakpoint");

    // Replacing with an empty set removes everything
    h.breakpoints
        .set_breakpoints(
            &dap::SetBreakpointsArguments {
                source,
                breakpoints: Vec::new(),
            },
            &h.targets.threads(),
        )
        .await
        .unwrap();

    assert!(!h.handle.commands("Debugger.removeBreakpoint").is_empty());
    let hit_after = h.breakpoints.breakpoints_hit(&candidates);
    assert!(hit_after.is_empty());
}

/// Poll until the thread has registered the script
async fn wait_for_script(thread: &Arc<Thread>, script_id: &str) {
    for _ in 0..500 {
        if thread.script(script_id).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for script {script_id}");
}
