//! Wire-level DAP session test
//!
//! Runs the full dispatch loop over a framed duplex transport with the
//! mock runtime on the CDP side: a complete initialize / configure /
//! inspect / disconnect conversation.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};

use jsdap::adapter::DebugAdapter;
use jsdap::common::Settings;
use jsdap::dap::{codec, AttachArguments, DapServer};
use jsdap::testing::MockRuntime;

struct DapClient<S: AsyncRead + AsyncWrite> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    next_seq: i64,
}

impl<S: AsyncRead + AsyncWrite> DapClient<S> {
    fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            next_seq: 1,
        }
    }

    async fn request(&mut self, command: &str, arguments: Value) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let message = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        codec::write_message(&mut self.writer, &message.to_string())
            .await
            .unwrap();
        seq
    }

    async fn next_message(&mut self) -> Value {
        let text = tokio::time::timeout(
            Duration::from_secs(5),
            codec::read_message(&mut self.reader),
        )
        .await
        .expect("timed out reading a DAP message")
        .unwrap()
        .expect("DAP stream closed");
        serde_json::from_str(&text).unwrap()
    }

    /// Read messages until the response to `request_seq` arrives
    async fn response_to(&mut self, request_seq: i64) -> Value {
        loop {
            let message = self.next_message().await;
            if message["type"] == "response" && message["request_seq"] == request_seq {
                assert_eq!(
                    message["success"], true,
                    "request {request_seq} failed: {message}"
                );
                return message;
            }
        }
    }
}

#[tokio::test]
async fn full_session_over_the_wire() {
    let (cdp_connection, handle) = MockRuntime::start();

    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);
    let (server_read, server_write) = tokio::io::split(server_stream);
    let server = DapServer::new(BufReader::new(server_read), server_write);

    let mut adapter = DebugAdapter::new(server, Settings::default());

    // The main target shows up as soon as discovery starts
    let announcer = handle.clone();
    tokio::spawn(async move {
        announcer.wait_for_command("Target.setAutoAttach", 1).await;
        announcer.announce_target(
            None,
            "sess-page",
            "page-1",
            "page",
            "http://localhost:8080/",
            false,
        );
    });

    adapter
        .attach_connection(cdp_connection, &AttachArguments::default())
        .await
        .unwrap();
    tokio::spawn(adapter.run());

    handle.state().eval_results.insert(
        "1+1".to_string(),
        json!({ "result": { "type": "number", "value": 2, "description": "2" } }),
    );

    let mut client = DapClient::new(client_stream);

    let seq = client.request("initialize", json!({ "adapterID": "jsdap" })).await;
    let response = client.response_to(seq).await;
    assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);

    let seq = client.request("configurationDone", json!({})).await;
    client.response_to(seq).await;

    let seq = client.request("threads", json!({})).await;
    let response = client.response_to(seq).await;
    let threads = response["body"]["threads"].as_array().unwrap();
    assert_eq!(threads.len(), 1);
    assert!(threads[0]["name"].as_str().unwrap().starts_with("Page"));

    let seq = client
        .request("evaluate", json!({ "expression": "1+1" }))
        .await;
    let response = client.response_to(seq).await;
    assert_eq!(response["body"]["result"], "2");
    assert_eq!(response["body"]["variablesReference"], 0);

    let seq = client.request("disconnect", json!({})).await;
    client.response_to(seq).await;
}
