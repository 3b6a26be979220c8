//! DAP server endpoint
//!
//! Splits the wire into a request reader owned by the dispatch loop and an
//! outbound pump task that serializes responses and events. The pump is the
//! only writer, so sequence numbers are allocated in one place and event
//! ordering matches emission ordering.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::common::{Error, Result};

use super::codec;
use super::types::{Event, EventMessage, RequestMessage, ResponseMessage};

/// An outbound DAP message awaiting sequence assignment
#[derive(Debug, Clone)]
pub enum Outbound {
    Response {
        request_seq: i64,
        command: String,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    },
    Event(Event),
}

/// Clonable handle used by adapter components to emit DAP traffic
#[derive(Clone)]
pub struct DapSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl DapSink {
    /// Create a sink feeding the given channel
    ///
    /// `DapServer` wires this to its outbound pump; tests wire it to a
    /// receiver they assert on.
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Emit a successful response to `request`
    pub fn respond_success(&self, request: &RequestMessage, body: Option<Value>) {
        tracing::debug!(seq = request.seq, command = %request.command, "response");
        let _ = self.tx.send(Outbound::Response {
            request_seq: request.seq,
            command: request.command.clone(),
            success: true,
            message: None,
            body,
        });
    }

    /// Emit an error response to `request`
    pub fn respond_error(&self, request: &RequestMessage, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(seq = request.seq, command = %request.command, error = %message, "error response");
        let _ = self.tx.send(Outbound::Response {
            request_seq: request.seq,
            command: request.command.clone(),
            success: false,
            message: Some(message),
            body: None,
        });
    }

    /// Emit an event
    pub fn send_event(&self, event: Event) {
        tracing::debug!(event = event.name(), "event");
        let _ = self.tx.send(Outbound::Event(event));
    }
}

/// DAP server endpoint over a framed transport
pub struct DapServer {
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    sink: DapSink,
}

impl DapServer {
    /// Create a server over the given streams
    ///
    /// Spawns the outbound pump; dropping the server closes the channel and
    /// ends the pump after the backlog drains.
    pub fn new(
        reader: impl AsyncBufRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(outbound_pump(writer, rx));

        Self {
            reader: Box::new(reader),
            sink: DapSink::new(tx),
        }
    }

    /// Handle used by components to emit responses and events
    pub fn sink(&self) -> DapSink {
        self.sink.clone()
    }

    /// Read the next request from the client
    ///
    /// Non-request messages are skipped. Returns `Ok(None)` when the client
    /// closes the stream.
    pub async fn next_request(&mut self) -> Result<Option<RequestMessage>> {
        loop {
            let Some(json) = codec::read_message(&mut self.reader).await? else {
                return Ok(None);
            };

            let value: Value = serde_json::from_str(&json)
                .map_err(|e| Error::DapProtocol(format!("invalid JSON: {e}")))?;

            match value.get("type").and_then(Value::as_str) {
                Some("request") => {
                    let request: RequestMessage = serde_json::from_value(value)?;
                    tracing::debug!(seq = request.seq, command = %request.command, "request");
                    return Ok(Some(request));
                }
                other => {
                    tracing::warn!(message_type = ?other, "ignoring non-request message");
                }
            }
        }
    }
}

/// Serialize outbound messages onto the wire in emission order
async fn outbound_pump(
    mut writer: impl AsyncWrite + Unpin,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut seq: i64 = 1;

    while let Some(outbound) = rx.recv().await {
        let json = match outbound {
            Outbound::Response {
                request_seq,
                command,
                success,
                message,
                body,
            } => serde_json::to_string(&ResponseMessage {
                seq,
                message_type: "response".to_string(),
                request_seq,
                success,
                command,
                message,
                body,
            }),
            Outbound::Event(event) => serde_json::to_string(&EventMessage {
                seq,
                message_type: "event".to_string(),
                event: event.name().to_string(),
                body: event.body(),
            }),
        };
        seq += 1;

        let json = match json {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize outbound message: {e}");
                continue;
            }
        };

        if let Err(e) = codec::write_message(&mut writer, &json).await {
            tracing::debug!("DAP writer closed: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn responses_and_events_share_one_sequence() {
        let (client_read, server_write) = tokio::io::duplex(4096);

        let server = DapServer::new(
            BufReader::new(tokio::io::empty()),
            server_write,
        );
        let sink = server.sink();

        let request = RequestMessage {
            seq: 7,
            message_type: "request".to_string(),
            command: "threads".to_string(),
            arguments: None,
        };
        sink.send_event(Event::Initialized);
        sink.respond_success(&request, None);
        drop(server);
        drop(sink);

        let mut reader = BufReader::new(client_read);
        let first = codec::read_message(&mut reader).await.unwrap().unwrap();
        let second = codec::read_message(&mut reader).await.unwrap().unwrap();

        let first: Value = serde_json::from_str(&first).unwrap();
        let second: Value = serde_json::from_str(&second).unwrap();
        assert_eq!(first["seq"], 1);
        assert_eq!(first["event"], "initialized");
        assert_eq!(second["seq"], 2);
        assert_eq!(second["request_seq"], 7);

        // Channel closed: nothing further on the wire
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
