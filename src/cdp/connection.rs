//! CDP connection and session handles
//!
//! The connection speaks either WebSocket or a NUL-delimited pipe. A reader
//! task parses incoming messages, resolves pending commands, and routes
//! events to the subscriber registered for their session. A writer task is
//! the single owner of the outgoing stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::common::{Error, Result};

/// A protocol event delivered to a session subscriber
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    id: u64,
    method: &'a str,
    params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ProtocolError>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
}

/// Error object of a CDP command response
#[derive(Debug, Deserialize)]
pub struct ProtocolError {
    pub code: i64,
    pub message: String,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, ProtocolError>>>>;

struct Shared {
    next_id: AtomicU64,
    /// Commands awaiting responses, keyed by call id
    pending: PendingMap,
    /// Event subscribers keyed by session id; the root session uses ""
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<CdpEvent>>>,
    outbound: mpsc::UnboundedSender<String>,
    closed_tx: watch::Sender<bool>,
}

/// Handle to a CDP connection, clonable and cheap
#[derive(Clone)]
pub struct CdpConnection {
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
}

impl CdpConnection {
    fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            outbound,
            closed_tx,
        });
        (Self { shared, closed_rx }, outbound_rx)
    }

    /// Connect over WebSocket
    pub async fn connect_ws(url: &str) -> Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::AttachFailed(format!("websocket connect to '{url}': {e}")))?;
        let (mut ws_writer, mut ws_reader) = stream.split();

        let (connection, mut outbound_rx) = Self::new();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        let shared = connection.shared.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => dispatch(&shared, &text),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            close(&shared);
        });

        Ok(connection)
    }

    /// Connect over a NUL-delimited pipe stream
    ///
    /// Also the transport used by tests over `tokio::io::duplex`.
    pub fn from_pipe(stream: impl AsyncRead + AsyncWrite + Unpin + Send + 'static) -> Self {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (connection, mut outbound_rx) = Self::new();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if write_half.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(&[0]).await.is_err() {
                    break;
                }
            }
        });

        let shared = connection.shared.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some(pos) = buf.iter().position(|&b| b == 0) {
                            let frame: Vec<u8> = buf.drain(..=pos).collect();
                            if let Ok(text) = std::str::from_utf8(&frame[..frame.len() - 1]) {
                                dispatch(&shared, text);
                            }
                        }
                    }
                }
            }
            close(&shared);
        });

        connection
    }

    /// The top-level browser session
    pub fn root_session(&self) -> CdpSession {
        CdpSession {
            connection: self.clone(),
            session_id: None,
        }
    }

    /// A flatten-multiplexed child session
    pub fn session(&self, session_id: &str) -> CdpSession {
        CdpSession {
            connection: self.clone(),
            session_id: Some(session_id.to_string()),
        }
    }

    /// Watch channel flipping to true when the transport goes away
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Whether the transport has gone away
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    async fn raw_request(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::CdpDisconnected);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(id, tx);

        let json = serde_json::to_string(&OutgoingMessage {
            id,
            method,
            params,
            session_id,
        })?;
        tracing::trace!(id, method, "CDP >>>");

        if self.shared.outbound.send(json).is_err() {
            self.shared.pending.lock().unwrap().remove(&id);
            return Err(Error::CdpDisconnected);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(Error::cdp_command_failed(method, &e.message)),
            // Sender dropped: connection torn down
            Err(_) => Err(Error::CdpDisconnected),
        }
    }
}

/// Handle to one CDP session on a connection
#[derive(Clone)]
pub struct CdpSession {
    connection: CdpConnection,
    session_id: Option<String>,
}

impl CdpSession {
    /// Session id, absent for the root session
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The owning connection
    pub fn connection(&self) -> &CdpConnection {
        &self.connection
    }

    /// Issue a command, best-effort
    ///
    /// `None` means the session has been torn down or the command failed;
    /// callers short-circuit and keep whatever resolutions they already
    /// have. Failures are logged, never retried.
    pub async fn request(&self, method: &str, params: Value) -> Option<Value> {
        match self
            .connection
            .raw_request(self.session_id.as_deref(), method, params)
            .await
        {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(method, "CDP command failed: {e}");
                None
            }
        }
    }

    /// Issue a command and deserialize its result
    pub async fn command<R: DeserializeOwned>(&self, method: &str, params: Value) -> Option<R> {
        let value = self.request(method, params).await?;
        match serde_json::from_value(value) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(method, "unexpected CDP result shape: {e}");
                None
            }
        }
    }

    /// Register as this session's event subscriber
    ///
    /// One subscriber per session; a later call replaces the earlier
    /// channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CdpEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connection
            .shared
            .subscribers
            .lock()
            .unwrap()
            .insert(self.session_id.clone().unwrap_or_default(), tx);
        rx
    }

    /// Drop this session's event subscription
    pub fn unsubscribe(&self) {
        self.connection
            .shared
            .subscribers
            .lock()
            .unwrap()
            .remove(&self.session_id.clone().unwrap_or_default());
    }
}

fn dispatch(shared: &Arc<Shared>, text: &str) {
    let message: IncomingMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("malformed CDP message: {e}");
            return;
        }
    };

    if let Some(id) = message.id {
        let sender = shared.pending.lock().unwrap().remove(&id);
        let Some(sender) = sender else {
            tracing::trace!(id, "response for unknown call id");
            return;
        };
        let result = match message.error {
            Some(error) => Err(error),
            None => Ok(message.result.unwrap_or(Value::Null)),
        };
        let _ = sender.send(result);
        return;
    }

    let Some(method) = message.method else {
        return;
    };
    tracing::trace!(method = %method, session = ?message.session_id, "CDP <<<");

    let key = message.session_id.clone().unwrap_or_default();
    let subscribers = shared.subscribers.lock().unwrap();
    if let Some(tx) = subscribers.get(&key) {
        let _ = tx.send(CdpEvent {
            method,
            params: message.params.unwrap_or(Value::Null),
            session_id: message.session_id,
        });
    } else {
        tracing::trace!(session = %key, "event for session without subscriber");
    }
}

/// Tear the connection down: all pending commands resolve as disconnected
fn close(shared: &Arc<Shared>) {
    shared.pending.lock().unwrap().clear();
    shared.subscribers.lock().unwrap().clear();
    let _ = shared.closed_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A raw scripted peer on the other end of a pipe transport
    async fn echo_peer(stream: impl AsyncRead + AsyncWrite + Send + 'static) {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = buf.iter().position(|&b| b == 0) {
                        let frame: Vec<u8> = buf.drain(..=pos).collect();
                        let message: Value =
                            serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
                        let response = json!({
                            "id": message["id"],
                            "result": { "echo": message["method"] },
                        });
                        let mut out = serde_json::to_vec(&response).unwrap();
                        out.push(0);
                        write_half.write_all(&out).await.unwrap();
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let (near, far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(echo_peer(far));

        let connection = CdpConnection::from_pipe(near);
        let session = connection.root_session();

        let result = session.request("Runtime.enable", json!({})).await.unwrap();
        assert_eq!(result["echo"], "Runtime.enable");
    }

    #[tokio::test]
    async fn pending_requests_resolve_none_on_disconnect() {
        let (near, far) = tokio::io::duplex(16 * 1024);
        let connection = CdpConnection::from_pipe(near);
        let session = connection.root_session();

        // Peer goes away without answering
        drop(far);

        let result = session.request("Runtime.enable", json!({})).await;
        assert!(result.is_none());

        let mut closed = connection.closed();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            closed.wait_for(|closed| *closed),
        )
        .await
        .expect("connection should report closed")
        .unwrap();
    }

    #[tokio::test]
    async fn events_route_by_session_id() {
        let (near, far) = tokio::io::duplex(16 * 1024);
        let connection = CdpConnection::from_pipe(near);

        let child = connection.session("ABC");
        let mut child_events = child.subscribe();
        let mut root_events = connection.root_session().subscribe();

        let (_read_half, mut write_half) = tokio::io::split(far);
        let mut frame = serde_json::to_vec(&json!({
            "method": "Debugger.resumed",
            "params": {},
            "sessionId": "ABC",
        }))
        .unwrap();
        frame.push(0);
        write_half.write_all(&frame).await.unwrap();

        let event = child_events.recv().await.unwrap();
        assert_eq!(event.method, "Debugger.resumed");
        assert_eq!(event.session_id.as_deref(), Some("ABC"));
        assert!(root_events.try_recv().is_err());
    }
}
