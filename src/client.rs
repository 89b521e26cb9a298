//! Task RPC client library.
//!
//! `TaskClient` connects to a running daemon over plain-TCP WebSocket
//! (transport encryption is intentionally disabled in this deployment
//! profile) and offers one typed helper per RPC. Every call attaches the
//! caller's header map plus the bearer token as outgoing metadata and is
//! gzip-compressed by default. Errors come back as `ClientError` values —
//! process termination is the CLI's business, not this module's.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mask::FieldMask;
use crate::rpc::{codec, wire};
use crate::service::{TaskRow, UpdateTaskRequest};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Ws, Message>;
type WsStream = SplitStream<Ws>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with a JSON-RPC error.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i32, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("call cancelled")]
    Cancelled,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl ClientError {
    pub fn code(&self) -> Option<i32> {
        match self {
            ClientError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bearer token attached to every call's metadata.
    pub token: String,
    /// Extra caller-supplied headers merged into every call's metadata.
    pub headers: HashMap<String, String>,
    /// Gzip-compress every frame (default true).
    pub compress: bool,
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            token: String::new(),
            headers: HashMap::new(),
            compress: true,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A connection to the daemon plus a typed stub for the four task RPCs.
pub struct TaskClient {
    url: String,
    opts: ClientOptions,
    ws: Option<Ws>,
    next_id: u64,
}

impl TaskClient {
    /// Connect to `addr` (e.g. `127.0.0.1:4520`) and return a ready client.
    pub async fn connect(addr: &str, opts: ClientOptions) -> Result<Self, ClientError> {
        let url = format!("ws://{addr}");
        let ws = Self::dial(&url, opts.connect_timeout).await?;
        Ok(Self {
            url,
            opts,
            ws: Some(ws),
            next_id: 1,
        })
    }

    async fn dial(url: &str, timeout: Duration) -> Result<Ws, ClientError> {
        let (ws, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::ConnectTimeout(url.to_string()))?
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(ws)
    }

    /// Reconnect lazily if a previous call tore the connection down.
    async fn ensure_connected(&mut self) -> Result<(), ClientError> {
        if self.ws.is_none() {
            self.ws = Some(Self::dial(&self.url, self.opts.connect_timeout).await?);
        }
        Ok(())
    }

    /// Outgoing metadata: caller headers plus the authorization bearer token.
    fn build_meta(&self) -> Value {
        let mut meta = serde_json::Map::new();
        for (k, v) in &self.opts.headers {
            meta.insert(k.clone(), Value::String(v.clone()));
        }
        if !self.opts.token.is_empty() {
            meta.insert(
                "authorization".to_string(),
                Value::String(format!("Bearer {}", self.opts.token)),
            );
        }
        Value::Object(meta)
    }

    fn open_frame(&mut self, method: &str, params: Value) -> (Value, String) {
        let id = Value::from(self.next_id);
        self.next_id += 1;
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
            "meta": self.build_meta(),
        })
        .to_string();
        (id, frame)
    }

    /// `task.add` — unary. Returns the assigned task id.
    pub async fn add_task(
        &mut self,
        description: &str,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<u64, ClientError> {
        self.ensure_connected().await?;
        let params = serde_json::json!({
            "description": description,
            "due_date": due_date,
        });
        let (id, frame) = self.open_frame("task.add", params);
        let started = std::time::Instant::now();
        let compress = self.opts.compress;

        // Own the socket for the call's duration; a transport failure drops
        // it so the next call re-dials.
        let mut ws = self.ws.take().expect("connected above");
        let result = async {
            ws.send(encode(frame, compress)?).await?;
            recv_final(&mut ws, &id).await
        }
        .await;

        if !matches!(result, Err(ClientError::Transport(_))) {
            self.ws = Some(ws);
        }
        self.log_call("task.add", started, &result);
        let result = result?;
        result["id"]
            .as_u64()
            .ok_or_else(|| ClientError::Protocol("task.add result missing id".to_string()))
    }

    /// `task.list` — server-streaming. Collects every row the server sends
    /// until the final response. Cancelling the token aborts the call by
    /// tearing the connection down.
    pub async fn list_tasks(
        &mut self,
        mask: &FieldMask,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskRow>, ClientError> {
        self.ensure_connected().await?;
        let params = serde_json::json!({ "mask": mask });
        let (id, frame) = self.open_frame("task.list", params);
        let started = std::time::Instant::now();

        // Own the socket for the call's duration; it is restored afterwards
        // unless the call tore the connection down.
        let mut ws = self.ws.take().expect("connected above");
        ws.send(encode(frame, self.opts.compress)?).await?;

        let mut rows = Vec::new();
        let result = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break Err(ClientError::Cancelled),
                event = recv_event(&mut ws, &id) => event,
            };
            match event {
                Ok(CallEvent::Item(item)) => {
                    match serde_json::from_value::<TaskRow>(item) {
                        Ok(row) => rows.push(row),
                        Err(e) => {
                            break Err(ClientError::Protocol(format!("bad task row: {e}")))
                        }
                    }
                }
                Ok(CallEvent::Final(Ok(_))) => break Ok(rows),
                Ok(CallEvent::Final(Err(e))) => break Err(e),
                Err(e) => break Err(e),
            }
        };

        if !matches!(
            result,
            Err(ClientError::Cancelled) | Err(ClientError::Transport(_))
        ) {
            self.ws = Some(ws);
        }
        self.log_call("task.list", started, &result);
        result
    }

    /// `task.update` — client-streaming. Sends every update, half-closes,
    /// and waits for the single acknowledgment.
    pub async fn update_tasks(
        &mut self,
        updates: Vec<UpdateTaskRequest>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.ensure_connected().await?;
        let (id, frame) = self.open_frame("task.update", serde_json::json!({}));
        let started = std::time::Instant::now();
        let compress = self.opts.compress;

        let mut ws = self.ws.take().expect("connected above");
        let result = async {
            ws.send(encode(frame, compress)?).await?;
            for update in updates {
                if cancel.is_cancelled() {
                    return Err(ClientError::Cancelled);
                }
                let item = serde_json::to_value(&update)
                    .map_err(|e| ClientError::Protocol(e.to_string()))?;
                ws.send(encode(wire::stream_item(&id, item), compress)?)
                    .await?;
            }
            ws.send(encode(wire::stream_end(&id), compress)?).await?;

            tokio::select! {
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                result = recv_final(&mut ws, &id) => result.map(|_| ()),
            }
        }
        .await;

        if !matches!(
            result,
            Err(ClientError::Cancelled) | Err(ClientError::Transport(_))
        ) {
            self.ws = Some(ws);
        }
        self.log_call("task.update", started, &result);
        result
    }

    /// `task.delete` — bidirectional. Returns the number of acks drained.
    ///
    /// Sending and receiving run concurrently: the socket is split, a drain
    /// task consumes ack frames while this task sends requests, and after the
    /// half-close the drain task's join handle is the completion signal. The
    /// call does not return until every ack has been drained.
    pub async fn delete_tasks(
        &mut self,
        ids: Vec<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, ClientError> {
        self.ensure_connected().await?;
        let (id, frame) = self.open_frame("task.delete", serde_json::json!({}));
        let started = std::time::Instant::now();
        let compress = self.opts.compress;

        let ws = self.ws.take().expect("connected above");
        let (mut sink, rx) = ws.split();

        if let Err(e) = sink.send(encode(frame, compress)?).await {
            return Err(e.into());
        }

        // Drain acks concurrently with sending. The handle returns the
        // receive half so the socket can be reunited afterwards.
        let mut drain = tokio::spawn(drain_acks(rx, id.clone()));

        let send_result: Result<(), ClientError> = async {
            for task_id in ids {
                if cancel.is_cancelled() {
                    return Err(ClientError::Cancelled);
                }
                let item = serde_json::json!({ "id": task_id });
                sink.send(encode(wire::stream_item(&id, item), compress)?)
                    .await?;
            }
            // Close-send: no more requests; the server answers with the
            // final response once it has acked everything.
            sink.send(encode(wire::stream_end(&id), compress)?).await?;
            Ok(())
        }
        .await;

        if let Err(e) = send_result {
            drain.abort();
            let result: Result<u64, ClientError> = Err(e);
            self.log_call("task.delete", started, &result);
            return result;
        }

        // Completion signal: join the drain task, then reunite the halves.
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                drain.abort();
                Err(ClientError::Cancelled)
            }
            joined = &mut drain => match joined {
                Ok((outcome, rx)) => {
                    match sink.reunite(rx) {
                        Ok(ws) => self.ws = Some(ws),
                        Err(e) => debug!(err = %e, "could not reunite socket halves"),
                    }
                    outcome
                }
                Err(e) => Err(ClientError::Transport(format!("drain task failed: {e}"))),
            },
        };

        if matches!(result, Err(ClientError::Cancelled)) {
            self.ws = None;
        }
        self.log_call("task.delete", started, &result);
        result
    }

    /// Client-side forward analog of the server's logging interceptor.
    fn log_call<T>(&self, method: &str, started: std::time::Instant, result: &Result<T, ClientError>) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => debug!(method, elapsed_ms, outcome = "ok", "client call finished"),
            Err(e) => warn!(method, elapsed_ms, err = %e, "client call failed"),
        }
    }
}

fn encode(text: String, compress: bool) -> Result<Message, ClientError> {
    codec::encode(text, compress).map_err(|e| ClientError::Transport(e.to_string()))
}

enum CallEvent {
    Item(Value),
    Final(Result<Value, ClientError>),
}

/// Receive the next event for the call with the given id, skipping frames
/// that belong to no active call.
async fn recv_event(ws: &mut Ws, call_id: &Value) -> Result<CallEvent, ClientError> {
    loop {
        let msg = match ws.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(ClientError::Transport(e.to_string())),
            None => return Err(ClientError::Transport("connection closed".to_string())),
        };
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                let (text, _) = codec::decode(msg)
                    .map_err(|e| ClientError::Protocol(format!("undecodable frame: {e}")))?;
                if let Some(event) = parse_event(&text, call_id)? {
                    return Ok(event);
                }
            }
            Message::Close(_) => {
                return Err(ClientError::Transport("connection closed".to_string()))
            }
            _ => {}
        }
    }
}

/// Parse wire text into a call event; `None` for frames of other calls.
fn parse_event(text: &str, call_id: &Value) -> Result<Option<CallEvent>, ClientError> {
    let v: Value = serde_json::from_str(text)
        .map_err(|e| ClientError::Protocol(format!("bad frame: {e}")))?;
    if v.get("id") != Some(call_id) {
        debug!("frame for another call — skipped");
        return Ok(None);
    }
    if let Some(stream) = v.get("stream") {
        if let Some(item) = stream.get("item") {
            return Ok(Some(CallEvent::Item(item.clone())));
        }
        return Ok(None);
    }
    if let Some(err) = v.get("error") {
        let rpc_err: wire::RpcError = serde_json::from_value(err.clone())
            .map_err(|e| ClientError::Protocol(format!("bad error object: {e}")))?;
        return Ok(Some(CallEvent::Final(Err(ClientError::Rpc {
            code: rpc_err.code,
            message: rpc_err.message,
        }))));
    }
    Ok(Some(CallEvent::Final(Ok(v
        .get("result")
        .cloned()
        .unwrap_or(Value::Null)))))
}

/// Wait for the final response of a unary (or close-acked) call.
async fn recv_final(ws: &mut Ws, call_id: &Value) -> Result<Value, ClientError> {
    loop {
        match recv_event(ws, call_id).await? {
            CallEvent::Final(result) => return result,
            CallEvent::Item(_) => {
                debug!("unexpected stream item on unary call — skipped");
            }
        }
    }
}

/// Drain ack frames for a delete call until the final response arrives.
///
/// Returns the ack count (or the call's error) plus the receive half so the
/// caller can reunite the socket.
async fn drain_acks(
    mut rx: WsStream,
    call_id: Value,
) -> (Result<u64, ClientError>, WsStream) {
    let mut acks: u64 = 0;
    loop {
        let msg = match rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return (Err(ClientError::Transport(e.to_string())), rx),
            None => {
                return (
                    Err(ClientError::Transport("connection closed".to_string())),
                    rx,
                )
            }
        };
        let text = match msg {
            Message::Text(_) | Message::Binary(_) => match codec::decode(msg) {
                Ok((text, _)) => text,
                Err(e) => {
                    return (
                        Err(ClientError::Protocol(format!("undecodable frame: {e}"))),
                        rx,
                    )
                }
            },
            Message::Close(_) => {
                return (
                    Err(ClientError::Transport("connection closed".to_string())),
                    rx,
                )
            }
            _ => continue,
        };
        match parse_event(&text, &call_id) {
            Ok(Some(CallEvent::Item(_))) => acks += 1,
            Ok(Some(CallEvent::Final(Ok(_)))) => return (Ok(acks), rx),
            Ok(Some(CallEvent::Final(Err(e)))) => return (Err(e), rx),
            Ok(None) => {}
            Err(e) => return (Err(e), rx),
        }
    }
}

/// Read the auth token from the daemon's data directory.
///
/// Returns an error if the file does not exist (daemon not yet started).
pub fn read_auth_token(data_dir: &std::path::Path) -> anyhow::Result<String> {
    use anyhow::Context as _;
    let token_path = data_dir.join("auth_token");
    let token = std::fs::read_to_string(&token_path).with_context(|| {
        format!(
            "could not read auth token from {path}\n  Is the daemon running? Start it with: taskd serve",
            path = token_path.display()
        )
    })?;
    Ok(token.trim().to_owned())
}
