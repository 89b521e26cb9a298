pub mod auth;
pub mod codec;
pub mod interceptor;
pub mod wire;

use crate::service::{
    AddTaskRequest, DeleteTaskRequest, ListTasksRequest, ServiceError, TodoService,
    UpdateTaskRequest,
};
use crate::store::TaskStore;
use crate::AppContext;
use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use self::interceptor::{authenticate, CallLog};
use self::wire::{
    error_response, result_response, stream_item, Frame, RpcRequest, StreamPayload,
    INTERNAL_ERROR, INVALID_ARGUMENT, INVALID_REQUEST, METHOD_NOT_FOUND, NOT_FOUND, PARSE_ERROR,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "RPC server listening (WebSocket + HTTP health on same port)");

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    // Pinned so we can use it in the select! loop without moving.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping RPC server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("RPC server stopped");
    Ok(())
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
///
/// The daemon shares one port for both WebSocket (JSON-RPC) and a plain
/// HTTP health endpoint so clients can check liveness without a WS library.
/// No auth token required.
async fn handle_health_check(mut stream: TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request (we don't inspect it — any GET /health is fine).
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let tasks = ctx.store.len().await;
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_secs,
        "tasks": tasks,
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

// ─── Connection handling ─────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Peek at the first bytes to distinguish HTTP health checks from WebSocket
    // upgrades. Both share the same port; "GET /health" is answered directly,
    // every other GET falls through to the WS handshake.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_check(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    let service = TodoService::new(ctx.store.clone(), ctx.config.on_missing);

    // Calls on one connection run sequentially; a client-streaming call owns
    // the receive side until it completes.
    loop {
        match stream.next().await {
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                let (text, compressed) = match codec::decode(msg) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        debug!(err = %e, "undecodable frame");
                        let resp = error_response(&Value::Null, PARSE_ERROR, "Parse error");
                        sink.send(codec::encode(resp, false)?).await?;
                        continue;
                    }
                };

                match Frame::decode(&text) {
                    Ok(Frame::Request(req)) => {
                        handle_call(req, compressed, &mut sink, &mut stream, &service, &ctx)
                            .await?;
                    }
                    Ok(Frame::Stream { id, .. }) => {
                        // No call is active — a leftover frame from an aborted
                        // stream. Discard.
                        debug!(call_id = %id, "stray stream frame — discarded");
                    }
                    Err(_) => {
                        let resp = error_response(&Value::Null, PARSE_ERROR, "Parse error");
                        sink.send(codec::encode(resp, compressed)?).await?;
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = sink.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(err = %e, "ws error");
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Drive one call from its open frame to its final response.
///
/// Interceptor order is fixed: authenticate, then call logging, then the
/// handler body — for unary and streaming shapes alike. Every frame sent for
/// this call mirrors the open frame's compression.
async fn handle_call(
    req: RpcRequest,
    compressed: bool,
    sink: &mut WsSink,
    stream: &mut WsStream,
    service: &TodoService,
    ctx: &AppContext,
) -> Result<()> {
    let id = req.id.clone().unwrap_or(Value::Null);

    if req.jsonrpc != "2.0" {
        let resp = error_response(&id, INVALID_REQUEST, "Invalid Request");
        return sink.send(codec::encode(resp, compressed)?).await.map_err(Into::into);
    }

    // Auth gate — before logging, before any stream consumption.
    if let Err(e) = authenticate(req.meta.as_ref(), &ctx.auth_token) {
        let resp = error_response(&id, e.code, &e.message);
        return sink.send(codec::encode(resp, compressed)?).await.map_err(Into::into);
    }

    let log = CallLog::start(&req.method, &id);
    let params = req.params.unwrap_or(Value::Null);

    let outcome = match req.method.as_str() {
        "task.add" => unary_add(&id, params, compressed, sink, service).await,
        "task.list" => stream_list(&id, params, compressed, sink, service, &log).await,
        "task.update" => stream_update(&id, compressed, sink, stream, service, &log).await,
        "task.delete" => stream_delete(&id, compressed, sink, stream, service, &log).await,
        _ => {
            let resp = error_response(&id, METHOD_NOT_FOUND, "Method not found");
            sink.send(codec::encode(resp, compressed)?).await?;
            Ok(Some(METHOD_NOT_FOUND))
        }
    };

    match outcome {
        Ok(code) => {
            log.finish(code);
            Ok(())
        }
        Err(e) => {
            // Transport failure — the connection is gone; the caller tears
            // the connection loop down.
            log.aborted();
            Err(e)
        }
    }
}

/// `task.add` — unary. Validation failures reject before any mutation.
async fn unary_add(
    id: &Value,
    params: Value,
    compressed: bool,
    sink: &mut WsSink,
    service: &TodoService,
) -> Result<Option<i32>> {
    let req: AddTaskRequest = match serde_json::from_value(params) {
        Ok(r) => r,
        Err(e) => {
            return send_error(sink, id, compressed, INVALID_ARGUMENT, &format!("Invalid params: {e}"))
                .await;
        }
    };

    match service.add_task(req).await {
        Ok(resp) => {
            let text = result_response(id, serde_json::to_value(resp)?);
            sink.send(codec::encode(text, compressed)?).await?;
            Ok(None)
        }
        Err(e) => send_service_error(sink, id, compressed, e).await,
    }
}

/// `task.list` — server-streaming. One frame per stored task in insertion
/// order, rendered lazily (overdue from the unfiltered task, then the mask),
/// followed by an empty final result.
async fn stream_list(
    id: &Value,
    params: Value,
    compressed: bool,
    sink: &mut WsSink,
    service: &TodoService,
    log: &CallLog,
) -> Result<Option<i32>> {
    let req: ListTasksRequest = if params.is_null() {
        ListTasksRequest::default()
    } else {
        match serde_json::from_value(params) {
            Ok(r) => r,
            Err(e) => {
                return send_error(
                    sink,
                    id,
                    compressed,
                    INVALID_ARGUMENT,
                    &format!("Invalid params: {e}"),
                )
                .await;
            }
        }
    };

    let tasks = match service.list_snapshot().await {
        Ok(t) => t,
        Err(e) => return send_service_error(sink, id, compressed, e).await,
    };

    for task in &tasks {
        let row = match service.render_row(task, &req.mask) {
            Ok(r) => r,
            Err(e) => return send_service_error(sink, id, compressed, e).await,
        };
        let frame = stream_item(id, serde_json::to_value(row)?);
        // A failed send aborts enumeration; already-sent rows stand.
        sink.send(codec::encode(frame, compressed)?).await?;
        log.item_sent();
    }

    let text = result_response(id, serde_json::json!({}));
    sink.send(codec::encode(text, compressed)?).await?;
    Ok(None)
}

/// `task.update` — client-streaming. Applies each element synchronously in
/// arrival order; a clean half-close yields one empty ack.
async fn stream_update(
    id: &Value,
    compressed: bool,
    sink: &mut WsSink,
    stream: &mut WsStream,
    service: &TodoService,
    log: &CallLog,
) -> Result<Option<i32>> {
    loop {
        match recv_stream_frame(stream, id).await? {
            StreamEvent::Item(item) => {
                log.item_received();
                let update: UpdateTaskRequest = match serde_json::from_value(item) {
                    Ok(u) => u,
                    Err(e) => {
                        return send_error(
                            sink,
                            id,
                            compressed,
                            INVALID_ARGUMENT,
                            &format!("Invalid stream item: {e}"),
                        )
                        .await;
                    }
                };
                if let Err(e) = service.apply_update(update).await {
                    return send_service_error(sink, id, compressed, e).await;
                }
            }
            StreamEvent::End => {
                log.half_closed();
                let text = result_response(id, serde_json::json!({}));
                sink.send(codec::encode(text, compressed)?).await?;
                return Ok(None);
            }
            StreamEvent::Protocol(code, msg) => {
                return send_error(sink, id, compressed, code, &msg).await;
            }
            StreamEvent::Gone => anyhow::bail!("transport closed mid-stream"),
        }
    }
}

/// `task.delete` — bidirectional. One ack frame per request consumed, in
/// receive order; the final result closes the ack stream after half-close.
async fn stream_delete(
    id: &Value,
    compressed: bool,
    sink: &mut WsSink,
    stream: &mut WsStream,
    service: &TodoService,
    log: &CallLog,
) -> Result<Option<i32>> {
    loop {
        match recv_stream_frame(stream, id).await? {
            StreamEvent::Item(item) => {
                log.item_received();
                let del: DeleteTaskRequest = match serde_json::from_value(item) {
                    Ok(d) => d,
                    Err(e) => {
                        return send_error(
                            sink,
                            id,
                            compressed,
                            INVALID_ARGUMENT,
                            &format!("Invalid stream item: {e}"),
                        )
                        .await;
                    }
                };
                if let Err(e) = service.apply_delete(del).await {
                    return send_service_error(sink, id, compressed, e).await;
                }
                let ack = stream_item(id, serde_json::json!({}));
                sink.send(codec::encode(ack, compressed)?).await?;
                log.item_sent();
            }
            StreamEvent::End => {
                log.half_closed();
                let text = result_response(id, serde_json::json!({}));
                sink.send(codec::encode(text, compressed)?).await?;
                return Ok(None);
            }
            StreamEvent::Protocol(code, msg) => {
                return send_error(sink, id, compressed, code, &msg).await;
            }
            StreamEvent::Gone => anyhow::bail!("transport closed mid-stream"),
        }
    }
}

enum StreamEvent {
    Item(Value),
    End,
    /// A frame that violates the protocol while this call's stream is active.
    Protocol(i32, String),
    /// Transport closed before half-close.
    Gone,
}

/// Receive the next frame of an active client stream.
///
/// While a client-streaming call is open, the only legal frames are stream
/// frames carrying the active call's id. Pings are answered out-of-band by
/// the connection loop being suspended here, so we handle them inline.
async fn recv_stream_frame(stream: &mut WsStream, active_id: &Value) -> Result<StreamEvent> {
    loop {
        match stream.next().await {
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                let (text, _) = match codec::decode(msg) {
                    Ok(d) => d,
                    Err(_) => {
                        return Ok(StreamEvent::Protocol(
                            PARSE_ERROR,
                            "Parse error in stream frame".to_string(),
                        ));
                    }
                };
                match Frame::decode(&text) {
                    Ok(Frame::Stream { id, payload }) if &id == active_id => match payload {
                        StreamPayload { end: true, .. } => return Ok(StreamEvent::End),
                        StreamPayload { item: Some(item), .. } => {
                            return Ok(StreamEvent::Item(item))
                        }
                        _ => {
                            return Ok(StreamEvent::Protocol(
                                INVALID_REQUEST,
                                "stream frame carries neither item nor end".to_string(),
                            ));
                        }
                    },
                    Ok(Frame::Stream { id, .. }) => {
                        // Wrong call id mid-stream — fail the active call.
                        return Ok(StreamEvent::Protocol(
                            INVALID_REQUEST,
                            format!("stream frame for inactive call {id}"),
                        ));
                    }
                    Ok(Frame::Request(_)) => {
                        return Ok(StreamEvent::Protocol(
                            INVALID_REQUEST,
                            "new call opened while a client stream is active".to_string(),
                        ));
                    }
                    Err(_) => {
                        return Ok(StreamEvent::Protocol(
                            PARSE_ERROR,
                            "Parse error in stream frame".to_string(),
                        ));
                    }
                }
            }
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Ok(StreamEvent::Gone),
            Some(Err(e)) => {
                warn!(err = %e, "ws receive error mid-stream");
                return Ok(StreamEvent::Gone);
            }
            _ => continue,
        }
    }
}

async fn send_error(
    sink: &mut WsSink,
    id: &Value,
    compressed: bool,
    code: i32,
    message: &str,
) -> Result<Option<i32>> {
    let resp = error_response(id, code, message);
    sink.send(codec::encode(resp, compressed)?).await?;
    Ok(Some(code))
}

async fn send_service_error(
    sink: &mut WsSink,
    id: &Value,
    compressed: bool,
    e: ServiceError,
) -> Result<Option<i32>> {
    let (code, message) = classify_service_error(&e);
    send_error(sink, id, compressed, code, &message).await
}

fn classify_service_error(e: &ServiceError) -> (i32, String) {
    match e {
        ServiceError::InvalidArgument(msg) => (INVALID_ARGUMENT, format!("Invalid argument: {msg}")),
        ServiceError::NotFound(id) => (NOT_FOUND, format!("Task {id} not found")),
        ServiceError::Internal(msg) => {
            error!(err = %msg, "internal error");
            (INTERNAL_ERROR, "Internal error".to_string())
        }
    }
}
