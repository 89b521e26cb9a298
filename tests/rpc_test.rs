//! End-to-end tests for the four task RPCs over the real wire: real server,
//! real client, random port per test.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use taskd::client::{ClientError, ClientOptions, TaskClient};
use taskd::config::{OnMissing, TaskdConfig};
use taskd::mask::FieldMask;
use taskd::service::UpdateTaskRequest;
use taskd::store::MemStore;
use taskd::AppContext;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TEST_TOKEN: &str = "test-token";

/// Find a free local port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a real server on a random port; returns the port and the data dir
/// guard (the dir must outlive the server).
async fn start_server(on_missing: OnMissing) -> (u16, TempDir) {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let config = Arc::new(TaskdConfig::new(
        Some(port),
        Some(dir.path().to_path_buf()),
        Some("error".to_string()),
        None,
        Some(on_missing),
    ));
    let ctx = Arc::new(AppContext {
        config,
        store: Arc::new(MemStore::new()),
        started_at: std::time::Instant::now(),
        auth_token: TEST_TOKEN.to_string(),
    });
    tokio::spawn(async move {
        let _ = taskd::rpc::run(ctx).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    (port, dir)
}

async fn connect(port: u16) -> TaskClient {
    let opts = ClientOptions {
        token: TEST_TOKEN.to_string(),
        ..ClientOptions::default()
    };
    TaskClient::connect(&format!("127.0.0.1:{port}"), opts)
        .await
        .unwrap()
}

#[tokio::test]
async fn full_scenario_add_list_update_delete() {
    let (port, _dir) = start_server(OnMissing::Skip).await;
    let mut client = connect(port).await;
    let cancel = CancellationToken::new();

    let tomorrow = Utc::now() + ChronoDuration::days(1);
    let yesterday = Utc::now() - ChronoDuration::days(1);

    assert_eq!(client.add_task("buy milk", Some(tomorrow)).await.unwrap(), 1);
    assert_eq!(client.add_task("pay bills", Some(yesterday)).await.unwrap(), 2);

    // Two rows in insertion order; only the past-due one is overdue.
    let rows = client
        .list_tasks(&FieldMask::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].task.id, 1);
    assert!(!rows[0].overdue);
    assert_eq!(rows[1].task.id, 2);
    assert_eq!(rows[1].task.description, "pay bills");
    assert!(rows[1].overdue);

    // Marking it done flips overdue false for the same due date.
    client
        .update_tasks(
            vec![UpdateTaskRequest {
                id: 2,
                description: "pay bills".to_string(),
                due_date: Some(yesterday),
                done: true,
            }],
            &cancel,
        )
        .await
        .unwrap();

    let rows = client
        .list_tasks(&FieldMask::default(), &cancel)
        .await
        .unwrap();
    assert!(!rows[1].overdue);
    assert!(rows[1].task.done);

    // Delete task 1; only task 2 remains.
    let acks = client.delete_tasks(vec![1], &cancel).await.unwrap();
    assert_eq!(acks, 1);

    let rows = client
        .list_tasks(&FieldMask::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task.id, 2);
}

#[tokio::test]
async fn ids_keep_increasing_after_deletion() {
    let (port, _dir) = start_server(OnMissing::Skip).await;
    let mut client = connect(port).await;
    let cancel = CancellationToken::new();

    assert_eq!(client.add_task("a", None).await.unwrap(), 1);
    assert_eq!(client.add_task("b", None).await.unwrap(), 2);
    client.delete_tasks(vec![2], &cancel).await.unwrap();
    // A len+1 scheme would hand out 2 again and collide later; the counter
    // must keep going.
    assert_eq!(client.add_task("c", None).await.unwrap(), 3);
}

#[tokio::test]
async fn field_mask_filters_response_rows() {
    let (port, _dir) = start_server(OnMissing::Skip).await;
    let mut client = connect(port).await;
    let cancel = CancellationToken::new();

    let yesterday = Utc::now() - ChronoDuration::days(1);
    client.add_task("secret errand", Some(yesterday)).await.unwrap();

    let mask = FieldMask::new(["description"]);
    let rows = client.list_tasks(&mask, &cancel).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task.description, "secret errand");
    assert_eq!(rows[0].task.id, 0, "id filtered out");
    assert_eq!(rows[0].task.due_date, None, "due_date filtered out");
    assert!(!rows[0].task.done);
    // overdue is computed before filtering, so it survives the mask.
    assert!(rows[0].overdue);
}

#[tokio::test]
async fn add_task_rejects_empty_description() {
    let (port, _dir) = start_server(OnMissing::Skip).await;
    let mut client = connect(port).await;
    let cancel = CancellationToken::new();

    let err = client.add_task("   ", None).await.unwrap_err();
    match err {
        ClientError::Rpc { code, .. } => assert_eq!(code, taskd::rpc::wire::INVALID_ARGUMENT),
        other => panic!("expected rpc error, got {other}"),
    }

    // Rejected before any mutation.
    let rows = client
        .list_tasks(&FieldMask::default(), &cancel)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn update_unknown_id_is_skipped_under_skip_policy() {
    let (port, _dir) = start_server(OnMissing::Skip).await;
    let mut client = connect(port).await;
    let cancel = CancellationToken::new();

    client.add_task("keep me", None).await.unwrap();

    client
        .update_tasks(
            vec![UpdateTaskRequest {
                id: 999,
                description: "ghost".to_string(),
                due_date: None,
                done: true,
            }],
            &cancel,
        )
        .await
        .unwrap();

    let rows = client
        .list_tasks(&FieldMask::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task.description, "keep me");
    assert!(!rows[0].task.done);
}

#[tokio::test]
async fn update_unknown_id_fails_under_error_policy() {
    let (port, _dir) = start_server(OnMissing::Error).await;
    let mut client = connect(port).await;
    let cancel = CancellationToken::new();

    let err = client
        .update_tasks(
            vec![UpdateTaskRequest {
                id: 999,
                description: "ghost".to_string(),
                due_date: None,
                done: false,
            }],
            &cancel,
        )
        .await
        .unwrap_err();
    match err {
        ClientError::Rpc { code, .. } => assert_eq!(code, taskd::rpc::wire::NOT_FOUND),
        other => panic!("expected rpc error, got {other}"),
    }
}

#[tokio::test]
async fn duplicate_delete_in_one_batch_acks_every_request() {
    let (port, _dir) = start_server(OnMissing::Skip).await;
    let mut client = connect(port).await;
    let cancel = CancellationToken::new();

    let id = client.add_task("only once", None).await.unwrap();
    client.add_task("survivor", None).await.unwrap();

    // Second delete of the same id is a no-op but still acked.
    let acks = client.delete_tasks(vec![id, id], &cancel).await.unwrap();
    assert_eq!(acks, 2);

    let rows = client
        .list_tasks(&FieldMask::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task.description, "survivor");
}

#[tokio::test]
async fn batch_update_applies_in_arrival_order() {
    let (port, _dir) = start_server(OnMissing::Skip).await;
    let mut client = connect(port).await;
    let cancel = CancellationToken::new();

    let id = client.add_task("v0", None).await.unwrap();

    // Two updates to the same task in one stream: the later one wins.
    client
        .update_tasks(
            vec![
                UpdateTaskRequest {
                    id,
                    description: "v1".to_string(),
                    due_date: None,
                    done: false,
                },
                UpdateTaskRequest {
                    id,
                    description: "v2".to_string(),
                    due_date: None,
                    done: true,
                },
            ],
            &cancel,
        )
        .await
        .unwrap();

    let rows = client
        .list_tasks(&FieldMask::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(rows[0].task.description, "v2");
    assert!(rows[0].task.done);
}

#[tokio::test]
async fn uncompressed_client_works_too() {
    let (port, _dir) = start_server(OnMissing::Skip).await;
    let opts = ClientOptions {
        token: TEST_TOKEN.to_string(),
        compress: false,
        ..ClientOptions::default()
    };
    let mut client = TaskClient::connect(&format!("127.0.0.1:{port}"), opts)
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let id = client.add_task("plain text frames", None).await.unwrap();
    assert_eq!(id, 1);
    let rows = client
        .list_tasks(&FieldMask::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn server_mirrors_call_frame_compression() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (port, _dir) = start_server(OnMissing::Skip).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let open = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "task.add",
        "params": { "description": "compressed call" },
        "meta": { "authorization": format!("Bearer {TEST_TOKEN}") },
    })
    .to_string();

    // A gzip-compressed (Binary) call must get a gzip-compressed response.
    let msg = taskd::rpc::codec::encode(open, true).unwrap();
    assert!(matches!(msg, Message::Binary(_)));
    ws.send(msg).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    assert!(matches!(reply, Message::Binary(_)), "response not compressed");
    let (text, compressed) = taskd::rpc::codec::decode(reply).unwrap();
    assert!(compressed);
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["result"]["id"], 1);
}

#[tokio::test]
async fn malformed_frame_yields_parse_error() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (port, _dir) = start_server(OnMissing::Skip).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let (text, _) = taskd::rpc::codec::decode(reply).unwrap();
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["error"]["code"], taskd::rpc::wire::PARSE_ERROR);
    assert_eq!(v["id"], serde_json::Value::Null);
}

#[tokio::test]
async fn client_redials_after_transport_failure() {
    use tokio::net::{TcpListener, TcpStream};

    let (backend, _dir) = start_server(OnMissing::Skip).await;

    // Front door: the first connection completes the WebSocket handshake and
    // is dropped immediately; every later connection is proxied byte-for-byte
    // to the real server.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (first, _) = listener.accept().await.unwrap();
        drop(tokio_tungstenite::accept_async(first).await.unwrap());
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(c) => c,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut upstream = TcpStream::connect(("127.0.0.1", backend)).await.unwrap();
                let _ = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await;
            });
        }
    });

    let mut client = connect(port).await;
    let err = client.add_task("first try", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)), "got {err}");

    // The dead socket must not wedge the client: the next call re-dials.
    assert_eq!(client.add_task("second try", None).await.unwrap(), 1);
}

#[tokio::test]
async fn out_of_protocol_frame_fails_active_update_stream() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (port, _dir) = start_server(OnMissing::Skip).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let open = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "task.update",
        "params": {},
        "meta": { "authorization": format!("Bearer {TEST_TOKEN}") },
    })
    .to_string();
    ws.send(Message::Text(open)).await.unwrap();

    // Opening a new call while the update stream is active is illegal; the
    // active call fails, not the connection.
    let rogue = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 8,
        "method": "task.add",
        "params": { "description": "rogue" },
        "meta": { "authorization": format!("Bearer {TEST_TOKEN}") },
    })
    .to_string();
    ws.send(Message::Text(rogue)).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let (text, _) = taskd::rpc::codec::decode(reply).unwrap();
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["id"], 7, "error addressed to the active call");
    assert_eq!(v["error"]["code"], taskd::rpc::wire::INVALID_REQUEST);

    // Same rule for a stream frame carrying another call's id.
    let open = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 9,
        "method": "task.update",
        "params": {},
        "meta": { "authorization": format!("Bearer {TEST_TOKEN}") },
    })
    .to_string();
    ws.send(Message::Text(open)).await.unwrap();
    let stray = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 12,
        "stream": { "item": { "id": 1 } },
    })
    .to_string();
    ws.send(Message::Text(stray)).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let (text, _) = taskd::rpc::codec::decode(reply).unwrap();
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["id"], 9);
    assert_eq!(v["error"]["code"], taskd::rpc::wire::INVALID_REQUEST);
}

#[tokio::test]
async fn cancellation_aborts_call_and_client_recovers() {
    let (port, _dir) = start_server(OnMissing::Skip).await;
    let mut client = connect(port).await;
    let cancel = CancellationToken::new();

    let id = client.add_task("stays put", None).await.unwrap();

    // An already-cancelled token aborts the streaming calls; the delete's
    // background drain task is reaped, and no requests reach the server.
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = client.delete_tasks(vec![id], &cancelled).await.unwrap_err();
    assert!(matches!(err, ClientError::Cancelled), "got {err}");

    let err = client
        .list_tasks(&FieldMask::default(), &cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled), "got {err}");

    // Cancellation tears the connection down; the next call re-dials, and
    // the cancelled delete removed nothing.
    let rows = client
        .list_tasks(&FieldMask::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task.id, id);
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (port, _dir) = start_server(OnMissing::Skip).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let open = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 5,
        "method": "task.nope",
        "params": {},
        "meta": { "authorization": format!("Bearer {TEST_TOKEN}") },
    })
    .to_string();
    ws.send(Message::Text(open)).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let (text, _) = taskd::rpc::codec::decode(reply).unwrap();
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["error"]["code"], taskd::rpc::wire::METHOD_NOT_FOUND);
}
