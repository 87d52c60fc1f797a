//! Unit tests for the websocket json-rpc client.

use super::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;

#[test]
fn request_serialization() {
    let frame = encode(7, "pool.dataset.query", Some(json!([[], {}]))).unwrap();
    let value: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["jsonrpc"], "2.0");
    assert_eq!(value["id"], 7);
    assert_eq!(value["method"], "pool.dataset.query");
    assert!(value["params"].is_array());
}

#[test]
fn request_without_params_omits_field() {
    let frame = encode(1, "core.ping", None).unwrap();
    let value: Value = serde_json::from_str(&frame).unwrap();
    assert!(value.get("params").is_none());
}

#[test]
fn dispatch_routes_result_by_id() {
    let mut pending = HashMap::new();
    let (tx, mut rx) = oneshot::channel();
    pending.insert(3, tx);
    dispatch(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#, &mut pending);
    assert!(pending.is_empty());
    let outcome = rx.try_recv().unwrap().unwrap();
    assert_eq!(outcome["ok"], true);
}

#[test]
fn dispatch_rejects_wrong_version() {
    let mut pending = HashMap::new();
    let (tx, _rx) = oneshot::channel();
    pending.insert(3, tx);
    dispatch(r#"{"jsonrpc":"1.0","id":3,"result":null}"#, &mut pending);
    // reply must stay outstanding, the frame is discarded
    assert_eq!(pending.len(), 1);
}

#[test]
fn dispatch_ignores_event_frames() {
    let mut pending = HashMap::new();
    let (tx, _rx) = oneshot::channel();
    pending.insert(3, tx);
    dispatch(
        r#"{"jsonrpc":"2.0","method":"collection_update","params":{}}"#,
        &mut pending,
    );
    assert_eq!(pending.len(), 1);
}

#[test]
fn dispatch_surfaces_rpc_error() {
    let mut pending = HashMap::new();
    let (tx, mut rx) = oneshot::channel();
    pending.insert(9, tx);
    dispatch(
        r#"{"jsonrpc":"2.0","id":9,"error":{"code":-32001,"message":"boom","data":{"errname":"ENOENT"}}}"#,
        &mut pending,
    );
    match rx.try_recv().unwrap() {
        Err(Error::Rpc { code, message, data }) => {
            assert_eq!(code, -32001);
            assert_eq!(message, "boom");
            assert_eq!(data.unwrap()["errname"], "ENOENT");
        }
        other => panic!("expected rpc error, got {:?}", other),
    }
}

#[test]
fn backoff_is_bounded() {
    assert!(backoff_delay(0) >= Duration::from_secs(1));
    assert!(backoff_delay(0) < Duration::from_millis(1250));
    assert!(backoff_delay(1) >= Duration::from_secs(2));
    assert!(backoff_delay(20) <= RECONNECT_CAP + Duration::from_millis(250));
}

/// Minimal appliance stand-in: accepts one websocket connection, answers the
/// login, echoes `test.echo`, holds `test.hold` calls until two arrived and
/// then replies in reverse order, and fails `test.fail`.
async fn serve_one_session(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let mut held: Vec<(u64, Value)> = Vec::new();

    while let Some(Ok(message)) = ws.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Ping(payload) => {
                ws.send(Message::Pong(payload)).await.unwrap();
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };
        let request: Value = serde_json::from_str(&text).unwrap();
        let id = request["id"].as_u64().unwrap();
        match request["method"].as_str().unwrap() {
            "auth.login_with_api_key" => {
                let reply = json!({"jsonrpc": "2.0", "id": id, "result": true});
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
            "test.echo" => {
                let reply =
                    json!({"jsonrpc": "2.0", "id": id, "result": request["params"].clone()});
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
            "test.hold" => {
                held.push((id, request["params"].clone()));
                if held.len() == 2 {
                    for (id, params) in held.drain(..).rev() {
                        let reply = json!({"jsonrpc": "2.0", "id": id, "result": params});
                        ws.send(Message::Text(reply.to_string())).await.unwrap();
                    }
                }
            }
            "test.fail" => {
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32001, "message": "does not exist",
                              "data": {"errname": "ENOENT"}},
                });
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
            method => panic!("unexpected method {}", method),
        }
    }
}

async fn test_client() -> (RpcClient, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_one_session(listener));

    let config = RpcClientConfig {
        url: Url::parse(&format!("ws://{addr}/websocket")).unwrap(),
        api_key: "unit-test-key".into(),
        accept_invalid_certs: false,
    };
    let client = RpcClient::connect(config).await.unwrap();
    (client, server)
}

#[tokio::test]
async fn call_round_trip() {
    let (client, _server) = test_client().await;
    assert!(client.healthy());

    let result = client
        .call("test.echo", Some(json!(["hello"])))
        .await
        .unwrap();
    assert_eq!(result, json!(["hello"]));
}

#[tokio::test]
async fn replies_are_correlated_not_ordered() {
    let (client, _server) = test_client().await;

    let first = client.call("test.hold", Some(json!("first")));
    let second = client.call("test.hold", Some(json!("second")));
    let (first, second) = tokio::join!(first, second);

    // the server replied in reverse order; correlation must still hold
    assert_eq!(first.unwrap(), json!("first"));
    assert_eq!(second.unwrap(), json!("second"));
}

#[tokio::test]
async fn rpc_errors_keep_their_payload() {
    let (client, _server) = test_client().await;

    match client.call("test.fail", None).await {
        Err(Error::Rpc { code, data, .. }) => {
            assert_eq!(code, -32001);
            assert_eq!(data.unwrap()["errname"], "ENOENT");
        }
        other => panic!("expected rpc error, got {:?}", other),
    }
}
