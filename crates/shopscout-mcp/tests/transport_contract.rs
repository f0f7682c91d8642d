//! Contract tests for the SSE transport: handshake, tool calls over the
//! wire, session replacement, health reporting and teardown. Everything
//! runs against a loopback listener; no external network.

use serde_json::{json, Value};
use shopscout_mcp::rpc::RpcClient;
use shopscout_mcp::server::{self, ServerState};
use shopscout_mcp::tools::{default_registry, Toolbox};
use std::sync::Arc;

async fn spawn_server() -> (String, Arc<ServerState>) {
    let state = ServerState::new(Toolbox::new(), Arc::new(default_registry()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let served = state.clone();
    tokio::spawn(async move {
        let _ = server::serve(listener, served).await;
    });
    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn endpoint_handshake_then_tools_list() {
    let (base, _state) = spawn_server().await;
    let client = RpcClient::connect(&base).await.expect("connect");
    assert!(!client.session_id().is_empty());

    let listed = client.list_tools().await.expect("tools/list");
    let names: Vec<&str> = listed["tools"]
        .as_array()
        .expect("tools array")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    for must_have in ["web_search", "extract_product", "add_to_cart", "browser_close"] {
        assert!(names.contains(&must_have), "missing tool {must_have}");
    }
}

#[tokio::test]
async fn cart_round_trip_over_the_wire() {
    let (base, _state) = spawn_server().await;
    let client = RpcClient::connect(&base).await.expect("connect");

    let args = json!({
        "name": "Atlas K3",
        "url": "https://example.com/p/atlas-k3",
        "price": 89.0,
        "currency": "USD",
        "source": "example.com"
    });
    let result = client.call_tool("add_to_cart", args.clone()).await.expect("add");
    let payload: Value =
        serde_json::from_str(result["content"][0]["text"].as_str().expect("text")).unwrap();
    assert_eq!(payload["ok"], json!(true));
    assert_eq!(payload["cart"].as_array().unwrap().len(), 1);
    let id = payload["cart"][0]["id"].as_str().unwrap().to_string();

    // Dedup by URL: second add fails softly, cart unchanged.
    let result = client.call_tool("add_to_cart", args).await.expect("re-add");
    let payload: Value =
        serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["ok"], json!(false));
    assert_eq!(payload["cart"].as_array().unwrap().len(), 1);

    let result = client
        .call_tool("remove_from_cart", json!({ "id": id }))
        .await
        .expect("remove");
    let payload: Value =
        serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["ok"], json!(true));
    assert!(payload["cart"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn tool_errors_come_back_as_rpc_error_frames() {
    let (base, _state) = spawn_server().await;
    let client = RpcClient::connect(&base).await.expect("connect");

    let err = client.call_tool("no_such_tool", json!({})).await;
    match err {
        Err(e) => assert!(e.to_string().contains("no_such_tool")),
        Ok(v) => panic!("expected error, got {v}"),
    }

    // Missing required fields surface the missing keys.
    let err = client.call_tool("extract_product", json!({})).await;
    match err {
        Err(e) => {
            let msg = e.to_string();
            assert!(msg.contains("url"), "message was: {msg}");
        }
        Ok(v) => panic!("expected error, got {v}"),
    }

    // The stream survives handler errors: the next call still works.
    client.list_tools().await.expect("stream still alive");
}

#[tokio::test]
async fn unknown_method_is_rejected_but_session_survives() {
    let (base, _state) = spawn_server().await;
    let client = RpcClient::connect(&base).await.expect("connect");
    let err = client.call("bogus/method", json!({})).await;
    assert!(err.is_err());
    client.list_tools().await.expect("session survives");
}

#[tokio::test]
async fn second_sse_connection_replaces_the_first() {
    let (base, _state) = spawn_server().await;
    let first = RpcClient::connect(&base).await.expect("first connect");
    let second = RpcClient::connect(&base).await.expect("second connect");
    assert_ne!(first.session_id(), second.session_id());

    // Health reports the new session.
    let health: Value = reqwest::get(format!("{base}/health"))
        .await
        .expect("health")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["ok"], json!(true));
    assert_eq!(
        health["activeSessionId"].as_str(),
        Some(second.session_id())
    );
    assert_eq!(health["hasActiveTransport"], json!(true));
    assert_eq!(health["sseConnectionAlive"], json!(true));

    // The replacement session carries calls.
    second.list_tools().await.expect("second session works");
}

#[tokio::test]
async fn delete_tears_down_and_404s_when_idle() {
    let (base, _state) = spawn_server().await;
    let http = reqwest::Client::new();

    // No session yet: 404.
    let resp = http.delete(format!("{base}/mcp")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let _client = RpcClient::connect(&base).await.expect("connect");
    let resp = http.delete(format!("{base}/mcp")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    let health: Value = http
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["hasActiveTransport"], json!(false));
    assert!(health["activeSessionId"].is_null());
}

#[tokio::test]
async fn post_without_session_fails_after_grace_window() {
    let (base, _state) = spawn_server().await;
    let http = reqwest::Client::new();
    let started = std::time::Instant::now();
    let resp = http
        .post(format!("{base}/messages?sessionId=stale"))
        .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status().as_u16(), 503);
    let body: Value = resp.json().await.expect("error body");
    assert!(body["error"].as_str().unwrap().contains("no active session"));
    // The 5 s reconnect grace must actually elapse.
    assert!(started.elapsed() >= std::time::Duration::from_secs(4));
}

#[tokio::test]
async fn mismatched_session_id_is_routed_to_the_active_session() {
    let (base, _state) = spawn_server().await;
    let client = RpcClient::connect(&base).await.expect("connect");

    // Post with a wrong sessionId; the result must still arrive on the
    // active stream, keyed by request id.
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{base}/messages?sessionId=not-the-active-one"))
        .json(&json!({ "jsonrpc": "2.0", "id": 4242, "method": "tools/list" }))
        .send()
        .await
        .expect("post");
    assert_eq!(resp.status().as_u16(), 202);

    // Our client ignores the unmatched 4242 frame as a notification; a
    // normal call still works, proving the stream carried both frames.
    client.list_tools().await.expect("stream healthy");
}

#[tokio::test]
async fn cors_headers_and_preflight() {
    let (base, _state) = spawn_server().await;
    let http = reqwest::Client::new();

    let resp = http
        .request(reqwest::Method::OPTIONS, format!("{base}/messages"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );

    let resp = http.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(
        resp.headers()
            .get("access-control-allow-methods")
            .and_then(|v| v.to_str().ok()),
        Some("GET,POST,OPTIONS,DELETE")
    );
}
