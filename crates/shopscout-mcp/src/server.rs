//! Single-session JSON-RPC-over-SSE transport.
//!
//! `GET /mcp` opens the SSE stream: first an `endpoint` event carrying the
//! POST path for this session, then JSON-RPC response frames, with a
//! keepalive comment every 5 s. `POST /messages` accepts JSON-RPC requests
//! whose results come back over the stream. At most one session exists at a
//! time; a new `GET /mcp` replaces the old session, and teardown is
//! idempotent no matter which side closes first.

use crate::tools::{ToolRegistry, Toolbox};
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use shopscout_core::Error;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);
const RECONNECT_GRACE: Duration = Duration::from_secs(5);
const RECONNECT_POLL: Duration = Duration::from_millis(500);

struct ActiveSession {
    id: String,
    tx: mpsc::UnboundedSender<Event>,
}

pub struct ServerState {
    pub toolbox: Arc<Toolbox>,
    pub registry: Arc<ToolRegistry>,
    session: Mutex<Option<ActiveSession>>,
}

impl ServerState {
    pub fn new(toolbox: Arc<Toolbox>, registry: Arc<ToolRegistry>) -> Arc<Self> {
        Arc::new(Self {
            toolbox,
            registry,
            session: Mutex::new(None),
        })
    }

    fn session_lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active(&self) -> Option<(String, mpsc::UnboundedSender<Event>)> {
        self.session_lock()
            .as_ref()
            .map(|s| (s.id.clone(), s.tx.clone()))
    }

    /// Drop the active session unconditionally. Returns whether one existed.
    pub fn teardown_session(&self) -> bool {
        self.session_lock().take().is_some()
    }

    /// Drop the active session only if it still is `id`. Safe to call from
    /// every close path; later calls are no-ops.
    fn clear_session_if(&self, id: &str) {
        let mut guard = self.session_lock();
        if guard.as_ref().is_some_and(|s| s.id == id) {
            *guard = None;
            tracing::info!(session_id = id, "session closed");
        }
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/mcp", get(open_sse).delete(delete_session).options(preflight))
        .route("/messages", post(post_message).options(preflight))
        .route("/health", get(health).options(preflight))
        .layer(axum::middleware::map_response(add_cors_headers))
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, state: Arc<ServerState>) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "shopscout MCP server listening");
    axum::serve(listener, router(state)).await
}

async fn add_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,OPTIONS,DELETE"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type,Authorization"),
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Ends the SSE stream's session on drop, whichever side closed it.
struct SessionGuard {
    state: Arc<ServerState>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.clear_session_if(&self.id);
    }
}

async fn open_sse(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl futures_util::Stream<Item = std::result::Result<Event, Infallible>>> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    // The endpoint handshake must be the first event on the stream.
    let _ = tx.send(
        Event::default()
            .event("endpoint")
            .data(format!("/messages?sessionId={session_id}")),
    );

    {
        let mut guard = state.session_lock();
        if let Some(old) = guard.replace(ActiveSession {
            id: session_id.clone(),
            tx,
        }) {
            // Dropping the old sender ends the old stream on its next poll.
            tracing::info!(old = %old.id, new = %session_id, "replacing active session");
        } else {
            tracing::info!(session_id = %session_id, "session opened");
        }
    }

    let guard = SessionGuard {
        state: state.clone(),
        id: session_id,
    };
    let stream = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, Infallible>(event), (rx, guard)))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_PERIOD)
            .text("keepalive"),
    )
}

async fn delete_session(State(state): State<Arc<ServerState>>) -> StatusCode {
    if state.teardown_session() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let active = state.active();
    let alive = active.as_ref().is_some_and(|(_, tx)| !tx.is_closed());
    Json(json!({
        "ok": true,
        "activeSessionId": active.as_ref().map(|(id, _)| id.clone()),
        "hasActiveTransport": active.is_some(),
        "sseConnectionAlive": alive,
    }))
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<BTreeMap<String, String>>,
    Json(request): Json<Value>,
) -> Response {
    // A POST may race an SSE reconnect; give the client a short grace
    // window instead of failing immediately.
    let mut active = state.active();
    if active.is_none() {
        let deadline = tokio::time::Instant::now() + RECONNECT_GRACE;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(RECONNECT_POLL).await;
            active = state.active();
            if active.is_some() {
                break;
            }
        }
    }
    let Some((session_id, tx)) = active else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": Error::NoActiveSession.to_string() })),
        )
            .into_response();
    };

    // Availability over identity: a stale sessionId is logged and the
    // message is routed to the live session anyway.
    if let Some(claimed) = params.get("sessionId") {
        if *claimed != session_id {
            tracing::warn!(claimed = %claimed, active = %session_id, "sessionId mismatch; routing to active session");
        }
    }

    let state = state.clone();
    tokio::spawn(async move {
        if let Some(frame) = handle_rpc(&state, request).await {
            let data = frame.to_string();
            if tx.send(Event::default().data(data)).is_err() {
                tracing::debug!("response dropped: session closed mid-call");
            }
        }
    });
    StatusCode::ACCEPTED.into_response()
}

fn rpc_error_code(err: &Error) -> i64 {
    match err {
        Error::BadInput(_) => -32602,
        Error::UnknownTool(_) => -32601,
        _ => -32000,
    }
}

/// Execute one JSON-RPC request. Returns the response frame, or `None` for
/// id-less notifications. Handler failures become `error` members; the
/// stream itself is never torn down by a handler error.
async fn handle_rpc(state: &Arc<ServerState>, request: Value) -> Option<Value> {
    let id = request.get("id").cloned()?;
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let result = match method {
        "tools/list" => Ok(json!({ "tools": state.registry.list() })),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or_else(|| json!({}));
            let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let args = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            state
                .registry
                .call(state.toolbox.clone(), name, args)
                .await
        }
        other => Err(Error::Generic(format!("method not found: {other}"))),
    };

    Some(match result {
        Ok(value) => json!({ "jsonrpc": "2.0", "id": id, "result": value }),
        Err(err) => {
            let code = if method != "tools/list" && method != "tools/call" {
                -32601
            } else {
                rpc_error_code(&err)
            };
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": err.to_string() }
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::default_registry;

    fn test_state() -> Arc<ServerState> {
        ServerState::new(Toolbox::new(), Arc::new(default_registry()))
    }

    #[tokio::test]
    async fn rpc_unknown_method_yields_error_frame() {
        let state = test_state();
        let frame = handle_rpc(
            &state,
            json!({ "jsonrpc": "2.0", "id": 7, "method": "bogus/method" }),
        )
        .await
        .unwrap();
        assert_eq!(frame["id"], json!(7));
        assert_eq!(frame["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn rpc_notifications_without_id_are_ignored() {
        let state = test_state();
        let frame = handle_rpc(
            &state,
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        )
        .await;
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn rpc_tools_list_and_call_round_trip() {
        let state = test_state();
        let frame = handle_rpc(
            &state,
            json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
        )
        .await
        .unwrap();
        assert!(frame["result"]["tools"].as_array().unwrap().len() >= 17);

        let frame = handle_rpc(
            &state,
            json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": { "name": "list_cart", "arguments": {} }
            }),
        )
        .await
        .unwrap();
        assert!(frame["result"]["content"][0]["text"].is_string());

        let frame = handle_rpc(
            &state,
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": { "name": "missing_tool", "arguments": {} }
            }),
        )
        .await
        .unwrap();
        assert_eq!(frame["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn empty_registry_lists_nothing_and_rejects_calls() {
        let state = ServerState::new(Toolbox::new(), Arc::new(ToolRegistry::new()));
        let frame = handle_rpc(
            &state,
            json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
        )
        .await
        .unwrap();
        assert_eq!(frame["result"]["tools"], json!([]));

        let frame = handle_rpc(
            &state,
            json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": { "name": "web_search", "arguments": { "query": "x" } }
            }),
        )
        .await
        .unwrap();
        assert!(frame["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown tool"));
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let state = test_state();
        assert!(!state.teardown_session());
        let (tx, _rx) = mpsc::unbounded_channel();
        *state.session_lock() = Some(ActiveSession {
            id: "s1".into(),
            tx,
        });
        assert!(state.teardown_session());
        assert!(!state.teardown_session());
        // clear_session_if for a stale id is a no-op.
        state.clear_session_if("s1");
    }
}
