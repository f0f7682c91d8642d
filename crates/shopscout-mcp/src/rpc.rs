//! JSON-RPC client for the SSE transport.
//!
//! The stream is read as raw bytes: before any JSON-RPC frame processing,
//! the reader scans for the first `data: /messages?sessionId=<id>` line
//! (the endpoint handshake), then keeps parsing `data:` payloads and
//! resolving them against a pending table keyed by stringified request id.

use futures_util::StreamExt;
use serde_json::{json, Value};
use shopscout_core::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>>;

/// Incremental SSE parser: bytes in, completed `data:` payloads out.
/// Comment lines (leading `:`) and event-name lines are skipped; multi-line
/// data within one event is joined with newlines.
#[derive(Default)]
pub struct SseFrameParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseFrameParser {
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    out.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
            // "event:"/"id:"/"retry:" fields carry no payload we need.
        }
        out
    }
}

pub struct RpcClient {
    http: reqwest::Client,
    messages_url: String,
    session_id: String,
    pending: Pending,
    next_id: AtomicI64,
    reader: tokio::task::JoinHandle<()>,
}

impl RpcClient {
    /// Open the SSE stream and wait for the endpoint handshake.
    pub async fn connect(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::new();
        let response = http
            .get(format!("{base_url}/mcp"))
            .send()
            .await
            .map_err(|e| Error::Generic(format!("SSE connection not established: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Http(response.status().as_u16()));
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (handshake_tx, handshake_rx) = oneshot::channel::<String>();

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseFrameParser::default();
            let mut handshake = Some(handshake_tx);
            while let Some(chunk) = stream.next().await {
                let Ok(bytes) = chunk else { break };
                let text = String::from_utf8_lossy(&bytes);
                for payload in parser.push_chunk(&text) {
                    if let Some(tx) = handshake.take_if(|_| payload.starts_with("/messages?sessionId=")) {
                        let _ = tx.send(payload);
                        continue;
                    }
                    dispatch_frame(&reader_pending, &payload);
                }
            }
            // Stream gone: fail everything still pending.
            let mut guard = reader_pending.lock().unwrap_or_else(|e| e.into_inner());
            for (_, tx) in guard.drain() {
                let _ = tx.send(Err(Error::Generic("SSE stream disconnected".into())));
            }
        });

        let endpoint = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_rx)
            .await
            .map_err(|_| Error::Timeout("waiting for SSE endpoint handshake".into()))?
            .map_err(|_| Error::Generic("SSE stream closed before handshake".into()))?;
        let session_id = endpoint
            .rsplit("sessionId=")
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            http,
            messages_url: format!("{base_url}{endpoint}"),
            session_id,
            pending,
            next_id: AtomicI64::new(1),
            reader,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send one JSON-RPC request and await its SSE-delivered response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_lock().insert(key.clone(), tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let posted = self
            .http
            .post(&self.messages_url)
            .json(&request)
            .send()
            .await;
        match posted {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                self.pending_lock().remove(&key);
                return Err(Error::Http(resp.status().as_u16()));
            }
            Err(e) => {
                self.pending_lock().remove(&key);
                return Err(Error::Generic(format!("failed to fetch: {e}")));
            }
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Generic("MCP response channel dropped".into())),
            Err(_) => {
                self.pending_lock().remove(&key);
                Err(Error::Timeout(format!(
                    "MCP request timed out after {}s",
                    CALL_TIMEOUT.as_secs()
                )))
            }
        }
    }

    pub async fn list_tools(&self) -> Result<Value> {
        self.call("tools/list", json!({})).await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.call("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    fn pending_lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Result<Value>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route one SSE payload: responses resolve their pending slot; anything
/// else (server-initiated notifications) is ignored.
fn dispatch_frame(pending: &Pending, payload: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(payload) else {
        return;
    };
    let key = match frame.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => return,
    };
    let Some(tx) = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&key) else {
        return;
    };
    let result = if let Some(err) = frame.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown RPC error");
        Err(Error::Generic(message.to_string()))
    } else {
        Ok(frame.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = tx.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_extracts_data_payloads_and_skips_comments() {
        let mut parser = SseFrameParser::default();
        let mut out = parser.push_chunk("event: endpoint\ndata: /messages?sessionId=abc\n\n");
        out.extend(parser.push_chunk(":keepalive\n\ndata: {\"id\":1}\n\n"));
        assert_eq!(out, vec!["/messages?sessionId=abc", "{\"id\":1}"]);
    }

    #[test]
    fn parser_handles_split_chunks_and_crlf() {
        let mut parser = SseFrameParser::default();
        assert!(parser.push_chunk("data: {\"id\"").is_empty());
        assert!(parser.push_chunk(":2}\r\n").is_empty());
        let out = parser.push_chunk("\r\n");
        assert_eq!(out, vec!["{\"id\":2}"]);
    }

    #[test]
    fn parser_joins_multi_line_data() {
        let mut parser = SseFrameParser::default();
        let out = parser.push_chunk("data: line1\ndata: line2\n\n");
        assert_eq!(out, vec!["line1\nline2"]);
    }

    #[test]
    fn dispatch_resolves_pending_by_stringified_id() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert("5".to_string(), tx);
        dispatch_frame(&pending, r#"{"jsonrpc":"2.0","id":5,"result":{"x":1}}"#);
        let got = rx.try_recv().unwrap().unwrap();
        assert_eq!(got["x"], json!(1));
    }

    #[test]
    fn dispatch_surfaces_error_messages() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert("9".to_string(), tx);
        dispatch_frame(
            &pending,
            r#"{"jsonrpc":"2.0","id":9,"error":{"code":-32000,"message":"boom"}}"#,
        );
        match rx.try_recv().unwrap() {
            Err(Error::Generic(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_frames_are_ignored_as_notifications() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        dispatch_frame(&pending, r#"{"method":"server/notify","params":{}}"#);
        dispatch_frame(&pending, "not json at all");
        assert!(pending.lock().unwrap().is_empty());
    }
}
