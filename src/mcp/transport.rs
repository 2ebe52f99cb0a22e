// PRP Agent — MCP Stdio Transport
//
// Spawns the MCP child process and speaks JSON-RPC over its stdin/stdout
// using Content-Length framed messages (same framing as LSP).
//
// Concurrency model: one writer task serializes all stdin writes; one
// reader task demultiplexes replies through a correlation map of oneshot
// senders keyed by request id. Responses may arrive in any order. A
// caller that times out removes its map entry and leaves a tombstone so
// the late reply is dropped silently instead of being logged as unknown.
//
// Lifecycle: Starting → Ready on spawn; Ready → Degraded on any stream
// error (all in-flight calls fail with TransportError); Stopping →
// Stopped on shutdown. Restart is owned by McpClient, not the transport —
// a degraded transport is discarded and replaced wholesale.

use super::types::{JsonRpcRequest, JsonRpcResponse, McpEndpoint, TransportState};
use crate::error::{AgentError, AgentResult};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

/// Tombstones are cleared once the set grows past this bound.
const TOMBSTONE_LIMIT: usize = 1024;

// ── Shared state between caller, reader and writer tasks ───────────────

struct Shared {
    state: Mutex<TransportState>,
    /// In-flight requests awaiting replies, keyed by JSON-RPC id.
    pending: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    /// Ids of cancelled requests whose replies must be dropped silently.
    tombstones: Mutex<HashSet<u64>>,
}

impl Shared {
    /// Transition to Degraded and fail every in-flight call. Dropping the
    /// senders makes each waiter observe a closed channel, which the
    /// request path maps to `TransportError`.
    fn degrade(&self, reason: &str) {
        let mut state = self.state.lock();
        if matches!(*state, TransportState::Stopping | TransportState::Stopped) {
            return;
        }
        if *state != TransportState::Degraded {
            warn!("[mcp] Transport degraded: {}", reason);
            *state = TransportState::Degraded;
        }
        drop(state);
        let dropped = self.pending.lock().drain().count();
        if dropped > 0 {
            warn!("[mcp] Failed {} in-flight call(s)", dropped);
        }
    }
}

// ── Transport ──────────────────────────────────────────────────────────

/// A running stdio transport — owns the child process and message routing.
pub struct StdioTransport {
    shared: Arc<Shared>,
    /// Sender to write framed requests to the child's stdin.
    writer_tx: mpsc::Sender<Vec<u8>>,
    /// Handle to the child process (for health checks and shutdown).
    child: Mutex<Option<Child>>,
    _reader_handle: tokio::task::JoinHandle<()>,
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn the child process and set up bidirectional JSON-RPC routing.
    pub async fn spawn(endpoint: &McpEndpoint) -> AgentResult<Self> {
        info!(
            "[mcp] Spawning: {} {}",
            endpoint.command,
            endpoint.args.join(" ")
        );

        let mut cmd = Command::new(&endpoint.command);
        cmd.args(&endpoint.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &endpoint.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::TransportUnavailable(format!(
                "failed to spawn MCP child `{}`: {e}",
                endpoint.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::transport("child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::transport("child stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::transport("child stderr not piped"))?;

        let shared = Arc::new(Shared {
            state: Mutex::new(TransportState::Starting),
            pending: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
        });

        // ── Writer task: frames and sends messages to stdin ────────────
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);
        let _writer_handle = {
            let shared = Arc::clone(&shared);
            let mut stdin = stdin;
            tokio::spawn(async move {
                while let Some(msg) = writer_rx.recv().await {
                    let frame = format!("Content-Length: {}\r\n\r\n", msg.len());
                    if let Err(e) = stdin.write_all(frame.as_bytes()).await {
                        shared.degrade(&format!("stdin write header: {e}"));
                        break;
                    }
                    if let Err(e) = stdin.write_all(&msg).await {
                        shared.degrade(&format!("stdin write body: {e}"));
                        break;
                    }
                    if let Err(e) = stdin.flush().await {
                        shared.degrade(&format!("stdin flush: {e}"));
                        break;
                    }
                }
                debug!("[mcp] Writer task exiting");
            })
        };

        // ── Reader task: demultiplexes framed replies from stdout ──────
        let _reader_handle = {
            let shared = Arc::clone(&shared);
            let mut reader = BufReader::new(stdout);
            tokio::spawn(async move {
                loop {
                    match read_message(&mut reader).await {
                        Ok(Some(data)) => match serde_json::from_slice::<JsonRpcResponse>(&data) {
                            Ok(resp) => dispatch_response(&shared, resp),
                            Err(e) => {
                                shared.degrade(&format!("malformed frame: {e}"));
                                break;
                            }
                        },
                        Ok(None) => {
                            shared.degrade("stdout closed (child exited)");
                            break;
                        }
                        Err(e) => {
                            shared.degrade(&format!("read error: {e}"));
                            break;
                        }
                    }
                }
            })
        };

        // ── Stderr drain (diagnostics only) ────────────────────────────
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            debug!("[mcp:stderr] {}", trimmed);
                        }
                    }
                }
            }
        });

        *shared.state.lock() = TransportState::Ready;

        Ok(StdioTransport {
            shared,
            writer_tx,
            child: Mutex::new(Some(child)),
            _reader_handle,
            _writer_handle,
        })
    }

    pub fn state(&self) -> TransportState {
        *self.shared.state.lock()
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> AgentResult<JsonRpcResponse> {
        match self.state() {
            TransportState::Ready => {}
            TransportState::Degraded => {
                return Err(AgentError::transport("transport is degraded"))
            }
            other => {
                return Err(AgentError::TransportUnavailable(format!(
                    "transport is {other:?}"
                )))
            }
        }

        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let body = serde_json::to_vec(&request)?;
        if self.writer_tx.send(body).await.is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(AgentError::transport("transport writer closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            // Sender dropped: the transport degraded while we were waiting.
            Ok(Err(_)) => Err(AgentError::transport(
                "transport failed while request was in flight",
            )),
            Err(_) => {
                self.cancel(id);
                Err(AgentError::RequestTimeout {
                    what: format!("mcp request {id}"),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> AgentResult<()> {
        let notif = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| serde_json::json!({})),
        });
        let body = serde_json::to_vec(&notif)?;
        self.writer_tx
            .send(body)
            .await
            .map_err(|_| AgentError::transport("transport writer closed"))
    }

    /// Withdraw an in-flight request and tombstone its id so a late reply
    /// is dropped without noise. Does not touch the child process.
    fn cancel(&self, id: u64) {
        self.shared.pending.lock().remove(&id);
        let mut tombstones = self.shared.tombstones.lock();
        if tombstones.len() >= TOMBSTONE_LIMIT {
            tombstones.clear();
        }
        tombstones.insert(id);
    }

    /// Check if the child process is still running.
    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill the child process and mark the transport Stopped.
    pub async fn shutdown(&self) {
        *self.shared.state.lock() = TransportState::Stopping;
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            info!("[mcp] Stopping child process");
            let _ = child.kill().await;
        }
        self.shared.pending.lock().clear();
        *self.shared.state.lock() = TransportState::Stopped;
    }
}

// ── Response dispatch ──────────────────────────────────────────────────

fn dispatch_response(shared: &Shared, resp: JsonRpcResponse) {
    let Some(id) = resp.id else {
        // Notification from the server — nothing is waiting on it.
        debug!("[mcp] Dropping server notification");
        return;
    };

    if shared.tombstones.lock().remove(&id) {
        debug!("[mcp] Late reply for cancelled id={}, dropped", id);
        return;
    }

    let tx = shared.pending.lock().remove(&id);
    match tx {
        Some(tx) => {
            let _ = tx.send(resp);
        }
        None => warn!("[mcp] Response for unknown id={}, ignoring", id),
    }
}

// ── Content-Length framed message reader ───────────────────────────────

/// Read a single Content-Length framed message from the stream.
/// Returns `Ok(None)` on EOF, `Ok(Some(bytes))` on success.
async fn read_message<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> AgentResult<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    let mut header_line = String::new();

    // Read headers until the empty line
    loop {
        header_line.clear();
        let n = reader.read_line(&mut header_line).await?;
        if n == 0 {
            return Ok(None); // EOF
        }
        let trimmed = header_line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some(val) = trimmed.strip_prefix("Content-Length:") {
            content_length = val.trim().parse::<usize>().ok();
        }
        // Ignore unknown headers (Content-Type, etc.)
    }

    let len =
        content_length.ok_or_else(|| AgentError::transport("missing Content-Length header"))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Some(body))
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_message_basic() {
        let data = b"Content-Length: 13\r\n\r\n{\"test\":true}";
        let mut reader = BufReader::new(&data[..]);
        let result = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(result, b"{\"test\":true}");
    }

    #[tokio::test]
    async fn test_read_message_eof() {
        let data = b"";
        let mut reader = BufReader::new(&data[..]);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_message_with_extra_headers() {
        let data = b"Content-Length: 2\r\nContent-Type: application/json\r\n\r\n{}";
        let mut reader = BufReader::new(&data[..]);
        let result = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(result, b"{}");
    }

    #[tokio::test]
    async fn test_read_message_missing_length() {
        let data = b"Content-Type: application/json\r\n\r\n{}";
        let mut reader = BufReader::new(&data[..]);
        assert!(read_message(&mut reader).await.is_err());
    }

    fn make_shared() -> Arc<Shared> {
        Arc::new(Shared {
            state: Mutex::new(TransportState::Ready),
            pending: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
        })
    }

    fn response(id: u64) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(id),
            result: Some(serde_json::json!({})),
            error: None,
        }
    }

    #[test]
    fn dispatch_delivers_to_pending() {
        let shared = make_shared();
        let (tx, mut rx) = oneshot::channel();
        shared.pending.lock().insert(7, tx);
        dispatch_response(&shared, response(7));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn dispatch_drops_tombstoned_silently() {
        let shared = make_shared();
        shared.tombstones.lock().insert(7);
        dispatch_response(&shared, response(7));
        // Tombstone consumed — the id is usable again.
        assert!(shared.tombstones.lock().is_empty());
    }

    #[test]
    fn degrade_fails_all_in_flight() {
        let shared = make_shared();
        let (tx, mut rx) = oneshot::channel::<JsonRpcResponse>();
        shared.pending.lock().insert(1, tx);
        shared.degrade("test");
        assert_eq!(*shared.state.lock(), TransportState::Degraded);
        // Sender was dropped, so the waiter observes a closed channel.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn degrade_is_noop_when_stopping() {
        let shared = make_shared();
        *shared.state.lock() = TransportState::Stopping;
        shared.degrade("test");
        assert_eq!(*shared.state.lock(), TransportState::Stopping);
    }
}
