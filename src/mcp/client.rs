// PRP Agent — MCP Client
//
// Manages the connection to the single MCP endpoint fronting the store.
// Handles the initialize handshake, tools/call, and the lifecycle the
// transport itself does not own: lazy first start, and Degraded →
// Starting restarts guarded by a single-flight latch so a burst of
// failing callers respawns the child exactly once.

use super::transport::StdioTransport;
use super::types::{
    extract_text_content, InitializeParams, InitializeResult, JsonRpcRequest, McpClientInfo,
    McpEndpoint, McpToolResult, ToolCallParams, TransportState,
};
use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use log::{info, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// MCP protocol version we advertise.
const PROTOCOL_VERSION: &str = "2024-11-05";
/// How long a caller may wait on someone else's start/restart before
/// giving up with `TransportUnavailable`.
const STARTUP_GRACE: Duration = Duration::from_secs(10);

// ── Tool bus seam ──────────────────────────────────────────────────────

/// A request/response channel to named tools. `McpClient` is the
/// production implementation; tests substitute an in-memory fake.
#[async_trait]
pub trait ToolBus: Send + Sync {
    /// Invoke a tool and return its decoded JSON payload.
    async fn call_tool(&self, name: &str, arguments: serde_json::Value)
        -> AgentResult<serde_json::Value>;
}

// ── Client ─────────────────────────────────────────────────────────────

/// Outcome of a start attempt, shared with every caller that joined it.
/// `AgentError` is not `Clone`, so followers get the message only.
type FlightOutcome = Option<Result<Arc<StdioTransport>, String>>;

pub struct McpClient {
    endpoint: McpEndpoint,
    timeout: Duration,
    transport: RwLock<Option<Arc<StdioTransport>>>,
    /// Single-flight latch: the in-progress start attempt, if any.
    /// Callers finding one join it instead of spawning their own child.
    inflight: parking_lot::Mutex<Option<tokio::sync::watch::Receiver<FlightOutcome>>>,
    /// Total child spawns — observable so burst-failure behavior can be
    /// asserted on.
    spawn_count: AtomicU64,
    /// Monotonically increasing JSON-RPC request id.
    next_id: AtomicU64,
}

impl McpClient {
    /// Create a client. The child is spawned lazily on the first call.
    pub fn new(endpoint: McpEndpoint, timeout: Duration) -> Self {
        McpClient {
            endpoint,
            timeout,
            transport: RwLock::new(None),
            inflight: parking_lot::Mutex::new(None),
            spawn_count: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::Relaxed)
    }

    /// Current lifecycle state as seen by callers.
    pub fn state(&self) -> TransportState {
        match self.transport.read().as_ref() {
            Some(t) => t.state(),
            None => TransportState::NotStarted,
        }
    }

    /// Gracefully stop the child. Terminal — later calls fail.
    pub async fn shutdown(&self) {
        let transport = self.transport.write().take();
        if let Some(t) = transport {
            t.shutdown().await;
        }
    }

    fn current_ready(&self) -> Option<Arc<StdioTransport>> {
        let guard = self.transport.read();
        guard
            .as_ref()
            .filter(|t| t.state() == TransportState::Ready)
            .cloned()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Return a Ready transport, starting or restarting the child if
    /// needed. At most one start attempt runs at a time; every caller
    /// that arrives during an attempt joins it and shares its outcome.
    async fn ensure_ready(&self) -> AgentResult<Arc<StdioTransport>> {
        if let Some(t) = self.current_ready() {
            return Ok(t);
        }

        let already_started = self.spawn_count() > 0;
        if already_started && !self.endpoint.auto_restart {
            return Err(AgentError::transport(
                "transport is degraded and auto_restart is off",
            ));
        }

        // Become the leader of a new attempt, or follow the current one.
        let (tx, follow_rx) = {
            let mut inflight = self.inflight.lock();
            match inflight.as_ref() {
                Some(rx) => (None, Some(rx.clone())),
                None => {
                    let (tx, rx) = tokio::sync::watch::channel::<FlightOutcome>(None);
                    *inflight = Some(rx);
                    (Some(tx), None)
                }
            }
        };

        if let Some(mut rx) = follow_rx {
            // Follower: block up to the startup grace for the leader's
            // verdict, then fail with TransportUnavailable.
            let outcome = tokio::time::timeout(STARTUP_GRACE, async {
                loop {
                    if let Some(result) = rx.borrow_and_update().clone() {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        return Err("start attempt abandoned".to_string());
                    }
                }
            })
            .await
            .map_err(|_| {
                AgentError::TransportUnavailable("startup grace period elapsed".into())
            })?;
            return outcome.map_err(AgentError::TransportUnavailable);
        }

        // Leader: respawn the child and publish the outcome.
        if already_started {
            warn!("[mcp] Restarting degraded transport");
        }
        let result = self.start_attempt().await;
        *self.inflight.lock() = None;
        if let Some(tx) = tx {
            let shared = match &result {
                Ok(t) => Ok(Arc::clone(t)),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(Some(shared));
        }
        result
    }

    /// One spawn + handshake attempt. The old child, if any, is discarded
    /// first; the new transport is published only after the handshake.
    async fn start_attempt(&self) -> AgentResult<Arc<StdioTransport>> {
        self.spawn_count.fetch_add(1, Ordering::Relaxed);

        let stale = self.transport.write().take();
        if let Some(stale) = stale {
            stale.shutdown().await;
        }

        let transport = Arc::new(StdioTransport::spawn(&self.endpoint).await?);
        self.handshake(&transport).await?;
        *self.transport.write() = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// MCP `initialize` handshake followed by the `initialized` note.
    async fn handshake(&self, transport: &StdioTransport) -> AgentResult<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: serde_json::json!({}),
            client_info: McpClientInfo {
                name: "prp-agent".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let req = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(serde_json::to_value(&params)?),
        );
        let resp = transport.send_request(req, self.timeout).await?;

        if let Some(err) = resp.error {
            return Err(AgentError::transport(format!(
                "initialize failed: {} (code={})",
                err.message, err.code
            )));
        }
        if let Some(result) = resp.result {
            let init: InitializeResult = serde_json::from_value(result)?;
            info!(
                "[mcp] Connected (protocol={}, server={})",
                init.protocol_version,
                init.server_info
                    .map(|s| s.name)
                    .unwrap_or_else(|| "unknown".into())
            );
        }

        transport
            .send_notification("notifications/initialized", None)
            .await
    }
}

#[async_trait]
impl ToolBus for McpClient {
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> AgentResult<serde_json::Value> {
        let transport = self.ensure_ready().await?;

        let params = ToolCallParams {
            name: name.into(),
            arguments,
        };
        let req = JsonRpcRequest::new(
            self.next_id(),
            "tools/call",
            Some(serde_json::to_value(&params)?),
        );

        let resp = transport.send_request(req, self.timeout).await?;

        if let Some(err) = resp.error {
            return Err(AgentError::store(format!(
                "tool '{}' failed: {} (code={})",
                name, err.message, err.code
            )));
        }
        let result = resp
            .result
            .ok_or_else(|| AgentError::store(format!("tool '{name}': empty result")))?;
        let tool_result: McpToolResult = serde_json::from_value(result)?;

        let text = extract_text_content(&tool_result.content);
        if tool_result.is_error {
            return Err(AgentError::store(format!("tool '{name}': {text}")));
        }

        // Store tools answer with a JSON payload in the text block.
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
