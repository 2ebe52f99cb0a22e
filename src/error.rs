// ── PRP Agent: Error Types ─────────────────────────────────────────────────
// Single canonical error enum for the agent, built with `thiserror`.
//
// Design rules:
//   • Variants follow ownership of the failing dependency: transport errors
//     are retried at the MCP layer, LLM errors at the provider layer, and
//     anything that reaches the agent turn is surfaced once with a
//     correlation id.
//   • The `#[from]` attribute wires std/external error conversions.
//   • No variant carries secret material (API keys, tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or malformed configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The MCP transport is not ready and did not become ready within the
    /// startup grace period.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A stream-level MCP failure (broken pipe, malformed frame, child exit).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A request (or the enclosing turn) exceeded its deadline.
    #[error("{what} timed out after {timeout_ms}ms")]
    RequestTimeout { what: String, timeout_ms: u64 },

    /// A mutating statement was handed to the read-only query path.
    #[error("Read-only violation: {0}")]
    ReadOnlyViolation(String),

    /// The remote store rejected a statement or returned an error row.
    #[error("Store error: {0}")]
    Store(String),

    /// LLM provider unreachable after retries were exhausted.
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    /// LLM provider rate limit that outlived the retry budget.
    #[error("LLM rate limited: {0}")]
    LlmRateLimited(String),

    /// The LLM provider rejected the request (auth, malformed body).
    /// Never retried.
    #[error("LLM bad request: {0}")]
    LlmBadRequest(String),

    /// The model kept emitting tool calls past the configured depth.
    #[error("Tool-call depth {0} exceeded without a final answer")]
    ToolLoopExceeded(u32),

    /// A second concurrent turn was attempted on a busy session.
    #[error("Session {0} already has a turn in flight")]
    SessionBusy(String),

    /// A repository lookup matched nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated (e.g. PRP name collision).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl AgentError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// True when the error came from the MCP layer and a fresh transport
    /// may clear it. Used to decide whether a restart is worth attempting.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::TransportUnavailable(_) | Self::RequestTimeout { .. }
        )
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All agent operations return this type.
pub type AgentResult<T> = Result<T, AgentError>;

// ── Tests ──────────────────────────────────────────────────────────────────
