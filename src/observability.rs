// PRP Agent — Observability Hook
// Structured events emitted at every stage of a turn. The default sink
// discards them; `LogHook` forwards them to the `log` facade. External
// collectors attach by implementing `ObservabilityHook` — the agent takes
// exactly one hook.

use serde::Serialize;

// ── Events ─────────────────────────────────────────────────────────────

/// The turn stage a failure was observed in.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnStage {
    Retrieving,
    Composing,
    Generating,
    Persisting,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStarted {
        session_id: String,
        correlation_id: String,
    },
    RetrievalCompleted {
        session_id: String,
        count: usize,
        latency_ms: u64,
    },
    ToolInvoked {
        session_id: String,
        name: String,
    },
    ToolFailed {
        session_id: String,
        name: String,
        error: String,
    },
    LlmCompleted {
        session_id: String,
        tokens_in: u64,
        tokens_out: u64,
        latency_ms: u64,
    },
    LlmRetried {
        session_id: String,
        attempt: u32,
    },
    TurnPersisted {
        session_id: String,
        seq: i64,
    },
    TurnFailed {
        session_id: String,
        correlation_id: String,
        stage: TurnStage,
        reason: String,
    },
}

// ── Hook trait ─────────────────────────────────────────────────────────

/// Sink for structured agent events. Implementations must be cheap and
/// non-blocking — events are emitted inline on the turn path.
pub trait ObservabilityHook: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// Default sink: discards every event.
#[derive(Debug, Default)]
pub struct NoopHook;

impl ObservabilityHook for NoopHook {
    fn emit(&self, _event: AgentEvent) {}
}

/// Forwards events to the `log` facade at debug level (warn for failures).
#[derive(Debug, Default)]
pub struct LogHook;

impl ObservabilityHook for LogHook {
    fn emit(&self, event: AgentEvent) {
        match &event {
            AgentEvent::TurnFailed { .. } | AgentEvent::ToolFailed { .. } => {
                log::warn!("[events] {}", render(&event));
            }
            _ => log::debug!("[events] {}", render(&event)),
        }
    }
}

fn render(event: &AgentEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| format!("{event:?}"))
}

// ── Tests ──────────────────────────────────────────────────────────────
