// PRP Agent — Sessions
// Per-conversation in-memory state: id, bounded message window, turn
// counter, user profile hints. Nothing here is persisted — the
// conversation log in the store is the durable record.
//
// Concurrency: a session admits one turn at a time. The registry hands
// out the per-session lock; a second concurrent turn on the same session
// fails fast with `SessionBusy` instead of queueing.

use crate::error::{AgentError, AgentResult};
use crate::types::Message;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// How many messages the window keeps before the oldest are dropped.
pub const DEFAULT_WINDOW_LIMIT: usize = 20;

// ── Session ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub turn_count: u64,
    /// Free-form hints about the user ("prefers short answers", locale).
    pub user_hints: Vec<String>,
    window: Vec<Message>,
    window_limit: usize,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Session {
            session_id: session_id.into(),
            started_at: Utc::now(),
            turn_count: 0,
            user_hints: Vec::new(),
            window: Vec::new(),
            window_limit: DEFAULT_WINDOW_LIMIT,
        }
    }

    pub fn with_window_limit(mut self, limit: usize) -> Self {
        self.window_limit = limit.max(2);
        self
    }

    /// The recent message window, oldest first.
    pub fn window(&self) -> &[Message] {
        &self.window
    }

    /// Append a message, dropping the oldest once the window is full.
    pub fn push(&mut self, message: Message) {
        self.window.push(message);
        if self.window.len() > self.window_limit {
            let excess = self.window.len() - self.window_limit;
            self.window.drain(..excess);
        }
    }

    /// Forget the window and counters but keep the id.
    pub fn clear(&mut self) {
        self.window.clear();
        self.turn_count = 0;
    }
}

// ── Registry ───────────────────────────────────────────────────────────

/// Hands out per-session state guarded by a tokio mutex. Sessions are
/// created on first use and live until the process exits.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the session entry for `session_id`.
    pub fn entry(&self, session_id: &str) -> Arc<tokio::sync::Mutex<Session>> {
        let mut map = self.sessions.lock();
        map.entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Session::new(session_id))))
            .clone()
    }

    /// Acquire the session for a turn, failing fast when one is in flight.
    pub fn try_acquire(
        &self,
        session_id: &str,
    ) -> AgentResult<tokio::sync::OwnedMutexGuard<Session>> {
        self.entry(session_id)
            .try_lock_owned()
            .map_err(|_| AgentError::SessionBusy(session_id.to_string()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
