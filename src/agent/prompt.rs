// PRP Agent — Prompt Composition
// Builds the model input for a turn: static system prompt, retrieved
// context preamble, the recent session window, and the new user message.
// Trimming order when the token budget is exceeded: lowest-scoring
// retrieved items first, then the oldest window messages. The user's
// current message is never dropped.

use crate::knowledge::ContextItem;
use crate::types::{estimate_message_tokens, estimate_tokens, truncate_utf8, Message};
use log::debug;

/// Per-item cap on snippet length inside the preamble.
const SNIPPET_MAX_CHARS: usize = 600;

// ── System prompt ──────────────────────────────────────────────────────

/// The static role prompt. Retrieval context is appended per turn.
pub fn system_prompt(language: &str) -> String {
    format!(
        "You are a knowledge assistant backed by a Turso-hosted knowledge base. \
         Ground your answers in the provided context whenever it is relevant, and say \
         so when it is not sufficient. You can manage Product Requirement Prompts \
         (PRPs) through your tools. Answer in {language} unless the user asks \
         otherwise."
    )
}

// ── Composition ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ComposedPrompt {
    /// System prompt with the retrieval preamble appended.
    pub system: String,
    /// Window messages followed by the current user message.
    pub messages: Vec<Message>,
    /// How many retrieved items survived trimming.
    pub items_used: usize,
    /// How many window messages survived trimming.
    pub window_used: usize,
}

impl ComposedPrompt {
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.system)
            + self
                .messages
                .iter()
                .map(estimate_message_tokens)
                .sum::<usize>()
    }
}

/// Render retrieved items as a `[origin — topic]: snippet` block.
fn context_preamble(items: &[ContextItem]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut block = String::from("\n\nRelevant context:\n");
    for item in items {
        block.push_str(&format!(
            "[{} — {}]: {}\n",
            item.origin,
            item.topic,
            truncate_utf8(&item.content, SNIPPET_MAX_CHARS)
        ));
    }
    block
}

/// Compose the turn prompt within `budget_tokens`.
///
/// `items` must already be ordered strongest-first (as `search_context`
/// returns them); trimming pops from the back.
pub fn compose(
    base_system: &str,
    mut items: Vec<ContextItem>,
    window: &[Message],
    user_message: &str,
    budget_tokens: usize,
) -> ComposedPrompt {
    let user = Message::user(user_message);
    let mut window_start = 0usize;

    loop {
        let system = format!("{}{}", base_system, context_preamble(&items));
        let mut messages: Vec<Message> = window[window_start..].to_vec();
        messages.push(user.clone());

        let total = estimate_tokens(&system)
            + messages.iter().map(estimate_message_tokens).sum::<usize>();

        if total <= budget_tokens {
            return ComposedPrompt {
                system,
                messages,
                items_used: items.len(),
                window_used: window.len() - window_start,
            };
        }

        // Over budget: drop the weakest retrieved item first, then the
        // oldest window message. The user message is always kept.
        if !items.is_empty() {
            items.pop();
        } else if window_start < window.len() {
            window_start += 1;
        } else {
            debug!(
                "[agent] Prompt still over budget ({} tokens) with nothing left to trim",
                total
            );
            return ComposedPrompt {
                system,
                messages,
                items_used: 0,
                window_used: 0,
            };
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
