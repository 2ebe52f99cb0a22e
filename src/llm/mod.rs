// PRP Agent — LLM Client
// One operation: given a system prompt and a message list, return an
// assistant reply. `LlmClient` owns everything that is not
// provider-specific — the retry loop with backoff, the circuit breaker,
// and the in-flight cap — while the `ChatProvider` trait carries a
// single wire-format attempt. Adding a provider never touches the retry
// logic.

pub mod anthropic;
pub mod openai;
pub mod retry;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::config::Settings;
use crate::error::{AgentError, AgentResult};
use crate::types::{ChatOptions, ChatReply, Message, ProviderKind};
use async_trait::async_trait;
use log::warn;
use retry::{retry_delay, CircuitBreaker, MAX_RETRIES};
use tokio::sync::Semaphore;

/// Concurrent completions allowed against the provider.
const MAX_IN_FLIGHT: usize = 4;

// ── Provider errors (single attempt) ───────────────────────────────────

/// Classified failure of one provider attempt. The retry loop decides
/// what to do with each class; providers only classify.
#[derive(Debug)]
pub enum ProviderError {
    /// Network-level failure — always retryable.
    Transport(String),
    /// 429 with an optional server-suggested delay.
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },
    /// Non-auth API error; retryable iff the status says so.
    Api { status: u16, message: String },
    /// 401/403 — never retried.
    Auth(String),
    /// The request itself is malformed — never retried.
    BadRequest(String),
}

impl ProviderError {
    fn retryable(&self) -> bool {
        match self {
            ProviderError::Transport(_) | ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => retry::is_retryable_status(*status),
            ProviderError::Auth(_) | ProviderError::BadRequest(_) => false,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    fn into_agent_error(self) -> AgentError {
        match self {
            ProviderError::Transport(msg) => AgentError::LlmUnavailable(msg),
            ProviderError::RateLimited { message, .. } => AgentError::LlmRateLimited(message),
            ProviderError::Api { status, message } if retry::is_retryable_status(status) => {
                AgentError::LlmUnavailable(format!("HTTP {status}: {message}"))
            }
            ProviderError::Api { status, message } => {
                AgentError::LlmBadRequest(format!("HTTP {status}: {message}"))
            }
            ProviderError::Auth(msg) | ProviderError::BadRequest(msg) => {
                AgentError::LlmBadRequest(msg)
            }
        }
    }
}

// ── Provider trait ─────────────────────────────────────────────────────

/// One wire-format attempt against a concrete chat API.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete_once(
        &self,
        system_prompt: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChatReply, ProviderError>;
}

// ── Completion outcome ─────────────────────────────────────────────────

/// A successful completion plus how hard it was to get.
#[derive(Debug)]
pub struct Completion {
    pub reply: ChatReply,
    pub retries: u32,
}

// ── Client ─────────────────────────────────────────────────────────────

pub struct LlmClient {
    provider: Box<dyn ChatProvider>,
    breaker: CircuitBreaker,
    permits: Semaphore,
}

impl LlmClient {
    /// Construct the configured provider adapter.
    pub fn from_settings(settings: &Settings) -> Self {
        let provider: Box<dyn ChatProvider> = match settings.llm_provider {
            ProviderKind::OpenAi => Box::new(OpenAiProvider::from_settings(settings)),
            ProviderKind::Anthropic => Box::new(AnthropicProvider::from_settings(settings)),
        };
        Self::new(provider)
    }

    /// Wrap an arbitrary provider (tests pass scripted stubs here).
    pub fn new(provider: Box<dyn ChatProvider>) -> Self {
        LlmClient {
            provider,
            breaker: CircuitBreaker::new(5, 60),
            permits: Semaphore::new(MAX_IN_FLIGHT),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Complete with retries. Transient failures (network, 5xx, rate
    /// limits) back off and retry up to `MAX_RETRIES`; auth and request
    /// errors surface immediately.
    pub async fn complete(
        &self,
        system_prompt: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> AgentResult<Completion> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AgentError::LlmUnavailable("client shut down".into()))?;

        if let Err(msg) = self.breaker.check() {
            return Err(AgentError::LlmUnavailable(msg));
        }

        let mut retries = 0u32;
        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let retry_after = last_err.as_ref().and_then(ProviderError::retry_after);
                let delay = retry_delay(attempt - 1, retry_after).await;
                retries = attempt;
                warn!(
                    "[llm] {} retry {}/{} after {}ms",
                    self.provider.name(),
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            match self
                .provider
                .complete_once(system_prompt, messages, options)
                .await
            {
                Ok(reply) => {
                    self.breaker.record_success();
                    return Ok(Completion { reply, retries });
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if !e.retryable() {
                        return Err(e.into_agent_error());
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .map(ProviderError::into_agent_error)
            .unwrap_or_else(|| AgentError::LlmUnavailable("retries exhausted".into())))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
