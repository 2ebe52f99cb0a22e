// PRP Agent — Settings
// Typed configuration loaded from the environment. Call `dotenvy::dotenv()`
// once at process start (the CLI does); after that every value comes from
// `std::env`. Missing or malformed required values fail startup with
// `AgentError::Config`.

use crate::error::{AgentError, AgentResult};
use crate::types::ProviderKind;
use std::time::Duration;

// ── Defaults ───────────────────────────────────────────────────────────

/// Retrieval cap when MAX_CONTEXT_ITEMS is unset.
pub const DEFAULT_MAX_CONTEXT_ITEMS: usize = 5;
/// Prompt token budget when MAX_TOKENS_PER_TURN is unset.
pub const DEFAULT_MAX_TOKENS_PER_TURN: usize = 4096;
/// Per-request deadline when REQUEST_TIMEOUT_MS is unset.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Reply language when DEFAULT_LANGUAGE is unset.
pub const DEFAULT_LANGUAGE: &str = "pt-br";

// ── Settings ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Settings {
    /// Which chat provider adapter to construct.
    pub llm_provider: ProviderKind,
    /// Bearer credential for the provider. Required.
    pub llm_api_key: String,
    /// Model name; provider-appropriate default when unset.
    pub llm_model: String,
    /// Override for the provider base URL (proxies, compatible APIs).
    pub llm_base_url: Option<String>,
    /// Base URL of the remote SQL store, handed to the MCP child.
    pub store_url: String,
    /// Bearer credential for the store, handed to the MCP child.
    pub store_auth_token: Option<String>,
    /// Logical database name used for every StoreClient call.
    pub store_default_database: String,
    /// Command spawned as the MCP child process.
    pub mcp_command: String,
    /// Arguments for the MCP child, whitespace-split from MCP_ARGS.
    pub mcp_args: Vec<String>,
    /// Retrieval cap per turn.
    pub max_context_items: usize,
    /// Prompt token budget per turn.
    pub max_tokens_per_turn: usize,
    /// Deadline applied to each MCP and LLM request.
    pub request_timeout_ms: u64,
    /// Language the agent answers in and translates PRPs into.
    pub default_language: String,
    /// Annotate foreign-language PRP fields for later translation.
    pub auto_translate_on_create: bool,
}

impl Settings {
    /// Load and validate settings from the environment.
    pub fn from_env() -> AgentResult<Self> {
        let llm_provider: ProviderKind = optional("LLM_PROVIDER")
            .as_deref()
            .unwrap_or("openai")
            .parse()
            .map_err(AgentError::Config)?;

        let llm_api_key = required("LLM_API_KEY")?;
        let llm_model =
            optional("LLM_MODEL").unwrap_or_else(|| llm_provider.default_model().to_string());

        let settings = Settings {
            llm_provider,
            llm_api_key,
            llm_model,
            llm_base_url: optional("LLM_BASE_URL"),
            store_url: required("STORE_URL")?,
            store_auth_token: optional("STORE_AUTH_TOKEN"),
            store_default_database: required("STORE_DEFAULT_DATABASE")?,
            mcp_command: required("MCP_COMMAND")?,
            mcp_args: optional("MCP_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            max_context_items: parsed("MAX_CONTEXT_ITEMS", DEFAULT_MAX_CONTEXT_ITEMS)?,
            max_tokens_per_turn: parsed("MAX_TOKENS_PER_TURN", DEFAULT_MAX_TOKENS_PER_TURN)?,
            request_timeout_ms: parsed("REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?,
            default_language: optional("DEFAULT_LANGUAGE")
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            auto_translate_on_create: flag("AUTO_TRANSLATE_ON_CREATE")?,
        };

        if settings.request_timeout_ms == 0 {
            return Err(AgentError::config("REQUEST_TIMEOUT_MS must be > 0"));
        }

        Ok(settings)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Environment handed to the MCP child so it can reach the store.
    pub fn mcp_child_env(&self) -> Vec<(String, String)> {
        let mut env = vec![("STORE_URL".to_string(), self.store_url.clone())];
        if let Some(token) = &self.store_auth_token {
            env.push(("STORE_AUTH_TOKEN".to_string(), token.clone()));
        }
        env.push((
            "STORE_DEFAULT_DATABASE".to_string(),
            self.store_default_database.clone(),
        ));
        env
    }
}

// ── Env helpers ────────────────────────────────────────────────────────

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &str) -> AgentResult<String> {
    optional(key).ok_or_else(|| AgentError::Config(format!("{key} is required but not set")))
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> AgentResult<T> {
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AgentError::Config(format!("{key}={raw:?} is not a valid value"))),
    }
}

fn flag(key: &str) -> AgentResult<bool> {
    match optional(key).as_deref() {
        None => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(raw) => Err(AgentError::Config(format!(
            "{key}={raw:?} is not a valid boolean"
        ))),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
