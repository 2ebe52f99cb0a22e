// PRP Agent — OpenAI-Compatible Provider
// Handles OpenAI and any OpenAI-compatible REST API reachable through
// LLM_BASE_URL. Single non-streaming chat completion per attempt; retry
// policy lives in `LlmClient`.

use super::retry::parse_retry_after;
use super::{ChatProvider, ProviderError};
use crate::config::Settings;
use crate::types::{
    truncate_utf8, ChatOptions, ChatReply, FunctionCall, Message, ProviderKind, Role, TokenUsage,
    ToolCall, ToolDefinition,
};
use async_trait::async_trait;
use log::{debug, error};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn from_settings(settings: &Settings) -> Self {
        let base_url = settings
            .llm_base_url
            .clone()
            .unwrap_or_else(|| ProviderKind::OpenAi.default_base_url().to_string());
        OpenAiProvider {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(settings.request_timeout())
                .build()
                .unwrap_or_default(),
            base_url,
            api_key: settings.llm_api_key.clone(),
            model: settings.llm_model.clone(),
        }
    }

    fn format_messages(system_prompt: &str, messages: &[Message]) -> Vec<Value> {
        let mut formatted = vec![json!({ "role": "system", "content": system_prompt })];
        for msg in messages {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut m = json!({ "role": role, "content": msg.content });
            if let Some(tool_calls) = &msg.tool_calls {
                m["tool_calls"] = json!(tool_calls);
            }
            if let Some(id) = &msg.tool_call_id {
                m["tool_call_id"] = json!(id);
            }
            formatted.push(m);
        }
        formatted
    }

    fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": t.tool_type,
                    "function": {
                        "name": t.function.name,
                        "description": t.function.description,
                        "parameters": t.function.parameters,
                    }
                })
            })
            .collect()
    }

    fn parse_reply(body: &Value) -> Result<ChatReply, ProviderError> {
        let message = body["choices"]
            .get(0)
            .map(|c| &c["message"])
            .ok_or_else(|| ProviderError::BadRequest("response has no choices".into()))?;

        let text = message["content"].as_str().unwrap_or_default().to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for tc in calls {
                tool_calls.push(ToolCall {
                    id: tc["id"].as_str().unwrap_or_default().to_string(),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                        arguments: tc["function"]["arguments"]
                            .as_str()
                            .unwrap_or("{}")
                            .to_string(),
                    },
                });
            }
        }

        let usage = body.get("usage").map(|u| TokenUsage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
        });

        Ok(ChatReply {
            text,
            tool_calls,
            usage,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete_once(
        &self,
        system_prompt: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChatReply, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": self.model,
            "messages": Self::format_messages(system_prompt, messages),
        });
        if !options.tools.is_empty() {
            body["tools"] = json!(Self::format_tools(&options.tools));
        }
        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = options.max_tokens {
            body["max_tokens"] = json!(max);
        }

        debug!("[llm] OpenAI request to {} model={}", url, self.model);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("HTTP request failed: {e}")))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body_text = response.text().await.unwrap_or_default();
            let message = format!("API error {status}: {}", truncate_utf8(&body_text, 200));
            error!("[llm] OpenAI error {}: {}", status, truncate_utf8(&body_text, 500));

            return Err(match status {
                401 | 403 => ProviderError::Auth(message),
                429 => ProviderError::RateLimited {
                    message,
                    retry_after_secs: retry_after,
                },
                _ => ProviderError::Api { status, message },
            });
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("malformed response body: {e}")))?;
        Self::parse_reply(&parsed)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
