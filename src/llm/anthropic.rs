// PRP Agent — Anthropic Claude Provider
// Non-streaming messages API. Anthropic keeps the system prompt out of
// the message list, uses the user role for tool results, and carries
// tool arguments as JSON objects rather than encoded strings — all of
// that translation happens here and nowhere else.

use super::retry::parse_retry_after;
use super::{ChatProvider, ProviderError};
use crate::config::Settings;
use crate::types::{
    truncate_utf8, ChatOptions, ChatReply, FunctionCall, Message, ProviderKind, Role, TokenUsage,
    ToolCall,
};
use async_trait::async_trait;
use log::{debug, error};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The messages API requires max_tokens; used when the caller sets none.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn from_settings(settings: &Settings) -> Self {
        let base_url = settings
            .llm_base_url
            .clone()
            .unwrap_or_else(|| ProviderKind::Anthropic.default_base_url().to_string());
        AnthropicProvider {
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

    fn format_messages(messages: &[Message]) -> Vec<Value> {
        let mut formatted = Vec::new();
        for msg in messages {
            match msg.role {
                // System turns mid-conversation become user guidance.
                Role::System | Role::User => {
                    formatted.push(json!({ "role": "user", "content": msg.content }));
                }
                Role::Tool => {
                    if let Some(tc_id) = &msg.tool_call_id {
                        formatted.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": tc_id,
                                "content": msg.content,
                            }]
                        }));
                    }
                }
                Role::Assistant => {
                    if let Some(tool_calls) = &msg.tool_calls {
                        let mut blocks: Vec<Value> = Vec::new();
                        if !msg.content.is_empty() {
                            blocks.push(json!({ "type": "text", "text": msg.content }));
                        }
                        for tc in tool_calls {
                            let input: Value = serde_json::from_str(&tc.function.arguments)
                                .unwrap_or_else(|_| json!({}));
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.function.name,
                                "input": input,
                            }));
                        }
                        formatted.push(json!({ "role": "assistant", "content": blocks }));
                    } else {
                        formatted.push(json!({ "role": "assistant", "content": msg.content }));
                    }
                }
            }
        }
        formatted
    }

    fn format_tools(options: &ChatOptions) -> Vec<Value> {
        options
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "input_schema": t.function.parameters,
                })
            })
            .collect()
    }

    fn parse_reply(body: &Value) -> Result<ChatReply, ProviderError> {
        let content = body["content"]
            .as_array()
            .ok_or_else(|| ProviderError::BadRequest("response has no content".into()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in content {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: block["input"].to_string(),
                    },
                }),
                _ => {}
            }
        }

        let usage = body.get("usage").map(|u| TokenUsage {
            input_tokens: u["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: u["output_tokens"].as_u64().unwrap_or(0),
        });

        Ok(ChatReply {
            text,
            tool_calls,
            usage,
        })
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete_once(
        &self,
        system_prompt: &str,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChatReply, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        let mut body = json!({
            "model": self.model,
            "system": system_prompt,
            "messages": Self::format_messages(messages),
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !options.tools.is_empty() {
            body["tools"] = json!(Self::format_tools(options));
        }
        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }

        debug!("[llm] Anthropic request to {} model={}", url, self.model);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
            error!(
                "[llm] Anthropic error {}: {}",
                status,
                truncate_utf8(&body_text, 500)
            );

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
