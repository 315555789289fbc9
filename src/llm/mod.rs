mod anthropic;
mod gemini;
mod openai;

use crate::catalog::OperationSpec;
use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::session::{ConversationTurn, ToolInvocationRequest, ToolInvocationResult, TurnContent};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// LLM provider; determines API format and endpoint.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Gemini,
    Anthropic,
    OpenRouter,
    /// Any OpenAI-compatible API (together.ai, local ollama, etc.)
    #[serde(rename = "openai")]
    OpenAi,
}

impl Provider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gemini" | "google" => Some(Self::Gemini),
            "anthropic" => Some(Self::Anthropic),
            "openrouter" => Some(Self::OpenRouter),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::OpenAi => "http://localhost:11434/v1",
        }
    }

    fn default_api_key_env(&self) -> &'static str {
        match self {
            Self::Gemini => "GOOGLE_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini-1.5-flash",
            Self::Anthropic => "claude-sonnet-4-5",
            Self::OpenRouter => "google/gemini-flash-1.5",
            Self::OpenAi => "llama3.1",
        }
    }
}

/// Everything the model sees for one reasoning step.
pub struct ModelRequest<'a> {
    pub system: &'a str,
    pub turns: &'a [ConversationTurn],
    pub tools: &'a [OperationSpec],
}

/// The model either answers in text or asks for zero or more tool calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub tool_calls: Vec<ToolInvocationRequest>,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolInvocationRequest>) -> Self {
        Self {
            text: String::new(),
            tool_calls: calls,
        }
    }
}

/// A model that can drive the tool-calling loop.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn respond(&self, request: &ModelRequest<'_>) -> Result<ModelReply>;
}

pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
    timeout: Duration,
    http: HttpClient,
    call_seq: AtomicU64,
}

impl LlmClient {
    pub fn new(
        provider: Provider,
        api_key: String,
        model: String,
        max_tokens: u32,
        base_url: Option<String>,
    ) -> Result<Self> {
        let http = HttpClient::new(concat!("orderdesk/", env!("CARGO_PKG_VERSION")))?;
        let base_url = base_url.unwrap_or_else(|| provider.default_base_url().into());
        Ok(Self {
            provider,
            api_key,
            model,
            max_tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(60),
            http,
            call_seq: AtomicU64::new(1),
        })
    }

    /// Build from config, reading the API key from the configured env var.
    ///
    /// A missing key is a configuration error here, at startup, rather than a
    /// failure on every turn.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let env_var = config
            .api_key_env
            .clone()
            .unwrap_or_else(|| config.provider.default_api_key_env().into());
        let api_key = std::env::var(&env_var).unwrap_or_default();
        if api_key.trim().is_empty() && config.provider != Provider::OpenAi {
            return Err(Error::config(format!(
                "{env_var} is not set. Export it or set llm.api_key_env in the config file"
            )));
        }
        Ok(Self::new(
            config.provider,
            api_key,
            config.model.clone(),
            config.max_tokens,
            config.base_url.clone(),
        )?
        .with_timeout(Duration::from_secs(config.timeout_secs)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    async fn post(&self, url: &str, body: &Value, headers: &[(&str, &str)]) -> Result<String> {
        let body = serde_json::to_string(body)
            .map_err(|e| Error::parse(format!("serialize request: {e}")))?;
        self.http
            .post_json_raw(url, &body, headers, self.timeout)
            .await
            .inspect_err(|e| warn!(provider = ?self.provider, "LLM API error: {e}"))
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn respond(&self, request: &ModelRequest<'_>) -> Result<ModelReply> {
        debug!(
            provider = ?self.provider,
            model = %self.model,
            turns = request.turns.len(),
            "sending LLM request"
        );

        match self.provider {
            Provider::Gemini => {
                let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
                let body = gemini::request_body(self.max_tokens, request);
                let text = self
                    .post(&url, &body, &[("x-goog-api-key", &self.api_key)])
                    .await?;
                gemini::parse_reply(&text, &self.call_seq)
            }
            Provider::Anthropic => {
                let url = format!("{}/messages", self.base_url);
                let body = anthropic::request_body(&self.model, self.max_tokens, request);
                let text = self
                    .post(
                        &url,
                        &body,
                        &[
                            ("x-api-key", &self.api_key),
                            ("anthropic-version", "2023-06-01"),
                        ],
                    )
                    .await?;
                anthropic::parse_reply(&text)
            }
            Provider::OpenRouter | Provider::OpenAi => {
                let url = format!("{}/chat/completions", self.base_url);
                let body = openai::request_body(&self.model, self.max_tokens, request);
                let auth = format!("Bearer {}", self.api_key);
                let text = self.post(&url, &body, &[("Authorization", &auth)]).await?;
                openai::parse_reply(&text)
            }
        }
    }
}

/// The catalog as `provider` expects it in the `tools` field of a request.
pub fn tool_declarations(provider: Provider, tools: &[OperationSpec]) -> Value {
    match provider {
        Provider::Gemini => gemini::declarations(tools),
        Provider::Anthropic => anthropic::declarations(tools),
        Provider::OpenRouter | Provider::OpenAi => openai::declarations(tools),
    }
}

/// What a tool result looks like to the model.
fn result_content(result: &ToolInvocationResult) -> Value {
    if result.success {
        json!({ "result": result.payload })
    } else {
        result.payload.clone()
    }
}

/// For each turn, whether it is a tool result whose request is not in `turns`.
///
/// Windowing can cut a call away from its result; such results are sent as
/// plain user text because no provider accepts a dangling tool result.
fn orphaned_results(turns: &[ConversationTurn]) -> Vec<bool> {
    let mut seen = HashSet::new();
    turns
        .iter()
        .map(|turn| match &turn.content {
            TurnContent::ToolCalls(calls) => {
                seen.extend(calls.iter().map(|c| c.id.as_str()));
                false
            }
            TurnContent::ToolResult(result) => !seen.contains(result.id.as_str()),
            TurnContent::Text(_) => false,
        })
        .collect()
}

fn orphan_text(result: &ToolInvocationResult) -> String {
    format!(
        "[earlier {} result] {}",
        result.operation_name,
        result_content(result)
    )
}

/// Stands in for the part of the conversation the window cut away.
const OMITTED_OPENER: &str = "(earlier conversation omitted)";

/// Prepend `opener` when `messages` would start on an `assistant_role` turn.
///
/// A window that starts inside a tool round begins with the model's call;
/// Gemini and Anthropic both reject a conversation that does not open with
/// the user.
fn open_with_user(messages: &mut Vec<Value>, assistant_role: &str, opener: Value) {
    if messages.first().is_some_and(|m| m["role"] == assistant_role) {
        messages.insert(0, opener);
    }
}

/// Arguments as an object, which every provider requires on the wire.
fn arguments_object(arguments: &Value) -> Value {
    if arguments.is_object() {
        arguments.clone()
    } else {
        json!({})
    }
}

/// Concatenate the array under `key` of consecutive messages sharing a role.
fn merge_same_role(messages: Vec<Value>, key: &str) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(messages.len());
    for msg in messages {
        if let Some(prev) = merged.last_mut() {
            if prev["role"] == msg["role"] {
                if let (Some(into), Some(from)) = (prev[key].as_array_mut(), msg[key].as_array()) {
                    into.extend(from.iter().cloned());
                    continue;
                }
            }
        }
        merged.push(msg);
    }
    merged
}

fn next_call_id(seq: &AtomicU64) -> String {
    format!("call_{}", seq.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolInvocationResult;

    fn call(id: &str) -> ToolInvocationRequest {
        ToolInvocationRequest {
            id: id.into(),
            operation_name: "search_products".into(),
            arguments: json!({"query": "monitor"}),
        }
    }

    #[test]
    fn detects_orphaned_results() {
        let turns = vec![
            ConversationTurn::tool_result(ToolInvocationResult::success(&call("a"), json!([]))),
            ConversationTurn::user("hi"),
            ConversationTurn::tool_calls(vec![call("b")]),
            ConversationTurn::tool_result(ToolInvocationResult::success(&call("b"), json!([]))),
        ];
        assert_eq!(orphaned_results(&turns), [true, false, false, false]);
    }

    #[test]
    fn merges_consecutive_roles() {
        let merged = merge_same_role(
            vec![
                json!({"role": "user", "parts": [{"text": "a"}]}),
                json!({"role": "user", "parts": [{"text": "b"}]}),
                json!({"role": "model", "parts": [{"text": "c"}]}),
            ],
            "parts",
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["parts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn declarations_per_provider() {
        let tools = crate::catalog::list_operations();
        let gemini = tool_declarations(Provider::Gemini, tools);
        assert_eq!(gemini[0]["functionDeclarations"].as_array().unwrap().len(), 8);
        let openai = tool_declarations(Provider::OpenRouter, tools);
        assert_eq!(openai[4]["function"]["name"], "verify_customer_pin");
        let anthropic = tool_declarations(Provider::Anthropic, tools);
        assert_eq!(anthropic[2]["input_schema"]["required"][0], "query");
    }

    #[test]
    fn provider_names() {
        assert_eq!(Provider::parse("Gemini"), Some(Provider::Gemini));
        assert_eq!(Provider::parse("openai"), Some(Provider::OpenAi));
        assert_eq!(Provider::parse("bard"), None);
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let config = LlmConfig {
            api_key_env: Some("ORDERDESK_TEST_KEY_THAT_IS_NEVER_SET".into()),
            ..LlmConfig::default()
        };
        let err = LlmClient::from_config(&config).err().unwrap();
        assert_eq!(err.fault_kind(), crate::error::FaultKind::Configuration);
    }
}
