use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use kestrel_types::{Message, TokenUsage, ToolCall};
use kestrel_wire::{WireMessage, WireToolCall, WireToolDefinition};

use crate::{
    truncate_for_error, ChatRequest, ChatResponse, Provider, ProviderError, ProviderInfo,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Any `/chat/completions` endpoint speaking the OpenAI schema.
pub struct OpenAiCompatProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            base_url: normalize_base(base_url),
            api_key,
            default_model: default_model.into(),
            client: Client::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    pub fn build_body(&self, request: &ChatRequest) -> Value {
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let messages = request
            .messages
            .iter()
            .map(WireMessage::from)
            .collect::<Vec<_>>();
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        if !request.tools.is_empty() {
            let tools = request
                .tools
                .iter()
                .map(WireToolDefinition::from)
                .collect::<Vec<_>>();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if request.thinking {
            body["reasoning_effort"] = json!("high");
        }
        body
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            default_model: self.default_model.clone(),
        }
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let mut req = self
            .client
            .post(self.endpoint())
            .timeout(REQUEST_TIMEOUT)
            .json(&self.build_body(request));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = req.send() => result.map_err(classify_transport_error)?,
        };
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = response.text() => result.map_err(classify_transport_error)?,
        };

        if !status.is_success() {
            return Err(ProviderError::from_status(
                status.as_u16(),
                &text,
                retry_after,
            ));
        }
        parse_response(&text)
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ProviderError::transient(err.to_string())
    } else {
        ProviderError::fatal(err.to_string())
    }
}

/// Decodes a non-streaming chat-completion body.
pub fn parse_response(text: &str) -> Result<ChatResponse, ProviderError> {
    let value: Value = serde_json::from_str(text).map_err(|err| {
        ProviderError::fatal(format!(
            "provider returned invalid JSON: {err} (response: {})",
            truncate_for_error(text, 500)
        ))
    })?;
    if let Some(detail) = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return Err(ProviderError::fatal(detail.to_string()));
    }
    let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else {
        return Err(ProviderError::fatal(format!(
            "provider response has no choices (response: {})",
            truncate_for_error(text, 500)
        )));
    };
    let wire = choice.get("message").cloned().unwrap_or(Value::Null);
    let content = wire
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let thinking = wire
        .get("reasoning_content")
        .or_else(|| wire.get("reasoning"))
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let calls = match wire.get("tool_calls") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| decode_tool_call(idx, item))
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };

    Ok(ChatResponse {
        message: Message::assistant(content)
            .with_thinking(thinking)
            .with_tool_calls(calls),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(ToString::to_string),
        usage: extract_usage(&value),
    })
}

fn decode_tool_call(idx: usize, item: &Value) -> Result<ToolCall, ProviderError> {
    let mut wire: WireToolCall = serde_json::from_value(item.clone()).map_err(|err| {
        ProviderError::fatal(format!("malformed tool call at index {idx}: {err}"))
    })?;
    if wire.id.trim().is_empty() {
        wire.id = format!("call_{idx}");
    }
    Ok(ToolCall::from(wire))
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

pub(crate) fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

pub(crate) fn extract_error_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("code")
        .or_else(|| error.get("type"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// `Retry-After` in (possibly fractional) seconds; HTTP dates are ignored.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_millis((secs * 1000.0) as u64))
}

fn normalize_base(input: &str) -> String {
    input.trim().trim_end_matches('/').to_string()
}
