use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use kestrel_types::{Message, TokenUsage, ToolCall, ToolSchema};

mod openai;
mod scripted;

pub use openai::OpenAiCompatProvider;
pub use scripted::ScriptedProvider;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub default_model: String,
}

/// One chat-completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f32>,
    pub thinking: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    /// Assistant message, carrying any tool calls.
    pub message: Message,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            message: Message::assistant(content),
            finish_reason: Some("stop".to_string()),
            usage: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            message: Message::assistant("").with_tool_calls(calls),
            finish_reason: Some("tool_calls".to_string()),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimit,
    Auth,
    Transient,
    ContextLength,
    InvalidRequest,
    Cancelled,
    Fatal,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimit => "rate_limit",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::ContextLength => "context_length",
            ProviderErrorKind::InvalidRequest => "invalid_request",
            ProviderErrorKind::Cancelled => "cancelled",
            ProviderErrorKind::Fatal => "fatal",
        }
    }
}

/// Classified provider failure. Only `retryable` errors are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            ProviderErrorKind::RateLimit | ProviderErrorKind::Transient
        );
        Self {
            kind,
            retryable,
            retry_after: None,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ProviderErrorKind::RateLimit, "rate_limit", message)
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, "transient", message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, "auth", message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, "fatal", message)
    }

    pub fn cancelled() -> Self {
        Self::new(ProviderErrorKind::Cancelled, "cancelled", "request cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ProviderErrorKind::Cancelled
    }

    /// Maps an HTTP failure onto the taxonomy. `body` is the raw response text.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let detail = openai::extract_error_message(body).unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("provider request failed with status {status}")
            } else {
                truncate_for_error(body, 500)
            }
        });
        let lower = body.to_ascii_lowercase();
        let code = openai::extract_error_code(body).unwrap_or_else(|| format!("http_{status}"));
        let kind = match status {
            429 => ProviderErrorKind::RateLimit,
            401 | 403 => ProviderErrorKind::Auth,
            408 | 409 | 425 => ProviderErrorKind::Transient,
            500..=599 => ProviderErrorKind::Transient,
            400 | 413
                if lower.contains("context_length")
                    || lower.contains("maximum context")
                    || lower.contains("too many tokens") =>
            {
                ProviderErrorKind::ContextLength
            }
            _ if lower.contains("overloaded") || lower.contains("rate limit") => {
                ProviderErrorKind::Transient
            }
            400..=499 => ProviderErrorKind::InvalidRequest,
            _ => ProviderErrorKind::Fatal,
        };
        Self {
            retry_after,
            ..Self::new(kind, code, detail)
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.kind.as_str(), self.code, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, ProviderError>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
        }
    }

    pub async fn reload(&self, config: ProvidersConfig) {
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
        *self.default_provider.write().await = config.default_provider;
    }

    /// Adds (or replaces by id) a provider built outside the config.
    pub async fn register(&self, provider: Arc<dyn Provider>) {
        let id = provider.info().id;
        let mut providers = self.providers.write().await;
        providers.retain(|p| p.info().id != id);
        providers.push(provider);
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn select(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("no provider configured");
        };
        Ok(provider.clone())
    }
}

const KNOWN_PROVIDERS: [(&str, &str, &str, &str); 6] = [
    ("ollama", "Ollama", "http://127.0.0.1:11434/v1", "llama3.1:8b"),
    ("openai", "OpenAI", "https://api.openai.com/v1", "gpt-4o-mini"),
    ("openrouter", "OpenRouter", "https://openrouter.ai/api/v1", "openai/gpt-4o-mini"),
    ("groq", "Groq", "https://api.groq.com/openai/v1", "llama-3.1-8b-instant"),
    ("mistral", "Mistral", "https://api.mistral.ai/v1", "mistral-small-latest"),
    ("deepseek", "DeepSeek", "https://api.deepseek.com/v1", "deepseek-chat"),
];

/// Ids that need no `url` in the configuration.
pub fn known_provider_ids() -> Vec<&'static str> {
    KNOWN_PROVIDERS.iter().map(|(id, ..)| *id).collect()
}

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    for (id, name, default_url, default_model) in KNOWN_PROVIDERS {
        let Some(entry) = config.providers.get(id) else {
            continue;
        };
        providers.push(Arc::new(OpenAiCompatProvider::new(
            id,
            name,
            entry.url.as_deref().unwrap_or(default_url),
            resolve_api_key(id, entry),
            entry.default_model.as_deref().unwrap_or(default_model),
        )));
    }

    // Anything else with an explicit URL is treated as OpenAI-compatible.
    let mut custom = config
        .providers
        .iter()
        .filter(|(id, _)| !KNOWN_PROVIDERS.iter().any(|(known, ..)| *known == id.as_str()))
        .collect::<Vec<_>>();
    custom.sort_by(|a, b| a.0.cmp(b.0));
    for (id, entry) in custom {
        let Some(url) = entry.url.as_deref() else {
            tracing::warn!("provider `{id}` has no url and is not a known provider; skipping");
            continue;
        };
        providers.push(Arc::new(OpenAiCompatProvider::new(
            id,
            id,
            url,
            resolve_api_key(id, entry),
            entry.default_model.as_deref().unwrap_or("default"),
        )));
    }
    providers
}

fn resolve_api_key(id: &str, entry: &ProviderConfig) -> Option<String> {
    entry
        .api_key
        .as_deref()
        .filter(|key| !is_placeholder_api_key(key))
        .map(|key| key.to_string())
        .or_else(|| env_api_key_for_provider(id))
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

pub(crate) fn truncate_for_error(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        format!("{}...", input.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider_ids: &[&str], default_provider: Option<&str>) -> ProvidersConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some("sk-test".to_string()),
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        ProvidersConfig {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openai")));
        let provider = registry.select(Some("openrouter")).await.expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[tokio::test]
    async fn uses_default_provider_when_no_explicit_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openrouter")));
        let provider = registry.select(None).await.expect("provider");
        assert_eq!(provider.info().id, "openrouter");
        assert_eq!(provider.info().default_model, "openrouter-model");
    }

    #[tokio::test]
    async fn explicit_unknown_provider_errors() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None));
        let err = registry
            .select(Some("openruter"))
            .await
            .err()
            .expect("expected error");
        assert!(err
            .to_string()
            .contains("provider `openruter` is not configured"));
    }

    #[tokio::test]
    async fn custom_providers_need_a_url() {
        let mut config = cfg(&[], None);
        config.providers.insert(
            "local-llm".to_string(),
            ProviderConfig {
                url: Some("http://localhost:8080/v1".to_string()),
                ..Default::default()
            },
        );
        config
            .providers
            .insert("mystery".to_string(), ProviderConfig::default());
        let registry = ProviderRegistry::new(config);
        let ids = registry
            .list()
            .await
            .into_iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["local-llm".to_string()]);
    }

    #[tokio::test]
    async fn registered_provider_replaces_same_id() {
        let registry = ProviderRegistry::new(ProvidersConfig::default());
        registry
            .register(Arc::new(ScriptedProvider::new("scripted", Vec::new())))
            .await;
        registry
            .register(Arc::new(ScriptedProvider::new("scripted", Vec::new())))
            .await;
        assert_eq!(registry.list().await.len(), 1);
        assert!(registry.select(None).await.is_ok());
    }

    #[test]
    fn status_classification() {
        let limited = ProviderError::from_status(429, "", Some(Duration::from_secs(3)));
        assert_eq!(limited.kind, ProviderErrorKind::RateLimit);
        assert!(limited.retryable);
        assert_eq!(limited.retry_after, Some(Duration::from_secs(3)));

        let auth = ProviderError::from_status(401, r#"{"error":{"message":"bad key"}}"#, None);
        assert_eq!(auth.kind, ProviderErrorKind::Auth);
        assert!(!auth.retryable);
        assert_eq!(auth.message, "bad key");

        let unavailable = ProviderError::from_status(503, "upstream down", None);
        assert!(unavailable.retryable);
        assert_eq!(unavailable.code, "http_503");

        let context = ProviderError::from_status(
            400,
            r#"{"error":{"message":"maximum context length exceeded","code":"context_length_exceeded"}}"#,
            None,
        );
        assert_eq!(context.kind, ProviderErrorKind::ContextLength);
        assert_eq!(context.code, "context_length_exceeded");
        assert!(!context.retryable);

        let invalid = ProviderError::from_status(422, "nope", None);
        assert_eq!(invalid.kind, ProviderErrorKind::InvalidRequest);
        assert!(!invalid.retryable);
    }
}
