use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use kestrel_observability::{emit_event, ObservabilityEvent, ProcessKind};
use kestrel_providers::{ChatRequest, ChatResponse, Provider, ProviderError};
use kestrel_tools::{validate_tool_schemas, PlanCache, ToolContext, ToolOutcome, ToolRegistry};
use kestrel_types::{
    Message, MessageRole, PlanSnapshot, TokenUsage, ToolCall, EVENT_ASSISTANT_MESSAGE,
    EVENT_COMPLETE, EVENT_CONTEXT_UPDATE, EVENT_ERROR, EVENT_STATUS, EVENT_TOOL_CALL_COMPLETED,
    EVENT_TOOL_CALL_STARTED,
};

use crate::{ContextProfile, ConversationStore, Emitter, PassthroughProfile, RetryPolicy};

/// Appended to the outgoing request, never to the stored conversation.
pub const DEEP_REASONING_INSTRUCTION: &str = "Think the request through step by step before \
acting: restate the goal, inspect the relevant files, then plan the smallest correct change.";

#[derive(Debug, Clone, PartialEq)]
pub struct TurnSettings {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub thinking: bool,
    pub force_deep_reasoning: bool,
    /// File-mutating tools are refused instead of run.
    pub plan_only: bool,
    pub max_rounds: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            thinking: false,
            force_deep_reasoning: false,
            plan_only: false,
            max_rounds: 50,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("a turn is already running for this session")]
    Busy,
    #[error("provider request failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("turn stopped after {0} tool rounds without a final answer")]
    RoundLimit(usize),
    #[error("invalid tool schema: {0}")]
    InvalidToolSchema(String),
    #[error("context profile failed: {0:#}")]
    Profile(anyhow::Error),
    #[error("failed to persist conversation: {0:#}")]
    Storage(anyhow::Error),
}

impl TurnError {
    pub fn code(&self) -> &'static str {
        match self {
            TurnError::Busy => "BUSY",
            TurnError::Provider(err) if err.kind == kestrel_providers::ProviderErrorKind::Auth => {
                "PROVIDER_AUTH"
            }
            TurnError::Provider(_) => "PROVIDER_ERROR",
            TurnError::RoundLimit(_) => "ROUND_LIMIT",
            TurnError::InvalidToolSchema(_) => "TOOL_SCHEMA_INVALID",
            TurnError::Profile(_) => "CONTEXT_PROFILE",
            TurnError::Storage(_) => "STORAGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The final assistant message.
    Completed(Message),
    Cancelled,
}

/// Releases the busy flag and the cancel slot when a turn ends, however it
/// ends.
struct TurnGuard {
    busy: Arc<AtomicBool>,
    cancel_slot: Arc<StdMutex<Option<CancellationToken>>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.cancel_slot.lock() {
            slot.take();
        }
        self.busy.store(false, Ordering::Release);
    }
}

/// One agent session: a conversation plus everything needed to advance it.
#[derive(Clone)]
pub struct EngineLoop {
    session_id: String,
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    plans: PlanCache,
    store: Arc<dyn ConversationStore>,
    profile: Arc<dyn ContextProfile>,
    events: Emitter,
    retry: RetryPolicy,
    settings: Arc<RwLock<TurnSettings>>,
    conversation: Arc<Mutex<Vec<Message>>>,
    usage: Arc<Mutex<TokenUsage>>,
    busy: Arc<AtomicBool>,
    cancel_slot: Arc<StdMutex<Option<CancellationToken>>>,
}

impl EngineLoop {
    pub fn new(
        session_id: impl Into<String>,
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        plans: PlanCache,
        store: Arc<dyn ConversationStore>,
        events: Emitter,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            provider,
            tools,
            plans,
            store,
            profile: Arc::new(PassthroughProfile),
            events,
            retry: RetryPolicy::default(),
            settings: Arc::new(RwLock::new(TurnSettings::default())),
            conversation: Arc::new(Mutex::new(Vec::new())),
            usage: Arc::new(Mutex::new(TokenUsage::default())),
            busy: Arc::new(AtomicBool::new(false)),
            cancel_slot: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn with_profile(mut self, profile: Arc<dyn ContextProfile>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_settings(mut self, settings: TurnSettings) -> Self {
        self.settings = Arc::new(RwLock::new(settings));
        self
    }

    /// Starts from an existing conversation, e.g. one loaded from a store.
    pub fn with_history(mut self, messages: Vec<Message>) -> Self {
        self.conversation = Arc::new(Mutex::new(messages));
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.conversation.lock().await.clone()
    }

    pub async fn usage(&self) -> TokenUsage {
        *self.usage.lock().await
    }

    pub async fn last_plan(&self) -> Option<PlanSnapshot> {
        self.plans.get(&self.session_id).await
    }

    pub async fn settings(&self) -> TurnSettings {
        self.settings.read().await.clone()
    }

    /// Takes effect from the next turn.
    pub async fn set_plan_only(&self, enabled: bool) {
        self.settings.write().await.plan_only = enabled;
    }

    /// Cancels the in-flight turn, if any. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        let token = match self.cancel_slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Processes one user message through any number of tool rounds.
    ///
    /// Fails with [`TurnError::Busy`], touching nothing, when another turn of
    /// this session is still running.
    pub async fn run_turn(&self, input: &str) -> Result<TurnOutcome, TurnError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TurnError::Busy);
        }
        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.cancel_slot.lock() {
            *slot = Some(cancel.clone());
        }
        let _guard = TurnGuard {
            busy: self.busy.clone(),
            cancel_slot: self.cancel_slot.clone(),
        };

        self.events.emit(
            EVENT_STATUS,
            json!({"session_id": self.session_id, "state": "running"}),
        );
        let result = self.drive(input, &cancel).await;
        match &result {
            Ok(TurnOutcome::Completed(_)) => {}
            Ok(TurnOutcome::Cancelled) => {
                tracing::info!(session_id = %self.session_id, "turn cancelled");
            }
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, "turn failed: {err}");
                self.events.emit(
                    EVENT_ERROR,
                    json!({
                        "session_id": self.session_id,
                        "code": err.code(),
                        "message": err.to_string(),
                    }),
                );
            }
        }
        let state = match &result {
            Ok(TurnOutcome::Cancelled) => "cancelled",
            Ok(TurnOutcome::Completed(_)) => "idle",
            Err(_) => "failed",
        };
        self.events.emit(
            EVENT_STATUS,
            json!({"session_id": self.session_id, "state": state}),
        );
        result
    }

    async fn drive(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let settings = self.settings.read().await.clone();
        {
            let mut conversation = self.conversation.lock().await;
            conversation.push(Message::user(input));
            self.persist(&conversation).await?;
        }

        let mut rounds = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }
            let request = self.prepare_request(&settings).await?;
            let response = match self.call_provider(&request, &settings, cancel).await {
                Ok(response) => response,
                Err(err) if err.is_cancelled() => return Ok(TurnOutcome::Cancelled),
                Err(err) => return Err(err.into()),
            };
            if let Some(usage) = &response.usage {
                self.usage.lock().await.add(usage);
            }

            let ChatResponse {
                message,
                finish_reason,
                ..
            } = response;
            if !message.has_tool_calls() {
                return self.finalize(message, finish_reason).await;
            }
            if rounds >= settings.max_rounds {
                return Err(TurnError::RoundLimit(settings.max_rounds));
            }
            rounds += 1;
            self.run_tool_round(message, &settings, cancel).await?;
            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }
        }
    }

    async fn prepare_request(&self, settings: &TurnSettings) -> Result<ChatRequest, TurnError> {
        let mut messages = {
            let mut conversation = self.conversation.lock().await;
            let mutated = self
                .profile
                .prepare(&mut conversation, &self.events)
                .await
                .map_err(TurnError::Profile)?;
            if mutated {
                self.persist(&conversation).await?;
            }
            conversation.clone()
        };

        let tools = self.tools.list().await;
        if let Err(err) = validate_tool_schemas(&tools) {
            let detail = err.to_string();
            self.obs(
                Level::ERROR,
                "provider.call.error",
                settings,
                None,
                Some(("failed", "TOOL_SCHEMA_INVALID")),
                Some(&detail),
            );
            return Err(TurnError::InvalidToolSchema(detail));
        }

        let continues_user_input = messages
            .last()
            .is_some_and(|m| m.role == MessageRole::User);
        if settings.force_deep_reasoning && continues_user_input {
            messages.push(Message::system(DEEP_REASONING_INSTRUCTION));
        }

        Ok(ChatRequest {
            model: settings.model.clone(),
            messages,
            tools,
            temperature: settings.temperature,
            thinking: settings.thinking || settings.force_deep_reasoning,
        })
    }

    async fn call_provider(
        &self,
        request: &ChatRequest,
        settings: &TurnSettings,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        self.obs(Level::INFO, "provider.call.start", settings, None, Some(("start", "")), None);
        let started = Instant::now();
        let result = self
            .retry
            .call(self.provider.as_ref(), request, cancel, &self.events)
            .await;
        let elapsed = format!("{}ms", started.elapsed().as_millis());
        match &result {
            Ok(_) => self.obs(
                Level::INFO,
                "provider.call.finish",
                settings,
                None,
                Some(("ok", "")),
                Some(&elapsed),
            ),
            Err(err) if err.is_cancelled() => self.obs(
                Level::INFO,
                "provider.call.finish",
                settings,
                None,
                Some(("cancelled", "")),
                Some(&elapsed),
            ),
            Err(err) => {
                let detail = err.to_string();
                self.obs(
                    Level::ERROR,
                    "provider.call.error",
                    settings,
                    None,
                    Some(("failed", err.code.as_str())),
                    Some(&detail),
                );
            }
        }
        result
    }

    async fn finalize(
        &self,
        message: Message,
        finish_reason: Option<String>,
    ) -> Result<TurnOutcome, TurnError> {
        let mutated = {
            let mut conversation = self.conversation.lock().await;
            conversation.push(message.clone());
            self.persist(&conversation).await?;
            self.after_response(&mut conversation).await?
        };

        self.events.emit(
            EVENT_ASSISTANT_MESSAGE,
            json!({
                "session_id": self.session_id,
                "message_id": message.id,
                "content": message.content,
                "thinking": message.thinking,
                "finish_reason": finish_reason,
            }),
        );
        if mutated {
            self.emit_context_update().await;
        }
        let usage = self.usage().await;
        self.events.emit(
            EVENT_COMPLETE,
            json!({"session_id": self.session_id, "usage": usage}),
        );
        Ok(TurnOutcome::Completed(message))
    }

    async fn run_tool_round(
        &self,
        message: Message,
        settings: &TurnSettings,
        cancel: &CancellationToken,
    ) -> Result<(), TurnError> {
        let calls = message.tool_calls.clone();
        {
            let mut conversation = self.conversation.lock().await;
            conversation.push(message);
            self.persist(&conversation).await?;
        }
        for call in &calls {
            self.events.emit(
                EVENT_TOOL_CALL_STARTED,
                json!({
                    "session_id": self.session_id,
                    "id": call.id,
                    "name": call.name,
                    "arguments": call.arguments,
                }),
            );
        }

        let ctx = ToolContext::new(cancel.clone()).with_session(
            self.session_id.clone(),
            self.store.session_dir(&self.session_id),
        );
        for call in &calls {
            let started = Instant::now();
            let outcome = self.execute_call(call, settings, &ctx).await;
            {
                let mut conversation = self.conversation.lock().await;
                conversation.push(Message::tool_result(call.id.clone(), outcome.output.clone()));
                self.persist(&conversation).await?;
            }
            let duration_ms = started.elapsed().as_millis() as u64;
            self.events.emit(
                EVENT_TOOL_CALL_COMPLETED,
                json!({
                    "session_id": self.session_id,
                    "id": call.id,
                    "name": call.name,
                    "is_error": outcome.is_error,
                    "truncated": outcome.truncated,
                    "metadata": outcome.metadata,
                    "duration_ms": duration_ms,
                }),
            );
            let status = if outcome.is_error { "error" } else { "ok" };
            self.obs(
                Level::INFO,
                "tool.call.finish",
                settings,
                Some(&call.name),
                Some((status, "")),
                None,
            );
        }

        let mutated = {
            let mut conversation = self.conversation.lock().await;
            self.after_response(&mut conversation).await?
        };
        if mutated {
            self.emit_context_update().await;
        }
        Ok(())
    }

    async fn execute_call(
        &self,
        call: &ToolCall,
        settings: &TurnSettings,
        ctx: &ToolContext,
    ) -> ToolOutcome {
        if ctx.cancel.is_cancelled() {
            return ToolOutcome::error("turn cancelled before this call ran");
        }
        if settings.plan_only && self.tools.mutates_files(&call.name).await {
            return ToolOutcome::error(format!(
                "`{}` modifies files and file mutation is disabled in plan-only mode; \
describe the intended change instead",
                call.name
            ));
        }
        self.tools.dispatch(&call.name, &call.arguments, ctx).await
    }

    async fn after_response(&self, conversation: &mut Vec<Message>) -> Result<bool, TurnError> {
        let mutated = self
            .profile
            .after_response(conversation, &self.events)
            .await
            .map_err(TurnError::Profile)?;
        if mutated {
            self.persist(conversation).await?;
        }
        Ok(mutated)
    }

    async fn emit_context_update(&self) {
        let count = self.conversation.lock().await.len();
        self.events.emit(
            EVENT_CONTEXT_UPDATE,
            json!({
                "session_id": self.session_id,
                "profile": self.profile.name(),
                "messages": count,
            }),
        );
    }

    async fn persist(&self, conversation: &[Message]) -> Result<(), TurnError> {
        self.store
            .save(&self.session_id, conversation)
            .await
            .map_err(TurnError::Storage)
    }

    fn obs(
        &self,
        level: Level,
        event: &str,
        settings: &TurnSettings,
        tool: Option<&str>,
        status: Option<(&str, &str)>,
        detail: Option<&str>,
    ) {
        let provider_id = self.provider.info().id;
        let (status, error_code) = match status {
            Some((status, code)) => (Some(status), Some(code).filter(|c| !c.is_empty())),
            None => (None, None),
        };
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event,
                component: "engine.loop",
                session_id: Some(&self.session_id),
                provider_id: Some(&provider_id),
                model_id: settings.model.as_deref(),
                tool,
                status,
                error_code,
                detail,
            },
        );
    }
}
