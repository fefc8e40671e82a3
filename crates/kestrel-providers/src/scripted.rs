use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{ChatRequest, ChatResponse, Provider, ProviderError, ProviderInfo};

/// Replays a fixed list of responses in order and records every request it
/// receives. Used for offline runs and by the engine tests.
#[derive(Clone)]
pub struct ScriptedProvider {
    id: String,
    script: Arc<Mutex<VecDeque<Result<ChatResponse, ProviderError>>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>, script: Vec<Result<ChatResponse, ProviderError>>) -> Self {
        Self {
            id: id.into(),
            script: Arc::new(Mutex::new(script.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// Waits `delay` before answering; the wait observes cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push(&self, step: Result<ChatResponse, ProviderError>) {
        self.script.lock().await.push_back(step);
    }

    pub async fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.script.lock().await.len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: "Scripted".to_string(),
            default_model: "scripted".to_string(),
        }
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().await.push(request.clone());
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(ProviderError::cancelled());
        }
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::fatal("script exhausted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            model: None,
            messages: Vec::new(),
            tools: Vec::new(),
            temperature: None,
            thinking: false,
        }
    }

    #[tokio::test]
    async fn replays_in_order_then_reports_exhaustion() {
        let provider = ScriptedProvider::new(
            "scripted",
            vec![Ok(ChatResponse::text("one")), Ok(ChatResponse::text("two"))],
        );
        let cancel = CancellationToken::new();
        let first = provider.chat(&request(), cancel.clone()).await.expect("first");
        let second = provider.chat(&request(), cancel.clone()).await.expect("second");
        assert_eq!(first.message.content, "one");
        assert_eq!(second.message.content, "two");
        let err = provider.chat(&request(), cancel).await.expect_err("exhausted");
        assert!(err.message.contains("exhausted"));
        assert_eq!(provider.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn delayed_reply_observes_cancellation() {
        let provider = ScriptedProvider::new("scripted", vec![Ok(ChatResponse::text("late"))])
            .with_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = provider.chat(&request(), cancel).await.expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(provider.remaining().await, 1);
    }
}
