use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use kestrel_providers::{ChatRequest, ChatResponse, Provider, ProviderError};
use kestrel_types::{EVENT_PROVIDER_ERROR, EVENT_REQUEST_RETRY};

use crate::Emitter;

/// Bounded exponential backoff around a single provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl RetryPolicy {
    /// Runs `provider.chat` until it succeeds, fails for good, or the
    /// attempts run out. Cancellation is returned as-is and never retried;
    /// a cancel during backoff ends the wait at once.
    pub async fn call(
        &self,
        provider: &dyn Provider,
        request: &ChatRequest,
        cancel: &CancellationToken,
        events: &Emitter,
    ) -> Result<ChatResponse, ProviderError> {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            let err = match provider.chat(request, cancel.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            if err.is_cancelled() {
                return Err(err);
            }
            if !err.retryable {
                events.emit(
                    EVENT_PROVIDER_ERROR,
                    json!({
                        "kind": err.kind.as_str(),
                        "code": err.code,
                        "message": err.message,
                        "attempt": attempt,
                    }),
                );
                return Err(err);
            }
            if let Some(hint) = err.retry_after {
                delay = delay.max(hint);
            }
            if attempt >= max_attempts {
                tracing::warn!(attempt, "provider retries exhausted: {err}");
                return Err(err);
            }

            events.emit(
                EVENT_REQUEST_RETRY,
                json!({
                    "attempt": attempt,
                    "next": attempt + 1,
                    "max": max_attempts,
                    "delay_ms": delay.as_millis() as u64,
                    "error": err.to_string(),
                }),
            );
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying provider call: {err}"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = delay.saturating_mul(2).min(self.max_delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CollectingSink;
    use kestrel_providers::ScriptedProvider;
    use std::sync::Arc;

    fn request() -> ChatRequest {
        ChatRequest {
            model: None,
            messages: Vec::new(),
            tools: Vec::new(),
            temperature: None,
            thinking: false,
        }
    }

    fn emitter() -> (Emitter, CollectingSink) {
        let sink = CollectingSink::new();
        (Emitter::new(Arc::new(sink.clone())), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn two_transient_failures_then_success() {
        let provider = ScriptedProvider::new(
            "scripted",
            vec![
                Err(ProviderError::transient("502")),
                Err(ProviderError::transient("503")),
                Ok(ChatResponse::text("ok")),
            ],
        );
        let (events, sink) = emitter();
        let response = RetryPolicy::default()
            .call(&provider, &request(), &CancellationToken::new(), &events)
            .await
            .expect("third attempt succeeds");
        assert_eq!(response.message.content, "ok");

        let retries = sink.of_type(EVENT_REQUEST_RETRY);
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].properties["delay_ms"], 1000);
        assert_eq!(retries[1].properties["delay_ms"], 2000);
        assert_eq!(retries[1].properties["next"], 3);
        assert_eq!(provider.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let provider = ScriptedProvider::new(
            "scripted",
            vec![Err(ProviderError::auth("bad key")), Ok(ChatResponse::text("x"))],
        );
        let (events, sink) = emitter();
        let err = RetryPolicy::default()
            .call(&provider, &request(), &CancellationToken::new(), &events)
            .await
            .expect_err("auth fails");
        assert_eq!(err.message, "bad key");
        assert_eq!(sink.types(), vec![EVENT_PROVIDER_ERROR]);
        assert_eq!(provider.remaining().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_raises_the_delay_and_doubling_is_capped() {
        let mut script = vec![Err(ProviderError::rate_limit(
            "slow down",
            Some(Duration::from_secs(10)),
        ))];
        script.extend((0..4).map(|_| Err(ProviderError::transient("again"))));
        let provider = ScriptedProvider::new("scripted", script);
        let (events, sink) = emitter();
        let err = RetryPolicy::default()
            .call(&provider, &request(), &CancellationToken::new(), &events)
            .await
            .expect_err("exhausted");
        assert_eq!(err.message, "again");

        let delays = sink
            .of_type(EVENT_REQUEST_RETRY)
            .iter()
            .map(|e| e.properties["delay_ms"].as_u64().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![10_000, 16_000, 16_000, 16_000]);
        assert_eq!(provider.requests().await.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_retrying() {
        let provider = ScriptedProvider::new(
            "scripted",
            vec![Err(ProviderError::transient("down")), Ok(ChatResponse::text("late"))],
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = RetryPolicy::default()
            .call(&provider, &request(), &cancel, &Emitter::discard())
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(provider.remaining().await, 1);
    }
}
