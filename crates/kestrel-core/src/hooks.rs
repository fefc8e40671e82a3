//! Context profiles: the pluggable policy that keeps a conversation within
//! the provider's context window.
//!
//! The turn loop calls [`ContextProfile::prepare`] before every provider
//! request and [`ContextProfile::after_response`] after every response. Both
//! may rewrite the history in place and report whether they did, so the loop
//! knows to persist it.

use async_trait::async_trait;
use serde_json::json;

use kestrel_types::{Message, MessageRole, EVENT_COMPACTION_COMPLETE, EVENT_COMPACTION_START};

use crate::Emitter;

#[async_trait]
pub trait ContextProfile: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `true` when `messages` was changed.
    async fn prepare(
        &self,
        _messages: &mut Vec<Message>,
        _events: &Emitter,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Returns `true` when `messages` was changed.
    async fn after_response(
        &self,
        _messages: &mut Vec<Message>,
        _events: &Emitter,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Leaves the history alone.
pub struct PassthroughProfile;

#[async_trait]
impl ContextProfile for PassthroughProfile {
    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Keeps the leading system prompt and the newest messages, replacing the
/// rest with a one-line note.
#[derive(Debug, Clone, Copy)]
pub struct WindowProfile {
    pub keep_recent: usize,
    pub max_chars: usize,
}

impl Default for WindowProfile {
    fn default() -> Self {
        Self {
            keep_recent: 40,
            max_chars: 80_000,
        }
    }
}

impl WindowProfile {
    fn compact(&self, messages: &mut Vec<Message>, events: &Emitter) -> bool {
        let head = usize::from(
            messages
                .first()
                .is_some_and(|m| m.role == MessageRole::System),
        );
        let body_chars = |msgs: &[Message]| msgs.iter().map(message_chars).sum::<usize>();
        if messages.len() - head <= self.keep_recent
            && body_chars(&messages[head..]) <= self.max_chars
        {
            return false;
        }

        let mut cut = head;
        let mut total = body_chars(&messages[head..]);
        // Always leave the newest message in place.
        while cut + 1 < messages.len()
            && (messages.len() - cut > self.keep_recent || total > self.max_chars)
        {
            total = total.saturating_sub(message_chars(&messages[cut]));
            cut += 1;
        }
        // A tool result must stay with the assistant message that requested it.
        while cut > head && cut < messages.len() && messages[cut].role == MessageRole::Tool {
            cut -= 1;
            if messages[cut].has_tool_calls() {
                break;
            }
        }
        let dropped = cut - head;
        if dropped == 0 {
            return false;
        }

        events.emit(
            EVENT_COMPACTION_START,
            json!({"profile": "window", "messages": messages.len()}),
        );
        messages.splice(
            head..cut,
            [Message::system(format!(
                "[history compacted: omitted {dropped} older messages to fit context window]"
            ))],
        );
        events.emit(
            EVENT_COMPACTION_COMPLETE,
            json!({"profile": "window", "dropped": dropped, "messages": messages.len()}),
        );
        tracing::debug!(dropped, "conversation compacted");
        true
    }
}

#[async_trait]
impl ContextProfile for WindowProfile {
    fn name(&self) -> &str {
        "window"
    }

    async fn prepare(&self, messages: &mut Vec<Message>, events: &Emitter) -> anyhow::Result<bool> {
        Ok(self.compact(messages, events))
    }
}

fn message_chars(message: &Message) -> usize {
    message.content.len()
        + message
            .tool_calls
            .iter()
            .map(|c| c.arguments.len())
            .sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CollectingSink;
    use kestrel_types::ToolCall;
    use std::sync::Arc;

    fn history(n: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("you are helpful")];
        for i in 0..n {
            messages.push(Message::user(format!("q{i}")));
            messages.push(Message::assistant(format!("a{i}")));
        }
        messages
    }

    #[tokio::test]
    async fn short_history_is_left_alone() {
        let mut messages = history(2);
        let changed = WindowProfile::default()
            .prepare(&mut messages, &Emitter::discard())
            .await
            .expect("prepare");
        assert!(!changed);
        assert_eq!(messages.len(), 5);
    }

    #[tokio::test]
    async fn keeps_system_prompt_and_recent_messages() {
        let sink = CollectingSink::new();
        let events = Emitter::new(Arc::new(sink.clone()));
        let mut messages = history(5);
        let profile = WindowProfile {
            keep_recent: 4,
            max_chars: 80_000,
        };
        assert!(profile.prepare(&mut messages, &events).await.expect("prepare"));

        assert_eq!(messages.len(), 6);
        assert_eq!(messages[0].content, "you are helpful");
        assert!(messages[1].content.contains("omitted 6 older messages"));
        assert_eq!(messages[2].content, "q3");
        assert_eq!(messages[5].content, "a4");
        assert_eq!(
            sink.types(),
            vec![EVENT_COMPACTION_START, EVENT_COMPACTION_COMPLETE]
        );
    }

    #[tokio::test]
    async fn never_strands_a_tool_result() {
        let mut messages = vec![
            Message::system("sys"),
            Message::user("old"),
            Message::assistant("").with_tool_calls(vec![ToolCall::new("c1", "list_dir", "{}")]),
            Message::tool_result("c1", "a.txt"),
            Message::assistant("done"),
        ];
        let profile = WindowProfile {
            keep_recent: 2,
            max_chars: 80_000,
        };
        assert!(profile
            .prepare(&mut messages, &Emitter::discard())
            .await
            .expect("prepare"));
        let first_kept = &messages[2];
        assert_eq!(first_kept.role, MessageRole::Assistant);
        assert!(first_kept.has_tool_calls());
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c1"));
    }
}
