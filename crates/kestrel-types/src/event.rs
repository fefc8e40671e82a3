use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_STATUS: &str = "status";
pub const EVENT_TOOL_CALL_STARTED: &str = "tool_call_started";
pub const EVENT_TOOL_CALL_COMPLETED: &str = "tool_call_completed";
pub const EVENT_ASSISTANT_MESSAGE: &str = "assistant_message";
pub const EVENT_CONTEXT_UPDATE: &str = "context_update";
pub const EVENT_COMPACTION_START: &str = "compaction_start";
pub const EVENT_COMPACTION_COMPLETE: &str = "compaction_complete";
pub const EVENT_REQUEST_RETRY: &str = "request_retry";
pub const EVENT_PROVIDER_ERROR: &str = "provider_error";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_COMPLETE: &str = "complete";

/// One turn-progress notification. Transient: events are delivered and
/// dropped, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "data")]
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_as_type_and_data_envelope() {
        let event = EngineEvent::new(EVENT_STATUS, json!({"state": "running"}));
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value, json!({"type": "status", "data": {"state": "running"}}));
    }
}
