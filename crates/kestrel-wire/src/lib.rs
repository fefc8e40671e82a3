use serde::{Deserialize, Serialize};
use serde_json::Value;

use kestrel_types::{EngineEvent, Message, MessageRole, ToolCall, ToolSchema};

/// `{"type":"function","function":{"name","description","parameters"}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireFunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolSchema> for WireToolDefinition {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            kind: "function".to_string(),
            function: WireFunctionDefinition {
                name: schema.name.clone(),
                description: schema.description.clone(),
                parameters: schema.input_schema.clone(),
            },
        }
    }
}

/// `{"id","type":"function","function":{"name","arguments"}}` where
/// `arguments` is a JSON-encoded string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: function_kind(),
            function: WireFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

impl From<WireToolCall> for ToolCall {
    fn from(call: WireToolCall) -> Self {
        ToolCall::new(call.id, call.function.name, call.function.arguments)
    }
}

/// Chat-completion message as sent to OpenAI-compatible providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let content = if message.role == MessageRole::Assistant
            && message.content.is_empty()
            && message.has_tool_calls()
        {
            None
        } else {
            Some(message.content.clone())
        };
        Self {
            role: message.role.as_str().to_string(),
            content,
            reasoning_content: None,
            tool_calls: message.tool_calls.iter().map(WireToolCall::from).collect(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

/// Encodes one event as a server-sent-events frame: `data: <json>\n\n`.
pub fn sse_frame(event: &EngineEvent) -> serde_json::Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// Parses the JSON payload of a single `data:` frame back into an event.
pub fn parse_sse_frame(frame: &str) -> Option<EngineEvent> {
    let payload = frame.trim_end_matches('\n').strip_prefix("data:")?.trim();
    serde_json::from_str(payload).ok()
}
