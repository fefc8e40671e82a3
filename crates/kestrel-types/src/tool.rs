use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub output: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ToolResult {
    pub fn new(output: impl Into<String>, metadata: Value) -> Self {
        Self {
            output: output.into(),
            metadata,
        }
    }

    pub fn text(output: impl Into<String>) -> Self {
        Self::new(output, Value::Object(Default::default()))
    }
}
