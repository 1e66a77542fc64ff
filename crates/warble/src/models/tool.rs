use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::content::{concat_text, Content};

/// The model facing description of a capability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    /// The callable name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema of the arguments the tool accepts
    pub input_schema: Value,
}

impl Tool {
    pub fn new<N, D>(name: N, description: D, input_schema: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Tool {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A tool call request issued by the model. Arguments are opaque until the
/// capability validates them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new<S: Into<String>>(name: S, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// The outcome of exactly one tool call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    pub content: Vec<Content>,
}

impl ToolResult {
    pub fn success<S: Into<String>>(tool_name: S, content: Vec<Content>) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: true,
            content,
        }
    }

    pub fn failure<S: Into<String>, M: Into<String>>(tool_name: S, message: M) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            content: vec![Content::text(message)],
        }
    }

    pub fn text(&self) -> String {
        concat_text(&self.content)
    }
}
