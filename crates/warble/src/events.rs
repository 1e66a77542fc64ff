use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::base::Usage;

/// Kinds of progress reported through [`TurnEvent::Status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Thinking,
}

/// One increment of progress of a turn, streamed to the caller in order.
///
/// Every turn ends with exactly one of `Done`, `Cancelled` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Status {
        message: String,
        status_kind: StatusKind,
    },
    ToolCall {
        tool_name: String,
        display_name: String,
        arguments: Value,
    },
    ToolResult {
        tool_name: String,
        display_name: String,
        success: bool,
        result: String,
    },
    TextChunk {
        text: String,
    },
    Done {
        conversation_id: String,
        usage: Usage,
    },
    Cancelled {
        conversation_id: String,
    },
    Error {
        message: String,
    },
}

impl TurnEvent {
    pub fn status<S: Into<String>>(message: S, status_kind: StatusKind) -> Self {
        TurnEvent::Status {
            message: message.into(),
            status_kind,
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        TurnEvent::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Done { .. } | TurnEvent::Cancelled { .. } | TurnEvent::Error { .. }
        )
    }
}
