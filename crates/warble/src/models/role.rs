use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// A resolved tool call: the request and its response in one message
    Tool,
    /// Informational entries shown to the user; never sent to the model
    Status,
}
