use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::errors::AgentError;
use crate::models::content::{Content, ImageContent};
use crate::models::message::{Message, MessageContent, ToolRequest, ToolResponse};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};
use crate::providers::base::Usage;

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

const INVALID_CALL_NAME: &str = "invalid_tool_call";

/// Convert internal Message format to OpenAI's API message specification.
///
/// A tool message expands into the assistant turn that requested the call and
/// the tool turn that answered it. Status messages are not sent.
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec: Vec<Value> = Vec::new();

    for message in messages {
        match message.role {
            Role::Status => continue,
            Role::Tool => {
                let mut expanded = tool_message_to_spec(message);
                // Text the model sent alongside its calls shares their assistant turn
                let merge = matches!(
                    messages_spec.last(),
                    Some(last) if last["role"] == "assistant" && last.get("tool_calls").is_none()
                ) && expanded
                    .first()
                    .map_or(false, |first| first.get("tool_calls").is_some());
                if merge {
                    let request = expanded.remove(0);
                    if let Some(last) = messages_spec.last_mut() {
                        last["tool_calls"] = request["tool_calls"].clone();
                    }
                }
                messages_spec.extend(expanded);
            }
            Role::User | Role::Assistant => {
                let mut converted = json!({ "role": message.role });
                let mut parts = Vec::new();
                let mut has_image = false;

                for content in &message.content {
                    match content {
                        MessageContent::Text(text) => {
                            if !text.text.is_empty() {
                                parts.push(json!({"type": "text", "text": text.text}));
                            }
                        }
                        MessageContent::Image(image) => {
                            has_image = true;
                            parts.push(convert_image(image));
                        }
                        MessageContent::ToolRequest(request) => {
                            push_tool_call(&mut converted, request);
                        }
                        MessageContent::ToolResponse(response) => {
                            messages_spec.push(tool_response_to_spec(response));
                        }
                    }
                }

                if has_image {
                    converted["content"] = json!(parts);
                } else if !parts.is_empty() {
                    let text: String = parts
                        .iter()
                        .filter_map(|p| p["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    converted["content"] = json!(text);
                }

                if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
                    messages_spec.push(converted);
                }
            }
        }
    }

    messages_spec
}

fn push_tool_call(converted: &mut Value, request: &ToolRequest) {
    let (name, arguments) = match &request.tool_call {
        Ok(tool_call) => (
            sanitize_function_name(&tool_call.name),
            tool_call.arguments.to_string(),
        ),
        Err(_) => (INVALID_CALL_NAME.to_string(), "{}".to_string()),
    };

    if let Some(object) = converted.as_object_mut() {
        let tool_calls = object.entry("tool_calls").or_insert_with(|| json!([]));
        if let Some(array) = tool_calls.as_array_mut() {
            array.push(json!({
                "id": request.id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": arguments,
                }
            }));
        }
    }
}

fn tool_response_to_spec(response: &ToolResponse) -> Value {
    let result = &response.tool_result;
    let content = if result.success {
        let mut texts = Vec::new();
        for content in &result.content {
            match content {
                Content::Text(text) => texts.push(text.text.clone()),
                Content::Image(_) => texts.push("[image omitted]".to_string()),
            }
        }
        texts.join("\n")
    } else {
        // A tool error is shown as output so the model can interpret the error message
        format!("The tool call returned the following error:\n{}", result.text())
    };

    json!({
        "role": "tool",
        "content": content,
        "tool_call_id": response.id
    })
}

fn tool_message_to_spec(message: &Message) -> Vec<Value> {
    let mut request = json!({"role": "assistant"});
    let mut responses = Vec::new();

    for content in &message.content {
        match content {
            MessageContent::ToolRequest(tool_request) => push_tool_call(&mut request, tool_request),
            MessageContent::ToolResponse(response) => responses.push(tool_response_to_spec(response)),
            _ => {}
        }
    }

    if request.get("tool_calls").is_none() {
        return responses;
    }
    let mut output = vec![request];
    output.extend(responses);
    output
}

/// Convert an image content into the OpenAI image_url part
pub fn convert_image(image: &ImageContent) -> Value {
    json!({
        "type": "image_url",
        "image_url": {
            "url": format!("data:{};base64,{}", image.mime_type, image.data)
        }
    })
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Assemble a chat completions request body
pub fn build_chat_payload(
    model: &str,
    system: &str,
    messages: &[Message],
    tools: &[Tool],
    temperature: Option<f32>,
    max_tokens: Option<i32>,
) -> Result<Value> {
    let mut messages_array = vec![json!({"role": "system", "content": system})];
    messages_array.extend(messages_to_openai_spec(messages));

    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(model));
    payload.insert("messages".to_string(), json!(messages_array));

    if !tools.is_empty() {
        payload.insert("tools".to_string(), json!(tools_to_openai_spec(tools)?));
    }
    if let Some(temp) = temperature {
        payload.insert("temperature".to_string(), json!(temp));
    }
    if let Some(tokens) = max_tokens {
        payload.insert("max_tokens".to_string(), json!(tokens));
    }

    Ok(Value::Object(payload))
}

/// Build a tool request from the raw pieces of an OpenAI tool call
pub fn parse_tool_request(id: String, function_name: &str, arguments: &str) -> ToolRequest {
    if !is_valid_function_name(function_name) {
        let error = AgentError::ToolNotFound(format!(
            "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
            function_name
        ));
        return ToolRequest {
            id,
            tool_call: Err(error),
        };
    }

    // Some servers send an empty string for calls without arguments
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };

    let tool_call = serde_json::from_str::<Value>(arguments)
        .map(|params| ToolCall::new(function_name, params))
        .map_err(|e| {
            AgentError::InvalidParameters(format!(
                "Could not interpret tool use parameters for id {}: {}",
                id, e
            ))
        });

    ToolRequest { id, tool_call }
}

/// Convert OpenAI's API response to internal Message format
pub fn openai_response_to_message(response: Value) -> Result<Message> {
    let original = response["choices"][0]["message"].clone();
    let mut message = Message::assistant();

    if let Some(text) = original.get("content").and_then(|t| t.as_str()) {
        message = message.with_text(text);
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(|t| t.as_array()) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let function_name = tool_call["function"]["name"].as_str().unwrap_or_default();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default();

            message = message.with_content(MessageContent::ToolRequest(parse_tool_request(
                id,
                function_name,
                arguments,
            )));
        }
    }

    Ok(message)
}

/// Read the usage block of a response or stream chunk
pub fn parse_usage(data: &Value) -> Option<Usage> {
    let usage = data.get("usage").filter(|u| u.is_object())?;
    let read = |key: &str| {
        usage
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
    };

    let prompt_tokens = read("prompt_tokens").unwrap_or(0);
    let completion_tokens = read("completion_tokens").unwrap_or(0);
    let total_tokens =
        read("total_tokens").unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(Usage::new(prompt_tokens, completion_tokens, total_tokens))
}

fn sanitize_function_name(name: &str) -> String {
    INVALID_NAME_CHARS.replace_all(name, "_").to_string()
}

fn is_valid_function_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_openai_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ContextLengthExceededError(message))
    } else {
        None
    }
}

/// Collects tool call fragments from streamed chunks. Calls arrive split over
/// many deltas keyed by index; only the first fragment carries id and name.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u64, (String, String, String)>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, fragments: &[Value]) {
        for fragment in fragments {
            let index = fragment["index"].as_u64().unwrap_or(0);
            let entry = self.calls.entry(index).or_default();
            if let Some(id) = fragment["id"].as_str() {
                entry.0.push_str(id);
            }
            if let Some(name) = fragment["function"]["name"].as_str() {
                entry.1.push_str(name);
            }
            if let Some(arguments) = fragment["function"]["arguments"].as_str() {
                entry.2.push_str(arguments);
            }
        }
    }

    /// Completed requests in the order the model issued them
    pub fn finish(self) -> Vec<ToolRequest> {
        self.calls
            .into_iter()
            .map(|(index, (id, name, arguments))| {
                let id = if id.is_empty() {
                    format!("call_{}", index)
                } else {
                    id
                };
                parse_tool_request(id, &name, &arguments)
            })
            .collect()
    }
}
