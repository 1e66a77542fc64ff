use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::models::message::{Message, MessageContent, ToolRequest};
use crate::models::tool::Tool;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32, total_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    /// Accumulate another call's usage into this one, saturating at `u32::MAX`
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// One increment of a model response
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderDelta {
    Text(String),
    ToolRequest(ToolRequest),
    Usage(Usage),
}

/// Split a complete response into the deltas a stream would have produced
pub fn message_to_deltas(message: Message, usage: Usage) -> Vec<ProviderDelta> {
    let mut deltas: Vec<ProviderDelta> = message
        .content
        .into_iter()
        .filter_map(|content| match content {
            MessageContent::Text(text) if !text.text.is_empty() => {
                Some(ProviderDelta::Text(text.text))
            }
            MessageContent::ToolRequest(request) => Some(ProviderDelta::ToolRequest(request)),
            _ => None,
        })
        .collect();
    deltas.push(ProviderDelta::Usage(usage));
    deltas
}

/// Base trait for model backends (OpenAI compatible servers, Ollama, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next message from the transcript and the tools on offer
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage)>;

    /// Generate the next message incrementally. Providers that cannot stream
    /// yield the whole response from `complete` at once.
    fn stream<'a>(
        &'a self,
        system: &'a str,
        messages: &'a [Message],
        tools: &'a [Tool],
    ) -> BoxStream<'a, Result<ProviderDelta>> {
        stream_from_complete(self, system, messages, tools)
    }
}

/// Adapt `complete` into a single burst of deltas
pub fn stream_from_complete<'a, P: Provider + ?Sized>(
    provider: &'a P,
    system: &'a str,
    messages: &'a [Message],
    tools: &'a [Tool],
) -> BoxStream<'a, Result<ProviderDelta>> {
    Box::pin(async_stream::try_stream! {
        let (message, usage) = provider.complete(system, messages, tools).await?;
        for delta in message_to_deltas(message, usage) {
            yield delta;
        }
    })
}
