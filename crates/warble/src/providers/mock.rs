use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{message_to_deltas, Provider, ProviderDelta, Usage};

/// A mock provider that returns pre-configured responses for testing
pub struct MockProvider {
    responses: Arc<Mutex<Vec<Result<Message, String>>>>,
    transcripts: Arc<Mutex<Vec<Vec<Message>>>>,
    usage: Usage,
    delay: Option<Duration>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Message>) -> Self {
        Self::scripted(responses.into_iter().map(Ok).collect())
    }

    /// Responses where an Err fails that model call with the given message
    pub fn scripted(responses: Vec<Result<Message, String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            transcripts: Arc::new(Mutex::new(Vec::new())),
            usage: Usage::default(),
            delay: None,
        }
    }

    /// Usage reported by every call
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Pause before each streamed delta
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The transcripts each call received, in call order
    pub fn transcripts(&self) -> Vec<Vec<Message>> {
        self.transcripts.lock().unwrap().clone()
    }

    fn next_response(&self, messages: &[Message]) -> Result<Message> {
        self.transcripts.lock().unwrap().push(messages.to_vec());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            // Return empty response if no more pre-configured responses
            return Ok(Message::assistant().with_text(""));
        }
        responses.remove(0).map_err(|e| anyhow!(e))
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        _system_prompt: &str,
        messages: &[Message],
        _tools: &[Tool],
    ) -> Result<(Message, Usage)> {
        Ok((self.next_response(messages)?, self.usage))
    }

    fn stream<'a>(
        &'a self,
        _system: &'a str,
        messages: &'a [Message],
        _tools: &'a [Tool],
    ) -> BoxStream<'a, Result<ProviderDelta>> {
        Box::pin(async_stream::try_stream! {
            let message = self.next_response(messages)?;
            for delta in message_to_deltas(message, self.usage) {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                yield delta;
            }
        })
    }
}
